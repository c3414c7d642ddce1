//! Model-name normalization and per-token-type pricing
//!
//! Pricing is a pure lookup: per-million-token rates for each model family,
//! with cache creation and cache read priced separately.
//!
//! - **Input tokens**: regular input tokens (not cached)
//! - **Output tokens**: generated tokens
//! - **Cache creation tokens**: tokens written to the prompt cache
//! - **Cache read tokens**: tokens served from the prompt cache
//!
//! # Examples
//!
//! ```
//! use ccpulse_core::pricing::{calculate_cost, normalize_model_name};
//! use ccpulse_types::TokenCounts;
//!
//! assert_eq!(normalize_model_name("claude-3-opus-20240229"), "claude-3-opus");
//!
//! let tokens = TokenCounts { input_tokens: 1_000_000, output_tokens: 1_000_000, ..Default::default() };
//! assert_eq!(calculate_cost("claude-3-opus", &tokens), 90.0);
//! ```

use ccpulse_types::TokenCounts;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Model name used by the client for locally generated messages
const SYNTHETIC_MODEL: &str = "<synthetic>";

/// Pricing for one model family, all prices per million tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub cache_creation_price_per_million: f64,
    pub cache_read_price_per_million: f64,
}

const OPUS: ModelPricing = ModelPricing {
    input_price_per_million: 15.0,
    output_price_per_million: 75.0,
    cache_creation_price_per_million: 18.75,
    cache_read_price_per_million: 1.5,
};

const SONNET: ModelPricing = ModelPricing {
    input_price_per_million: 3.0,
    output_price_per_million: 15.0,
    cache_creation_price_per_million: 3.75,
    cache_read_price_per_million: 0.3,
};

const HAIKU: ModelPricing = ModelPricing {
    input_price_per_million: 0.25,
    output_price_per_million: 1.25,
    cache_creation_price_per_million: 0.3,
    cache_read_price_per_million: 0.03,
};

/// Pricing keyed by normalized model name
static PRICING_TABLE: Lazy<HashMap<&'static str, ModelPricing>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("claude-3-opus", OPUS);
    m.insert("claude-3-sonnet", SONNET);
    m.insert("claude-3-haiku", HAIKU);
    m.insert("claude-3-5-sonnet", SONNET);
    m.insert("claude-3-5-haiku", HAIKU);
    m.insert("claude-sonnet-4-20250514", SONNET);
    m.insert("claude-opus-4-20250514", OPUS);
    m
});

/// Fold a raw model id onto its pricing family name.
///
/// Claude 4 ids are kept (lowercased); older ids collapse to their family.
/// Unrecognized names are returned unchanged and an empty name stays empty.
pub fn normalize_model_name(model: &str) -> String {
    if model.is_empty() {
        return String::new();
    }

    let lower = model.to_lowercase();

    const CLAUDE_4_MARKERS: [&str; 6] = [
        "claude-opus-4-",
        "claude-sonnet-4-",
        "claude-haiku-4-",
        "sonnet-4-",
        "opus-4-",
        "haiku-4-",
    ];
    if CLAUDE_4_MARKERS.iter().any(|m| lower.contains(m)) {
        return lower;
    }

    let is_3_5 = lower.contains("3.5") || lower.contains("3-5");

    if lower.contains("opus") {
        if lower.contains("4-") {
            return lower;
        }
        return "claude-3-opus".to_string();
    }
    if lower.contains("sonnet") {
        if lower.contains("4-") {
            return lower;
        }
        if is_3_5 {
            return "claude-3-5-sonnet".to_string();
        }
        return "claude-3-sonnet".to_string();
    }
    if lower.contains("haiku") {
        if is_3_5 {
            return "claude-3-5-haiku".to_string();
        }
        return "claude-3-haiku".to_string();
    }

    model.to_string()
}

/// Get pricing for a model.
///
/// Looks up the normalized name, then the raw name, then falls back on the
/// family named in the id. Unknown models are priced as Sonnet.
pub fn get_pricing(model: &str) -> ModelPricing {
    let normalized = normalize_model_name(model);
    if let Some(p) = PRICING_TABLE.get(normalized.as_str()) {
        return *p;
    }
    if let Some(p) = PRICING_TABLE.get(model) {
        return *p;
    }

    let lower = model.to_lowercase();
    if lower.contains("opus") {
        OPUS
    } else if lower.contains("haiku") {
        HAIKU
    } else {
        SONNET
    }
}

/// Calculate cost in USD for the given tokens, rounded to micro-dollars.
///
/// ```text
/// cost = Σ (tokens_of_type / 1M) × price_of_type
/// ```
pub fn calculate_cost(model: &str, tokens: &TokenCounts) -> f64 {
    if model == SYNTHETIC_MODEL {
        return 0.0;
    }

    let pricing = get_pricing(model);
    let per_million = |count: u64, price: f64| (count as f64 / 1_000_000.0) * price;

    let total = per_million(tokens.input_tokens, pricing.input_price_per_million)
        + per_million(tokens.output_tokens, pricing.output_price_per_million)
        + per_million(
            tokens.cache_creation_tokens,
            pricing.cache_creation_price_per_million,
        )
        + per_million(tokens.cache_read_tokens, pricing.cache_read_price_per_million);

    (total * 1_000_000.0).round() / 1_000_000.0
}
