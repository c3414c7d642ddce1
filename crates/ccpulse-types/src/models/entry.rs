use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single usage record, already deduplicated upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    pub timestamp: DateTime<Utc>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Precomputed cost, when the source carried one
    #[serde(rename = "costUSD", default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub request_id: String,
}

impl UsageEntry {
    /// Entry with input/output tokens only, everything else empty
    pub fn new(timestamp: DateTime<Utc>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            timestamp,
            input_tokens,
            output_tokens,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            cost_usd: None,
            model: String::new(),
            message_id: String::new(),
            request_id: String::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_cache(mut self, creation: u64, read: u64) -> Self {
        self.cache_creation_tokens = creation;
        self.cache_read_tokens = read;
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    /// Token counts carried by this entry alone
    pub fn token_counts(&self) -> TokenCounts {
        TokenCounts {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_tokens: self.cache_creation_tokens,
            cache_read_tokens: self.cache_read_tokens,
        }
    }
}

/// Token accumulator for a block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(rename = "cacheCreationInputTokens")]
    pub cache_creation_tokens: u64,
    #[serde(rename = "cacheReadInputTokens")]
    pub cache_read_tokens: u64,
}

impl TokenCounts {
    /// Total tokens (input + output + cache creation + cache read)
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    pub fn add(&mut self, other: &TokenCounts) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }
}
