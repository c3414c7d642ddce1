use super::entry::{TokenCounts, UsageEntry};
use super::limit::LimitDetectionResult;
use super::rate::{BurnRate, UsageProjection};
use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregates for one normalized model inside a block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
    pub entries_count: usize,
}

impl ModelStats {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

/// A bounded window of usage activity.
///
/// Non-gap blocks start on a UTC hour and span exactly the session duration.
/// Gap blocks mark silence between two real blocks and never carry usage.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBlock {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Timestamp of the last entry, set on finalize
    pub actual_end_time: Option<DateTime<Utc>>,
    pub entries: Vec<UsageEntry>,
    pub token_counts: TokenCounts,
    pub cost_usd: BigDecimal,
    pub per_model_stats: BTreeMap<String, ModelStats>,
    /// Distinct normalized model names, in order of first appearance
    pub models: Vec<String>,
    pub sent_messages_count: usize,
    pub is_gap: bool,
    pub is_active: bool,
    pub limit_messages: Vec<LimitDetectionResult>,
}

impl SessionBlock {
    /// Open a new block at `start_time` (expected to be hour-aligned)
    pub fn open(start_time: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            id: start_time.to_rfc3339(),
            start_time,
            end_time: start_time + duration,
            actual_end_time: None,
            entries: Vec::new(),
            token_counts: TokenCounts::default(),
            cost_usd: BigDecimal::zero(),
            per_model_stats: BTreeMap::new(),
            models: Vec::new(),
            sent_messages_count: 0,
            is_gap: false,
            is_active: false,
            limit_messages: Vec::new(),
        }
    }

    /// Synthetic gap spanning `[from, to]`
    pub fn gap(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            id: format!("gap-{}", from.to_rfc3339()),
            start_time: from,
            end_time: to,
            is_gap: true,
            ..Self::open(from, Duration::zero())
        }
    }

    /// Append an entry under `model_key` and add `cost` to the accumulators
    pub fn push_entry(&mut self, entry: UsageEntry, model_key: String, cost: f64) {
        let counts = entry.token_counts();
        self.token_counts.add(&counts);
        self.cost_usd += decimal_from_f64(cost);

        let stats = self.per_model_stats.entry(model_key.clone()).or_default();
        stats.input_tokens += counts.input_tokens;
        stats.output_tokens += counts.output_tokens;
        stats.cache_creation_tokens += counts.cache_creation_tokens;
        stats.cache_read_tokens += counts.cache_read_tokens;
        stats.cost_usd += cost;
        stats.entries_count += 1;

        if !model_key.is_empty() && !self.models.contains(&model_key) {
            self.models.push(model_key);
        }

        self.sent_messages_count += 1;
        self.entries.push(entry);
    }

    /// Close the block: `actual_end_time` becomes the last entry's timestamp
    pub fn finalize(&mut self) {
        if let Some(last) = self.entries.last() {
            self.actual_end_time = Some(last.timestamp);
        }
        self.sent_messages_count = self.entries.len();
    }

    pub fn last_entry_time(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|e| e.timestamp)
    }

    pub fn total_tokens(&self) -> u64 {
        self.token_counts.total()
    }

    pub fn cost(&self) -> f64 {
        self.cost_usd.to_f64().unwrap_or(0.0)
    }

    /// Elapsed minutes from start to actual end (or nominal end), at least 1.0
    pub fn duration_minutes(&self) -> f64 {
        let end = self.actual_end_time.unwrap_or(self.end_time);
        let minutes = (end - self.start_time).num_milliseconds() as f64 / 60_000.0;
        minutes.max(1.0)
    }

    /// Wire form without the derived burn rate and projection
    pub fn to_wire(&self) -> SessionBlockWire {
        SessionBlockWire {
            id: self.id.clone(),
            is_active: self.is_active,
            is_gap: self.is_gap,
            start_time: self.start_time,
            end_time: self.end_time,
            actual_end_time: self.actual_end_time,
            token_counts: self.token_counts,
            total_tokens: self.total_tokens(),
            cost_usd: self.cost(),
            models: self.models.clone(),
            per_model_stats: self.per_model_stats.clone(),
            sent_messages_count: self.sent_messages_count,
            duration_minutes: self.duration_minutes(),
            entries: self.entries.clone(),
            burn_rate: None,
            projection: None,
            limit_messages: self.limit_messages.clone(),
        }
    }
}

/// Convert through the shortest decimal representation so `0.1` stays `0.1`
fn decimal_from_f64(value: f64) -> BigDecimal {
    value.to_string().parse().unwrap_or_default()
}

/// camelCase block shape handed to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBlockWire {
    pub id: String,
    pub is_active: bool,
    pub is_gap: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub actual_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_counts: TokenCounts,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(rename = "costUSD", default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub per_model_stats: BTreeMap<String, ModelStats>,
    #[serde(default)]
    pub sent_messages_count: usize,
    #[serde(default)]
    pub duration_minutes: f64,
    #[serde(default)]
    pub entries: Vec<UsageEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burn_rate: Option<BurnRate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<UsageProjection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub limit_messages: Vec<LimitDetectionResult>,
}
