//! Adaptive token limit from historical sessions
//!
//! Completed sessions that came close to one of the known plan limits are
//! treated as quota hits. The 90th percentile of their totals becomes the
//! limit for the custom plan, floored at a configured minimum.

use crate::config::P90Settings;
use ccpulse_types::SessionBlock;
use chrono::Utc;
use moka::sync::Cache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::debug;

/// `(time bucket, content hash)`
type CacheKey = (u64, u64);

/// P90 limit estimator with a time-bucketed result cache.
///
/// Identical block sets within the same TTL bucket reuse the previous result.
/// The cache is bounded and also expires entries after the TTL.
pub struct P90Estimator {
    settings: P90Settings,
    cache: Cache<CacheKey, u64>,
}

impl P90Estimator {
    pub fn new(settings: P90Settings) -> Self {
        let ttl = Duration::from_secs(settings.cache_ttl_secs.max(1));
        let cache = Cache::builder()
            .max_capacity(settings.cache_capacity)
            .time_to_live(ttl)
            .build();
        Self { settings, cache }
    }

    pub fn settings(&self) -> &P90Settings {
        &self.settings
    }

    /// Estimate the limit, `None` for empty input
    pub fn calculate_p90_limit(&self, blocks: &[SessionBlock], use_cache: bool) -> Option<u64> {
        if blocks.is_empty() {
            return None;
        }

        if !use_cache {
            return Some(self.compute(blocks));
        }

        let key = self.cache_key(blocks);
        if let Some(hit) = self.cache.get(&key) {
            debug!(bucket = key.0, limit = hit, "P90 cache hit");
            return Some(hit);
        }

        let limit = self.compute(blocks);
        self.cache.insert(key, limit);
        Some(limit)
    }

    /// Number of cached results
    pub fn cached_entries(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    fn cache_key(&self, blocks: &[SessionBlock]) -> CacheKey {
        let ttl = self.settings.cache_ttl_secs.max(1);
        let bucket = Utc::now().timestamp().max(0) as u64 / ttl;

        let mut hasher = DefaultHasher::new();
        for block in blocks {
            (block.is_gap, block.is_active, block.total_tokens()).hash(&mut hasher);
        }
        (bucket, hasher.finish())
    }

    fn compute(&self, blocks: &[SessionBlock]) -> u64 {
        let min_limit = self.settings.default_min_limit;
        let completed = blocks.iter().filter(|b| !b.is_gap && !b.is_active);

        let mut totals: Vec<u64> = completed
            .clone()
            .map(SessionBlock::total_tokens)
            .filter(|&t| t > 0 && self.hit_a_limit(t))
            .collect();

        if totals.is_empty() {
            totals = completed
                .map(SessionBlock::total_tokens)
                .filter(|&t| t > 0)
                .collect();
        }

        if totals.is_empty() {
            return min_limit;
        }

        totals.sort_unstable();
        let p90 = percentile_90(&totals);
        debug!(sessions = totals.len(), p90, "Computed P90 limit");

        (p90.trunc().max(0.0) as u64).max(min_limit)
    }

    fn hit_a_limit(&self, tokens: u64) -> bool {
        self.settings
            .common_limits
            .iter()
            .any(|&limit| tokens as f64 >= limit as f64 * self.settings.limit_threshold)
    }
}

/// Ninth cut point of the exclusive 10-quantile method over sorted data.
///
/// Positions are `i·(n+1)/10` with clamping to the inner interval, so small
/// samples extrapolate linearly past the two outermost points.
fn percentile_90(sorted: &[u64]) -> f64 {
    const N: i64 = 10;
    const I: i64 = 9;

    let len = sorted.len() as i64;
    if len == 1 {
        return sorted[0] as f64;
    }

    let m = len + 1;
    let j = (I * m / N).clamp(1, len - 1);
    let delta = I * m - j * N;

    let lo = sorted[(j - 1) as usize] as f64;
    let hi = sorted[j as usize] as f64;
    (lo * (N - delta) as f64 + hi * delta as f64) / N as f64
}
