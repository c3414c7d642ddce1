//! TTL-cached, retrying access to the usage source
//!
//! `get_data` never fails: retryable errors are retried with exponential
//! backoff, format errors abort at once, and on failure the last good result
//! is served even when stale. Only a source that has never produced data
//! yields `None`.

use crate::analyzer::SessionAnalyzer;
use crate::burn_rate::{calculate_burn_rate, project_block_usage};
use crate::config::{MonitorConfig, RetrySettings};
use crate::error::{panic_message, CoreError, FetchError};
use crate::report::{ErrorReport, ErrorReporter, TracingReporter};
use crate::source::UsageSource;
use ccpulse_types::SessionBlock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const COMPONENT: &str = "data_manager";

/// Analyzed result of one successful fetch
#[derive(Debug, Clone)]
pub struct UsageData {
    pub blocks: Vec<SessionBlock>,
    pub entries_count: usize,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub fetched_at: DateTime<Utc>,
}

impl UsageData {
    pub fn from_blocks(blocks: Vec<SessionBlock>, fetched_at: DateTime<Utc>) -> Self {
        let real = || blocks.iter().filter(|b| !b.is_gap);
        let entries_count = real().map(|b| b.entries.len()).sum();
        let total_tokens = real().map(SessionBlock::total_tokens).sum();
        let total_cost = real().map(SessionBlock::cost).sum();
        Self {
            entries_count,
            total_tokens,
            total_cost,
            fetched_at,
            blocks,
        }
    }

    /// First active block, if any
    pub fn active_block(&self) -> Option<&SessionBlock> {
        self.blocks.iter().find(|b| b.is_active)
    }

    /// `{ "blocks": [...], "metadata": {...} }` with burn rate and projection
    /// filled in for active blocks
    pub fn to_wire(&self, now: DateTime<Utc>) -> Result<Value, CoreError> {
        let blocks = self
            .blocks
            .iter()
            .map(|block| {
                let mut wire = block.to_wire();
                if block.is_active {
                    wire.burn_rate = calculate_burn_rate(block);
                    wire.projection = project_block_usage(block, now);
                }
                wire
            })
            .collect::<Vec<_>>();

        let blocks = serde_json::to_value(blocks).map_err(|source| CoreError::Serialize {
            message: "session blocks".to_string(),
            source,
        })?;

        Ok(json!({
            "blocks": blocks,
            "metadata": {
                "generated_at": now,
                "entries_count": self.entries_count,
                "total_tokens": self.total_tokens,
                "total_cost": self.total_cost,
                "fetched_at": self.fetched_at,
            },
        }))
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default)]
pub struct DataSourceMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub last_error: Option<String>,
    pub last_successful_fetch: Option<DateTime<Utc>>,
}

struct CacheSlot {
    data: Arc<UsageData>,
    stored_at: Instant,
}

pub struct CachingDataSource {
    source: Box<dyn UsageSource>,
    analyzer: SessionAnalyzer,
    cache_ttl: Duration,
    retry: RetrySettings,
    reporter: Arc<dyn ErrorReporter>,
    cache: Mutex<Option<CacheSlot>>,
    /// Serializes refreshes; the cache lock is only held for reads and swaps
    refresh_lock: Mutex<()>,
    metrics: Mutex<DataSourceMetrics>,
}

impl CachingDataSource {
    pub fn new(source: impl UsageSource + 'static, analyzer: SessionAnalyzer) -> Self {
        Self {
            source: Box::new(source),
            analyzer,
            cache_ttl: Duration::from_secs(5),
            retry: RetrySettings::default(),
            reporter: Arc::new(TracingReporter),
            cache: Mutex::new(None),
            refresh_lock: Mutex::new(()),
            metrics: Mutex::new(DataSourceMetrics::default()),
        }
    }

    /// Analyzer, TTL and retry policy taken from `config`
    pub fn from_config(source: impl UsageSource + 'static, config: &MonitorConfig) -> Self {
        let analyzer =
            SessionAnalyzer::new(config.session_duration()).with_cost_mode(config.cost_mode);
        Self::new(source, analyzer)
            .with_cache_ttl(config.cache_ttl())
            .with_retry(config.retry.clone())
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn analyzer(&self) -> &SessionAnalyzer {
        &self.analyzer
    }

    /// Cached data if fresh, otherwise a refresh with stale fallback
    pub fn get_data(&self, force_refresh: bool) -> Option<Arc<UsageData>> {
        if !force_refresh {
            if let Some(data) = self.fresh_cached() {
                self.metrics.lock().cache_hits += 1;
                debug!(age_secs = self.cache_age(), "Serving cached usage data");
                return Some(data);
            }
        }

        let _refresh = self.refresh_lock.lock();

        // Another caller may have refreshed while we waited
        if !force_refresh {
            if let Some(data) = self.fresh_cached() {
                self.metrics.lock().cache_hits += 1;
                return Some(data);
            }
        }
        self.metrics.lock().cache_misses += 1;

        let attempts = self.retry.max_attempts.max(1);
        for attempt in 0..attempts {
            match self.fetch() {
                Ok(data) => {
                    let data = Arc::new(data);
                    *self.cache.lock() = Some(CacheSlot {
                        data: Arc::clone(&data),
                        stored_at: Instant::now(),
                    });
                    self.metrics.lock().last_successful_fetch = Some(Utc::now());
                    info!(
                        blocks = data.blocks.len(),
                        entries = data.entries_count,
                        "Usage data refreshed"
                    );
                    return Some(data);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Usage fetch attempt failed");
                    self.metrics.lock().last_error = Some(e.to_string());
                    self.reporter.report_error(
                        &e,
                        ErrorReport::new(COMPONENT)
                            .context(e.context_name())
                            .data(json!({ "attempt": attempt + 1, "max_attempts": attempts })),
                    );

                    if !e.is_retryable() {
                        break;
                    }
                    if attempt + 1 < attempts {
                        let delay = self.retry.delay_for(attempt);
                        debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying usage fetch after delay"
                        );
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        let stale = self.cache.lock().as_ref().map(|slot| Arc::clone(&slot.data));
        match &stale {
            Some(_) => warn!(age_secs = self.cache_age(), "Serving stale usage data"),
            None => warn!("No usage data available"),
        }
        stale
    }

    /// Drop the cached result unconditionally
    pub fn invalidate_cache(&self) {
        *self.cache.lock() = None;
        debug!("Usage cache invalidated");
    }

    /// Seconds since the cache was last written, `f64::INFINITY` if never
    pub fn cache_age(&self) -> f64 {
        self.cache
            .lock()
            .as_ref()
            .map(|slot| slot.stored_at.elapsed().as_secs_f64())
            .unwrap_or(f64::INFINITY)
    }

    pub fn metrics(&self) -> DataSourceMetrics {
        self.metrics.lock().clone()
    }

    fn fresh_cached(&self) -> Option<Arc<UsageData>> {
        let cache = self.cache.lock();
        let slot = cache.as_ref()?;
        (slot.stored_at.elapsed() <= self.cache_ttl).then(|| Arc::clone(&slot.data))
    }

    fn fetch(&self) -> Result<UsageData, FetchError> {
        let batch = catch_unwind(AssertUnwindSafe(|| self.source.load())).map_err(|payload| {
            FetchError::unexpected(format!(
                "usage source panicked: {}",
                panic_message(payload.as_ref())
            ))
        })??;

        let mut blocks = self.analyzer.transform_to_blocks(&batch.entries);
        let limits = self.analyzer.detect_limits(&batch.raw_records);
        self.analyzer.attach_limits(&mut blocks, limits);

        Ok(UsageData::from_blocks(blocks, Utc::now()))
    }
}
