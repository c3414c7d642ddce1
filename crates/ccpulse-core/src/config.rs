//! Monitor configuration
//!
//! Loaded from `<config_dir>/ccpulse/config.toml` when present. Every field has
//! a default, so a partial file (or none at all) is valid.

use crate::error::CoreError;
use crate::plans::Plan;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How an entry's cost is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostMode {
    /// Use the precomputed cost when present, otherwise price the tokens
    #[default]
    Auto,
    /// Only trust precomputed costs; missing means zero
    Cached,
    /// Always price the tokens, ignoring precomputed costs
    Calculated,
}

/// Retry policy for the usage source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for each one after
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
        }
    }
}

impl RetrySettings {
    /// Backoff applied after the failed attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

/// P90 estimator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P90Settings {
    /// Known plan limits used to recognise quota-exhausting sessions
    pub common_limits: Vec<u64>,
    /// Fraction of a limit that counts as hitting it
    pub limit_threshold: f64,
    pub default_min_limit: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
}

impl Default for P90Settings {
    fn default() -> Self {
        Self {
            common_limits: vec![44_000, 88_000, 220_000, 880_000],
            limit_threshold: 0.95,
            default_min_limit: 44_000,
            cache_ttl_secs: 3_600,
            cache_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub plan: Plan,
    /// Explicit token limit for the custom plan
    pub custom_limit_tokens: Option<u64>,
    pub update_interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub session_duration_hours: u32,
    /// Bound on how long `stop()` waits for the worker
    pub stop_timeout_secs: u64,
    /// Oldest sessions are dropped past this many
    pub max_history_entries: usize,
    pub cost_mode: CostMode,
    pub retry: RetrySettings,
    pub p90: P90Settings,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            plan: Plan::default(),
            custom_limit_tokens: None,
            update_interval_secs: 10,
            cache_ttl_secs: 5,
            session_duration_hours: 5,
            stop_timeout_secs: 5,
            max_history_entries: 1_000,
            cost_mode: CostMode::default(),
            retry: RetrySettings::default(),
            p90: P90Settings::default(),
        }
    }
}

impl MonitorConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ccpulse").join("config.toml"))
    }

    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&content).map_err(|source| CoreError::ConfigParse {
            path: path.to_path_buf(),
            message: source.message().to_string(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, CoreError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |message: &str| {
            Err(CoreError::InvalidConfig {
                message: message.to_string(),
            })
        };

        if self.update_interval_secs == 0 {
            return invalid("update_interval_secs must be greater than 0");
        }
        if self.session_duration_hours == 0 {
            return invalid("session_duration_hours must be greater than 0");
        }
        if self.max_history_entries == 0 {
            return invalid("max_history_entries must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(self.p90.limit_threshold > 0.0 && self.p90.limit_threshold <= 1.0) {
            return invalid("p90.limit_threshold must be in (0, 1]");
        }
        if self.p90.common_limits.is_empty() {
            return invalid("p90.common_limits must not be empty");
        }
        if self.custom_limit_tokens == Some(0) {
            return invalid("custom_limit_tokens must be greater than 0");
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn session_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.session_duration_hours))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}
