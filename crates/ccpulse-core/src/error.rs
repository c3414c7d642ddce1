//! Error types for ccpulse-core
//!
//! Two hierarchies: [`FetchError`] classifies failures of the usage source so
//! the data source can decide whether to retry, and [`CoreError`] covers
//! everything else the engine can surface.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for ccpulse operations
#[derive(Error, Debug)]
pub enum CoreError {
    // ===================
    // Config Errors
    // ===================
    #[error("Failed to read config file: {path}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ConfigParse {
        path: PathBuf,
        message: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unknown plan: {name}")]
    UnknownPlan { name: String },

    // ===================
    // Serialization
    // ===================
    #[error("Failed to serialize snapshot: {message}")]
    Serialize {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    // ===================
    // Worker Errors
    // ===================
    #[error("Failed to spawn monitoring thread")]
    WorkerSpawn {
        #[source]
        source: std::io::Error,
    },

    #[error("Monitoring thread did not stop within {timeout_secs}s")]
    StopTimeout { timeout_secs: u64 },

    #[error("Monitoring cycle panicked: {message}")]
    CyclePanicked { message: String },

    // ===================
    // Callback Errors
    // ===================
    #[error("Callback failed: {message}")]
    CallbackFailed { message: String },

    #[error("Callback panicked: {message}")]
    CallbackPanicked { message: String },
}

/// Failure of a single load from the usage source.
///
/// `Format` errors are deterministic and never retried.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Usage source not accessible: {message}")]
    Access {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Malformed usage data: {message}")]
    Format { message: String },

    #[error("Unexpected error while loading usage: {message}")]
    Unexpected { message: String },
}

impl FetchError {
    pub fn access(message: impl Into<String>) -> Self {
        Self::Access {
            message: message.into(),
            source: None,
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Format { .. })
    }

    /// Context name used when reporting this error
    pub fn context_name(&self) -> &'static str {
        match self {
            Self::Access { .. } => "access_error",
            Self::Format { .. } => "format_error",
            Self::Unexpected { .. } => "unexpected_error",
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(source: std::io::Error) -> Self {
        Self::Access {
            message: source.to_string(),
            source: Some(source),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Format {
            message: err.to_string(),
        }
    }
}

/// Render a panic payload for logging
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
