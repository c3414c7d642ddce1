//! Fire-and-forget error reporting
//!
//! Components never propagate recoverable failures; they hand them to an
//! [`ErrorReporter`] together with where they happened.

use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use tracing::error;

/// Where an error happened and what was going on
#[derive(Debug, Clone, Default)]
pub struct ErrorReport {
    pub component: &'static str,
    pub context_name: Option<&'static str>,
    pub context_data: Option<Value>,
    pub tags: BTreeMap<String, String>,
}

impl ErrorReport {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            ..Default::default()
        }
    }

    pub fn context(mut self, name: &'static str) -> Self {
        self.context_name = Some(name);
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.context_data = Some(data);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Sink for errors that must not interrupt the caller
pub trait ErrorReporter: Send + Sync {
    fn report_error(&self, error: &(dyn Error + 'static), report: ErrorReport);
}

/// Default reporter: one structured `error!` event per report
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report_error(&self, err: &(dyn Error + 'static), report: ErrorReport) {
        let context_data = report
            .context_data
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default();

        error!(
            component = report.component,
            context = report.context_name.unwrap_or("none"),
            context_data = %context_data,
            tags = ?report.tags,
            error = %err,
            "Reported error"
        );
    }
}
