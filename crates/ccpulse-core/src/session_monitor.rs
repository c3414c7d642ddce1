//! Snapshot validation and session-change detection
//!
//! The source is pull-only, so session changes are found by diffing the
//! active block id between consecutive snapshots:
//!
//! ```text
//!            active block appears               active id changes
//! NoSession ───────────────────────► Active(a) ─────────────────────► Active(b)
//!     ▲                                  │          (end a, start b)
//!     └──────── no active block ─────────┘
//! ```

use crate::error::{panic_message, CoreError};
use crate::report::{ErrorReport, ErrorReporter, TracingReporter};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{info, warn};

/// Session lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    SessionStart,
    SessionEnd,
}

impl SessionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(event, session_id, session_data)`; data is `None` for session end
pub type SessionCallback =
    Box<dyn Fn(SessionEvent, &str, Option<&Value>) -> anyhow::Result<()> + Send + Sync>;

/// A session seen by the monitor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub started_at: Option<String>,
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    NoSession,
    Active { id: String },
}

const DEFAULT_MAX_HISTORY: usize = 1_000;

pub struct SessionMonitor {
    state: SessionState,
    callbacks: Vec<SessionCallback>,
    history: VecDeque<SessionRecord>,
    max_history: usize,
    reporter: Arc<dyn ErrorReporter>,
}

impl SessionMonitor {
    pub fn new() -> Self {
        Self {
            state: SessionState::NoSession,
            callbacks: Vec::new(),
            history: VecDeque::new(),
            max_history: DEFAULT_MAX_HISTORY,
            reporter: Arc::new(TracingReporter),
        }
    }

    /// Keep at most `max` session records, dropping the oldest
    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = max.max(1);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Structural check of a wire snapshot. Unknown fields are accepted.
    pub fn validate_data(&self, data: Option<&Value>) -> (bool, Vec<String>) {
        let Some(data) = data.filter(|d| !d.is_null()) else {
            return (false, vec!["No data provided".to_string()]);
        };
        let Some(map) = data.as_object() else {
            return (false, vec!["Data must be a dictionary".to_string()]);
        };

        let mut errors = Vec::new();
        match map.get("blocks") {
            None => errors.push("Missing required key: blocks".to_string()),
            Some(Value::Array(blocks)) => {
                for (index, block) in blocks.iter().enumerate() {
                    validate_block(block, index, &mut errors);
                }
            }
            Some(_) => errors.push("blocks must be a list".to_string()),
        }

        (errors.is_empty(), errors)
    }

    /// Validate `data` and, when valid, diff its active block against the
    /// tracked session
    pub fn update(&mut self, data: &Value) -> (bool, Vec<String>) {
        let (valid, errors) = self.validate_data(Some(data));
        if !valid {
            warn!(errors = ?errors, "Snapshot failed validation");
            return (valid, errors);
        }

        let active = data
            .get("blocks")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b.get("isActive").and_then(Value::as_bool).unwrap_or(false))
            });

        let current = self.current_session_id().map(str::to_string);
        match active {
            Some(block) => {
                let new_id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                if current.as_deref() != Some(new_id) {
                    self.on_session_change(new_id.to_string(), block);
                }
            }
            None if current.is_some() => self.on_session_end(),
            None => {}
        }

        (valid, errors)
    }

    pub fn register_callback(&mut self, callback: SessionCallback) {
        self.callbacks.push(callback);
    }

    /// Remove all callbacks
    pub fn clear_callbacks(&mut self) {
        self.callbacks.clear();
    }

    pub fn current_session_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Active { id } => Some(id),
            SessionState::NoSession => None,
        }
    }

    pub fn session_count(&self) -> usize {
        self.history.len()
    }

    /// Oldest first
    pub fn session_history(&self) -> impl Iterator<Item = &SessionRecord> {
        self.history.iter()
    }

    fn on_session_change(&mut self, new_id: String, block: &Value) {
        if let SessionState::Active { id } = &self.state {
            info!(from = %id, to = %new_id, "Session changed");
            self.on_session_end();
        } else {
            info!(session_id = %new_id, "New session started");
        }

        if self.history.len() == self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(SessionRecord {
            id: new_id.clone(),
            started_at: block.get("startTime").and_then(Value::as_str).map(str::to_string),
            tokens: block.get("totalTokens").and_then(Value::as_u64).unwrap_or(0),
            cost: block.get("costUSD").and_then(Value::as_f64).unwrap_or(0.0),
        });
        self.state = SessionState::Active { id: new_id.clone() };
        self.notify(SessionEvent::SessionStart, &new_id, Some(block));
    }

    fn on_session_end(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::NoSession);
        if let SessionState::Active { id } = previous {
            info!(session_id = %id, "Session ended");
            self.notify(SessionEvent::SessionEnd, &id, None);
        }
    }

    fn notify(&self, event: SessionEvent, session_id: &str, data: Option<&Value>) {
        for (index, callback) in self.callbacks.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(event, session_id, data)));
            let err = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => CoreError::CallbackFailed {
                    message: format!("{e:#}"),
                },
                Err(payload) => CoreError::CallbackPanicked {
                    message: panic_message(payload.as_ref()),
                },
            };
            warn!(index, event = %event, error = %err, "Session callback failed");
            self.reporter.report_error(
                &err,
                ErrorReport::new("session_monitor")
                    .context("callback_error")
                    .tag("event", event.as_str()),
            );
        }
    }
}

impl Default for SessionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_block(block: &Value, index: usize, errors: &mut Vec<String>) {
    let Some(map) = block.as_object() else {
        errors.push(format!("Block {index} must be a dictionary"));
        return;
    };

    for field in ["id", "isActive", "totalTokens", "costUSD"] {
        if !map.contains_key(field) {
            errors.push(format!("Block {index} missing required field: {field}"));
        }
    }
    if map.get("totalTokens").is_some_and(|v| !v.is_number()) {
        errors.push(format!("Block {index} totalTokens must be numeric"));
    }
    if map.get("costUSD").is_some_and(|v| !v.is_number()) {
        errors.push(format!("Block {index} costUSD must be numeric"));
    }
    if map.get("isActive").is_some_and(|v| !v.is_boolean()) {
        errors.push(format!("Block {index} isActive must be boolean"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::testing::RecordingReporter;
    use parking_lot::Mutex;
    use serde_json::json;

    fn snapshot(blocks: Value) -> Value {
        json!({ "blocks": blocks })
    }

    fn block(id: &str, active: bool) -> Value {
        json!({ "id": id, "isActive": active, "totalTokens": 100, "costUSD": 0.5, "startTime": "2026-01-01T10:00:00Z" })
    }

    fn recorder(monitor: &mut SessionMonitor) -> Arc<Mutex<Vec<(SessionEvent, String, bool)>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        monitor.register_callback(Box::new(move |event, id, data| {
            sink.lock().push((event, id.to_string(), data.is_some()));
            Ok(())
        }));
        events
    }

    #[test]
    fn test_validate_none_and_non_object() {
        let monitor = SessionMonitor::new();

        let (valid, errors) = monitor.validate_data(None);
        assert!(!valid);
        assert_eq!(errors, vec!["No data provided"]);

        let (valid, errors) = monitor.validate_data(Some(&json!([1, 2])));
        assert!(!valid);
        assert_eq!(errors, vec!["Data must be a dictionary"]);
    }

    #[test]
    fn test_validate_blocks_shape() {
        let monitor = SessionMonitor::new();

        let (valid, errors) = monitor.validate_data(Some(&json!({ "other": 1 })));
        assert!(!valid);
        assert_eq!(errors, vec!["Missing required key: blocks"]);

        let (valid, errors) = monitor.validate_data(Some(&json!({ "blocks": "nope" })));
        assert!(!valid);
        assert_eq!(errors, vec!["blocks must be a list"]);
    }

    #[test]
    fn test_validate_block_fields() {
        let monitor = SessionMonitor::new();
        let data = snapshot(json!([
            { "id": "a", "isActive": "yes", "totalTokens": "many" },
            42
        ]));

        let (valid, errors) = monitor.validate_data(Some(&data));
        assert!(!valid);
        assert!(errors.contains(&"Block 0 missing required field: costUSD".to_string()));
        assert!(errors.contains(&"Block 0 totalTokens must be numeric".to_string()));
        assert!(errors.contains(&"Block 0 isActive must be boolean".to_string()));
        assert!(errors.contains(&"Block 1 must be a dictionary".to_string()));
    }

    #[test]
    fn test_validate_accepts_unknown_fields() {
        let monitor = SessionMonitor::new();
        let mut b = block("a", true);
        b["extra"] = json!({ "nested": true });
        let data = json!({ "blocks": [b], "metadata": {} });

        assert_eq!(monitor.validate_data(Some(&data)), (true, vec![]));
    }

    #[test]
    fn test_session_start_change_and_end() {
        let mut monitor = SessionMonitor::new();
        let events = recorder(&mut monitor);

        monitor.update(&snapshot(json!([block("a", true)])));
        assert_eq!(monitor.current_session_id(), Some("a"));

        // Same active block: no new events
        monitor.update(&snapshot(json!([block("a", true)])));

        monitor.update(&snapshot(json!([block("a", false), block("b", true)])));
        assert_eq!(monitor.current_session_id(), Some("b"));

        monitor.update(&snapshot(json!([block("b", false)])));
        assert_eq!(monitor.current_session_id(), None);
        assert_eq!(monitor.session_count(), 2);

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                (SessionEvent::SessionStart, "a".to_string(), true),
                (SessionEvent::SessionEnd, "a".to_string(), false),
                (SessionEvent::SessionStart, "b".to_string(), true),
                (SessionEvent::SessionEnd, "b".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_invalid_update_keeps_state() {
        let mut monitor = SessionMonitor::new();
        monitor.update(&snapshot(json!([block("a", true)])));

        let (valid, _) = monitor.update(&json!({ "blocks": 7 }));
        assert!(!valid);
        assert_eq!(monitor.current_session_id(), Some("a"));
    }

    #[test]
    fn test_history_records_block_totals() {
        let mut monitor = SessionMonitor::new();
        monitor.update(&snapshot(json!([block("a", true)])));

        let record = monitor.session_history().next().unwrap();
        assert_eq!(record.id, "a");
        assert_eq!(record.tokens, 100);
        assert_eq!(record.cost, 0.5);
        assert_eq!(record.started_at.as_deref(), Some("2026-01-01T10:00:00Z"));
    }

    #[test]
    fn test_history_drops_oldest_past_cap() {
        let mut monitor = SessionMonitor::new().with_max_history(2);
        for id in ["a", "b", "c"] {
            monitor.update(&snapshot(json!([block(id, true)])));
        }

        let ids: Vec<_> = monitor.session_history().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(monitor.session_count(), 2);
        assert_eq!(monitor.current_session_id(), Some("c"));
    }

    #[test]
    fn test_failing_callbacks_are_isolated() {
        let reporter = Arc::new(RecordingReporter::default());
        let mut monitor = SessionMonitor::new().with_reporter(reporter.clone());
        monitor.register_callback(Box::new(|_, _, _| anyhow::bail!("consumer down")));
        monitor.register_callback(Box::new(|_, _, _| panic!("consumer crashed")));
        let events = recorder(&mut monitor);

        let (valid, _) = monitor.update(&snapshot(json!([block("a", true)])));

        assert!(valid);
        assert_eq!(events.lock().len(), 1);
        assert_eq!(reporter.reports.lock().len(), 2);
        assert!(reporter.reports.lock()[1].2.contains("consumer crashed"));
    }
}
