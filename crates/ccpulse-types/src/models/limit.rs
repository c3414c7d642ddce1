use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of limit notice found in the raw transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Opus-specific rate limit, may carry a wait time
    OpusLimit,
    /// Any other system-level limit or rate notice
    SystemLimit,
    /// "limit reached" reported through a tool result
    GeneralLimit,
}

/// Identifiers of the record a limit notice was found in
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// A detected limit notice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitDetectionResult {
    #[serde(rename = "type")]
    pub kind: LimitKind,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_minutes: Option<u64>,
    #[serde(default)]
    pub block_context: BlockContext,
}
