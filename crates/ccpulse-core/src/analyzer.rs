//! Session windowing and limit-notice detection
//!
//! [`SessionAnalyzer::transform_to_blocks`] rebuilds session blocks from a flat,
//! timestamp-ordered entry stream in a single pass:
//!
//! ```text
//! entries:  |e1 e2  e3 ........ (silence >= duration) ........ e4 e5|
//! blocks:   [09:00 ─── block ───)[gap: e3 → e4][13:00 ─── block ───)
//! ```
//!
//! A block opens on the UTC hour of its first entry and spans the session
//! duration. An entry at or after `end_time`, or after a silence of at least
//! the session duration, opens the next block.

use crate::config::CostMode;
use crate::pricing::{calculate_cost, normalize_model_name};
use ccpulse_types::{BlockContext, LimitDetectionResult, LimitKind, SessionBlock, UsageEntry};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, trace};

/// Phrases that mark an Opus notice as a limit
const OPUS_LIMIT_PHRASES: [&str; 4] = ["rate limit", "limit exceeded", "limit reached", "limit hit"];

static WAIT_MINUTES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)wait\s+(\d+)\s+minutes?").expect("wait pattern is a valid regex")
});

static RESET_EPOCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"limit reached\|(\d+)").expect("reset pattern is a valid regex")
});

pub struct SessionAnalyzer {
    session_duration: Duration,
    cost_mode: CostMode,
}

impl SessionAnalyzer {
    pub fn new(session_duration: Duration) -> Self {
        Self {
            session_duration,
            cost_mode: CostMode::default(),
        }
    }

    pub fn with_cost_mode(mut self, cost_mode: CostMode) -> Self {
        self.cost_mode = cost_mode;
        self
    }

    pub fn session_duration(&self) -> Duration {
        self.session_duration
    }

    /// Build blocks and mark the active ones against the current time
    pub fn transform_to_blocks(&self, entries: &[UsageEntry]) -> Vec<SessionBlock> {
        self.transform_to_blocks_at(entries, Utc::now())
    }

    /// Build blocks, evaluating `is_active` against `now`
    pub fn transform_to_blocks_at(
        &self,
        entries: &[UsageEntry],
        now: DateTime<Utc>,
    ) -> Vec<SessionBlock> {
        let mut blocks = Vec::new();
        let mut current: Option<SessionBlock> = None;

        for entry in entries {
            let starts_new = match &current {
                None => true,
                Some(block) => self.should_start_new_block(block, entry),
            };

            if starts_new {
                if let Some(mut finished) = current.take() {
                    finished.finalize();
                    let gap = self.gap_between(&finished, entry);
                    blocks.push(finished);
                    if let Some(gap) = gap {
                        blocks.push(gap);
                    }
                }
                current = Some(SessionBlock::open(
                    round_to_hour(entry.timestamp),
                    self.session_duration,
                ));
            }

            if let Some(block) = current.as_mut() {
                let model_key = normalize_model_name(if entry.model.is_empty() {
                    "unknown"
                } else {
                    entry.model.as_str()
                });
                let cost = self.entry_cost(entry);
                block.push_entry(entry.clone(), model_key, cost);
            }
        }

        if let Some(mut last) = current {
            last.finalize();
            blocks.push(last);
        }

        mark_active_blocks(&mut blocks, now);

        debug!(
            entries = entries.len(),
            blocks = blocks.len(),
            "Transformed entries into session blocks"
        );
        blocks
    }

    fn should_start_new_block(&self, block: &SessionBlock, entry: &UsageEntry) -> bool {
        if entry.timestamp >= block.end_time {
            return true;
        }
        match block.last_entry_time() {
            Some(last) => entry.timestamp - last >= self.session_duration,
            None => false,
        }
    }

    /// Gap block covering the silence after `finished`, if long enough
    fn gap_between(&self, finished: &SessionBlock, next: &UsageEntry) -> Option<SessionBlock> {
        let last = finished.actual_end_time?;
        if next.timestamp - last >= self.session_duration {
            Some(SessionBlock::gap(last, next.timestamp))
        } else {
            None
        }
    }

    fn entry_cost(&self, entry: &UsageEntry) -> f64 {
        match (self.cost_mode, entry.cost_usd) {
            (CostMode::Cached, cost) => cost.unwrap_or(0.0),
            (CostMode::Auto, Some(cost)) => cost,
            (CostMode::Auto, None) | (CostMode::Calculated, _) => {
                calculate_cost(&entry.model, &entry.token_counts())
            }
        }
    }

    /// Scan raw transcript records for limit notices.
    ///
    /// Records that are malformed or carry unparseable timestamps are skipped.
    pub fn detect_limits(&self, raw_entries: &[Value]) -> Vec<LimitDetectionResult> {
        let limits: Vec<_> = raw_entries
            .iter()
            .filter_map(|raw| match raw.get("type").and_then(Value::as_str) {
                Some("system") => detect_system_limit(raw),
                Some("user") => detect_tool_result_limit(raw),
                _ => None,
            })
            .collect();

        if !limits.is_empty() {
            debug!(count = limits.len(), "Detected limit notices");
        }
        limits
    }

    /// Attach each limit to the non-gap block whose window contains it
    pub fn attach_limits(&self, blocks: &mut [SessionBlock], limits: Vec<LimitDetectionResult>) {
        for limit in limits {
            let target = blocks.iter_mut().find(|b| {
                !b.is_gap && b.start_time <= limit.timestamp && limit.timestamp < b.end_time
            });
            match target {
                Some(block) => block.limit_messages.push(limit),
                None => trace!(timestamp = %limit.timestamp, "Limit outside every block"),
            }
        }
    }
}

impl Default for SessionAnalyzer {
    fn default() -> Self {
        Self::new(Duration::hours(5))
    }
}

/// Truncate to the start of the UTC hour
pub fn round_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

fn mark_active_blocks(blocks: &mut [SessionBlock], now: DateTime<Utc>) {
    for block in blocks.iter_mut() {
        block.is_active = !block.is_gap && block.end_time > now;
    }
}

fn detect_system_limit(raw: &Value) -> Option<LimitDetectionResult> {
    let content = raw.get("content")?.as_str()?;
    let lower = content.to_lowercase();
    if !lower.contains("limit") && !lower.contains("rate") {
        return None;
    }

    let timestamp = parse_timestamp(raw.get("timestamp")?)?;
    let block_context = block_context(raw);

    if is_opus_limit(&lower) {
        let wait_minutes = WAIT_MINUTES_RE
            .captures(content)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok());
        let reset_time = wait_minutes
            .and_then(|m| i64::try_from(m).ok())
            .map(|m| timestamp + Duration::minutes(m));

        return Some(LimitDetectionResult {
            kind: LimitKind::OpusLimit,
            timestamp,
            content: content.to_string(),
            reset_time,
            wait_minutes,
            block_context,
        });
    }

    Some(LimitDetectionResult {
        kind: LimitKind::SystemLimit,
        timestamp,
        content: content.to_string(),
        reset_time: None,
        wait_minutes: None,
        block_context,
    })
}

fn is_opus_limit(lower: &str) -> bool {
    lower.contains("opus")
        && (OPUS_LIMIT_PHRASES.iter().any(|p| lower.contains(p)) || lower.contains("limit"))
}

fn detect_tool_result_limit(raw: &Value) -> Option<LimitDetectionResult> {
    let items = raw.get("message")?.get("content")?.as_array()?;

    let text = items
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("tool_result"))
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .find(|text| text.to_lowercase().contains("limit reached"))?;

    let timestamp = parse_timestamp(raw.get("timestamp")?)?;

    Some(LimitDetectionResult {
        kind: LimitKind::GeneralLimit,
        timestamp,
        content: text.to_string(),
        reset_time: parse_reset_epoch(text),
        wait_minutes: None,
        block_context: block_context(raw),
    })
}

fn parse_reset_epoch(text: &str) -> Option<DateTime<Utc>> {
    let secs = RESET_EPOCH_RE
        .captures(text)?
        .get(1)?
        .as_str()
        .parse::<i64>()
        .ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

fn block_context(raw: &Value) -> BlockContext {
    let field = |a: &str, b: &str| {
        raw.get(a)
            .or_else(|| raw.get(b))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let mut context = BlockContext {
        message_id: field("messageId", "message_id"),
        request_id: field("requestId", "request_id"),
        session_id: field("sessionId", "session_id"),
        version: raw.get("version").and_then(Value::as_str).map(str::to_string),
        model: raw.get("model").and_then(Value::as_str).map(str::to_string),
        usage: None,
        stop_reason: None,
    };

    if let Some(message) = raw.get("message").filter(|m| m.is_object()) {
        if let Some(id) = message.get("id").and_then(Value::as_str) {
            context.message_id = Some(id.to_string());
        }
        if let Some(model) = message.get("model").and_then(Value::as_str) {
            context.model = Some(model.to_string());
        }
        context.usage = Some(
            message
                .get("usage")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default())),
        );
        context.stop_reason = message
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    context
}

/// Parse an RFC3339, naive ISO (as UTC) or epoch-seconds timestamp
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9).round() as u32;
            Utc.timestamp_opt(whole, nanos.min(999_999_999)).single()
        }
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}
