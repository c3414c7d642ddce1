//! Usage sources
//!
//! A [`UsageSource`] produces one deduplicated, timestamp-ordered batch of
//! entries per load, plus the raw records limit detection needs. The
//! data source treats it as a black box and only inspects the error class.

use crate::analyzer::parse_timestamp;
use crate::error::FetchError;
use ccpulse_types::UsageEntry;
use chrono::{Duration, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Result of one load
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    /// Deduplicated entries, sorted by timestamp
    pub entries: Vec<UsageEntry>,
    /// Raw `system`/`user` records for limit detection
    pub raw_records: Vec<Value>,
}

/// Pull-based source of usage entries
pub trait UsageSource: Send + Sync {
    fn load(&self) -> Result<SourceBatch, FetchError>;
}

impl<F> UsageSource for F
where
    F: Fn() -> Result<SourceBatch, FetchError> + Send + Sync,
{
    fn load(&self) -> Result<SourceBatch, FetchError> {
        self()
    }
}

/// Reads Claude transcript `*.jsonl` files under a directory tree.
///
/// Malformed lines, records without token usage and unreadable files are
/// skipped. Invalid UTF-8 is replaced rather than failing the line.
#[derive(Debug, Clone)]
pub struct JsonlSource {
    root: PathBuf,
    hours_back: Option<u32>,
}

impl JsonlSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            hours_back: None,
        }
    }

    /// Only keep entries from the last `hours` hours
    pub fn with_hours_back(mut self, hours: Option<u32>) -> Self {
        self.hours_back = hours;
        self
    }

    /// `~/.claude/projects`
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".claude").join("projects"))
    }

    fn jsonl_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().map(|ext| ext == "jsonl").unwrap_or(false))
            .map(|e| e.into_path())
            .collect()
    }

    fn read_files(&self, files: &[PathBuf]) -> SourceBatch {
        let mut seen = HashSet::new();
        let mut batch = SourceBatch::default();
        for path in files {
            if let Err(e) = self.read_file(path, &mut seen, &mut batch) {
                warn!(path = %path.display(), error = %e, "Skipping unreadable file");
            }
        }
        batch.entries.sort_by_key(|e| e.timestamp);
        batch
    }

    fn read_file(
        &self,
        path: &Path,
        seen: &mut HashSet<String>,
        batch: &mut SourceBatch,
    ) -> std::io::Result<()> {
        let cutoff = self
            .hours_back
            .map(|h| Utc::now() - Duration::hours(i64::from(h)));
        let mut reader = BufReader::new(std::fs::File::open(path)?);
        let mut buf = Vec::new();
        let mut line_number = 0usize;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            line_number += 1;

            // A writer may still be mid-way through a multibyte character
            let line = String::from_utf8_lossy(&buf);
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    trace!(path = %path.display(), line_number, error = %e, "Skipping malformed line");
                    continue;
                }
            };

            if matches!(
                record.get("type").and_then(Value::as_str),
                Some("system") | Some("user")
            ) {
                batch.raw_records.push(record.clone());
            }

            let Some(entry) = map_record(&record) else {
                continue;
            };
            if cutoff.is_some_and(|c| entry.timestamp < c) {
                continue;
            }
            if let Some(key) = dedup_key(&record) {
                if !seen.insert(key) {
                    continue;
                }
            }
            batch.entries.push(entry);
        }
        Ok(())
    }
}

impl UsageSource for JsonlSource {
    fn load(&self) -> Result<SourceBatch, FetchError> {
        if !self.root.is_dir() {
            return Err(FetchError::Access {
                message: format!("data directory not found: {}", self.root.display()),
                source: None,
            });
        }

        let files = self.jsonl_files();
        let batch = self.read_files(&files);

        debug!(
            files = files.len(),
            entries = batch.entries.len(),
            "Loaded usage entries"
        );
        Ok(batch)
    }
}

/// `message_id:request_id` when both are present
fn dedup_key(record: &Value) -> Option<String> {
    let message_id = record
        .get("message_id")
        .and_then(Value::as_str)
        .or_else(|| record.get("message")?.get("id")?.as_str())?;
    let request_id = record
        .get("requestId")
        .or_else(|| record.get("request_id"))
        .and_then(Value::as_str)?;
    Some(format!("{message_id}:{request_id}"))
}

fn map_record(record: &Value) -> Option<UsageEntry> {
    let timestamp = parse_timestamp(record.get("timestamp")?)?;
    let message = record.get("message").filter(|m| m.is_object());

    let usage_sources: Vec<&Value> = if record.get("type").and_then(Value::as_str) == Some("assistant") {
        [message.and_then(|m| m.get("usage")), record.get("usage"), Some(record)]
            .into_iter()
            .flatten()
            .collect()
    } else {
        [record.get("usage"), message.and_then(|m| m.get("usage")), Some(record)]
            .into_iter()
            .flatten()
            .collect()
    };

    let count = |source: &Value, keys: &[&str]| -> u64 {
        keys.iter()
            .find_map(|k| source.get(*k).and_then(Value::as_u64).filter(|&v| v > 0))
            .unwrap_or(0)
    };

    let entry = usage_sources.into_iter().filter(|s| s.is_object()).find_map(|source| {
        let input = count(source, &["input_tokens", "inputTokens", "prompt_tokens"]);
        let output = count(source, &["output_tokens", "outputTokens", "completion_tokens"]);
        let creation = count(
            source,
            &["cache_creation_input_tokens", "cache_creation_tokens", "cacheCreationInputTokens"],
        );
        let read = count(
            source,
            &["cache_read_input_tokens", "cache_read_tokens", "cacheReadInputTokens"],
        );
        (input + output + creation + read > 0)
            .then(|| UsageEntry::new(timestamp, input, output).with_cache(creation, read))
    })?;

    let model = message
        .and_then(|m| m.get("model"))
        .or_else(|| record.get("model"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let cost = record
        .get("cost")
        .or_else(|| record.get("costUSD"))
        .and_then(Value::as_f64);
    let message_id = record
        .get("message_id")
        .or_else(|| message.and_then(|m| m.get("id")))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let request_id = record
        .get("request_id")
        .or_else(|| record.get("requestId"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    Some(UsageEntry {
        cost_usd: cost,
        model: model.to_string(),
        message_id: message_id.to_string(),
        request_id: request_id.to_string(),
        ..entry
    })
}
