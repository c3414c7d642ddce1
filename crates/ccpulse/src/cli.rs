//! Snapshot rendering for the terminal
//!
//! `json` prints the full snapshot as one line per cycle; `summary` prints a
//! single human-readable status line.

use anyhow::{Context, Result};
use ccpulse_core::Snapshot;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Output format for each snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Json,
    Summary,
}

pub fn render(snapshot: &Snapshot, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            let json = snapshot.to_json().context("Failed to serialize snapshot")?;
            Ok(json.to_string())
        }
        OutputFormat::Summary => Ok(format_summary(snapshot)),
    }
}

pub fn format_summary(snapshot: &Snapshot) -> String {
    let Some(active) = active_block(&snapshot.data) else {
        return format!(
            "No active session | limit {} tokens | {:.1} tok/min last hour",
            format_tokens(snapshot.token_limit),
            snapshot.hourly_burn_rate
        );
    };

    let used = active.get("totalTokens").and_then(Value::as_u64).unwrap_or(0);
    let cost = active.get("costUSD").and_then(Value::as_f64).unwrap_or(0.0);
    let percent = if snapshot.token_limit > 0 {
        used as f64 / snapshot.token_limit as f64 * 100.0
    } else {
        0.0
    };

    let mut line = format!(
        "{} / {} tokens ({:.0}%) | ${:.2} / ${:.2}",
        format_tokens(used),
        format_tokens(snapshot.token_limit),
        percent,
        cost,
        snapshot.cost_limit
    );

    if let Some(rate) = &snapshot.burn_rate {
        line.push_str(&format!(" | {:.1} tok/min", rate.tokens_per_minute));
    }

    let reset = active
        .get("endTime")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));
    if let Some(reset) = reset {
        line.push_str(&format!(
            " | resets in {}",
            format_minutes((reset - snapshot.generated_at).num_minutes())
        ));
    }

    line
}

fn active_block(data: &Value) -> Option<&Value> {
    data.get("blocks")?
        .as_array()?
        .iter()
        .find(|b| b.get("isActive").and_then(Value::as_bool) == Some(true))
}

fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

fn format_minutes(minutes: i64) -> String {
    let minutes = minutes.max(0);
    match (minutes / 60, minutes % 60) {
        (0, m) => format!("{m}m"),
        (h, m) => format!("{h}h {m}m"),
    }
}
