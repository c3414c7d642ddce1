//! End-to-end windowing scenarios: entries → blocks → limits → rates

use ccpulse_core::analyzer::SessionAnalyzer;
use ccpulse_core::burn_rate::{calculate_burn_rate, calculate_hourly_burn_rate, project_block_usage};
use ccpulse_core::p90::P90Estimator;
use ccpulse_core::P90Settings;
use ccpulse_types::{LimitKind, UsageEntry};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
}

fn entry(ts: DateTime<Utc>, input: u64, output: u64) -> UsageEntry {
    UsageEntry::new(ts, input, output)
        .with_model("claude-sonnet-4-20250514")
        .with_cost(0.01)
}

#[test]
fn test_two_close_entries_share_one_active_block() {
    let analyzer = SessionAnalyzer::default();
    let entries = vec![entry(at(10, 15), 100, 50), entry(at(10, 45), 200, 100)];

    let blocks = analyzer.transform_to_blocks_at(&entries, at(11, 0));

    assert_eq!(blocks.len(), 1);
    let block = &blocks[0];
    assert!(block.is_active);
    assert!(!block.is_gap);
    assert_eq!(block.start_time, at(10, 0));
    assert_eq!(block.end_time, at(15, 0));
    assert_eq!(block.token_counts.input_tokens, 300);
    assert_eq!(block.token_counts.output_tokens, 150);
    assert_eq!(block.sent_messages_count, 2);
    assert_eq!(block.actual_end_time, Some(at(10, 45)));
    assert_eq!(block.models, vec!["claude-sonnet-4-20250514".to_string()]);
}

#[test]
fn test_long_silence_opens_new_block_with_gap() {
    let analyzer = SessionAnalyzer::default();
    let first = at(10, 15);
    let second = first + Duration::hours(6);
    let entries = vec![entry(first, 100, 50), entry(second, 100, 50)];

    let blocks = analyzer.transform_to_blocks_at(&entries, second + Duration::minutes(10));

    assert!(blocks.len() >= 2);
    let real: Vec<_> = blocks.iter().filter(|b| !b.is_gap).collect();
    assert_eq!(real.len(), 2);
    assert_eq!(real.iter().map(|b| b.entries.len()).sum::<usize>(), 2);
    assert!(!real[0].is_active);
    assert!(real[1].is_active);

    // Silence between 10:15 and 16:15 is longer than the window
    let gap = blocks.iter().find(|b| b.is_gap).unwrap();
    assert_eq!(gap.start_time, first);
    assert_eq!(gap.id, format!("gap-{}", first.to_rfc3339()));
    assert!(gap.entries.is_empty());
}

#[test]
fn test_every_entry_lands_in_exactly_one_block_in_order() {
    let analyzer = SessionAnalyzer::default();
    let start = at(8, 0);
    let entries: Vec<_> = (0..40)
        .map(|i| entry(start + Duration::minutes(i * 25), 10 + i as u64, 5))
        .collect();

    let blocks = analyzer.transform_to_blocks_at(&entries, start + Duration::days(1));

    let flattened: Vec<_> = blocks.iter().flat_map(|b| b.entries.iter()).collect();
    assert_eq!(flattened.len(), entries.len());
    assert!(flattened.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    for block in blocks.iter().filter(|b| !b.is_gap) {
        assert!(block.entries.iter().all(|e| e.timestamp >= block.start_time));
        assert!(block.entries.iter().all(|e| e.timestamp < block.end_time));
    }
    assert!(blocks.iter().all(|b| !b.is_active));
}

#[test]
fn test_limits_attach_to_containing_block() {
    let analyzer = SessionAnalyzer::default();
    let entries = vec![entry(at(10, 15), 100, 50), entry(at(10, 45), 200, 100)];
    let raw = vec![
        json!({
            "type": "system",
            "content": "Claude Opus 4 limit reached, please wait 30 minutes",
            "timestamp": "2026-03-02T11:00:00Z",
            "requestId": "req_1",
        }),
        json!({
            "type": "system",
            "content": "rate limit exceeded",
            "timestamp": "2026-03-05T11:00:00Z",
        }),
    ];

    let mut blocks = analyzer.transform_to_blocks_at(&entries, at(11, 30));
    let limits = analyzer.detect_limits(&raw);
    assert_eq!(limits.len(), 2);

    analyzer.attach_limits(&mut blocks, limits);

    assert_eq!(blocks[0].limit_messages.len(), 1);
    let limit = &blocks[0].limit_messages[0];
    assert_eq!(limit.kind, LimitKind::OpusLimit);
    assert_eq!(limit.wait_minutes, Some(30));
}

#[test]
fn test_active_block_rates_and_projection() {
    let analyzer = SessionAnalyzer::default();
    let entries = vec![entry(at(10, 15), 100, 50), entry(at(10, 45), 200, 100)];
    let now = at(11, 0);

    let blocks = analyzer.transform_to_blocks_at(&entries, now);
    let active = &blocks[0];

    let rate = calculate_burn_rate(active).unwrap();
    assert!(rate.tokens_per_minute > 0.0);

    let projection = project_block_usage(active, now).unwrap();
    assert_eq!(projection.remaining_minutes, 240);
    assert!(projection.projected_total_tokens > active.total_tokens());

    let hourly = calculate_hourly_burn_rate(Some(blocks.as_slice()), now);
    assert!(hourly > 0.0);
}

#[test]
fn test_p90_over_completed_history() {
    let analyzer = SessionAnalyzer::default();
    // Ten days, one burst per day, growing in size
    let entries: Vec<_> = (0..10)
        .map(|day| {
            let ts = at(9, 0) + Duration::days(day);
            entry(ts, 1_000 * (day as u64 + 1), 0)
        })
        .collect();

    let blocks = analyzer.transform_to_blocks_at(&entries, at(9, 0) + Duration::days(30));
    let estimator = P90Estimator::new(P90Settings {
        common_limits: vec![1_000_000],
        default_min_limit: 1,
        ..P90Settings::default()
    });

    assert_eq!(estimator.calculate_p90_limit(&blocks, false), Some(9_900));
}
