//! Burn rate and end-of-block projection
//!
//! Per-block rate: tokens over the block's elapsed duration. Sliding rate:
//! tokens consumed in the trailing hour across all blocks, where a block that
//! only partly overlaps the hour contributes in proportion to the overlap.

use ccpulse_types::{BurnRate, SessionBlock, UsageProjection};
use chrono::{DateTime, Duration, Utc};

fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

fn minutes(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 60_000.0
}

/// Current consumption rate of an active block.
///
/// `None` unless the block is active, has run for at least a minute and has
/// consumed tokens.
pub fn calculate_burn_rate(block: &SessionBlock) -> Option<BurnRate> {
    if !block.is_active {
        return None;
    }

    let duration = block.duration_minutes();
    let total = block.total_tokens();
    if duration < 1.0 || total == 0 {
        return None;
    }

    Some(BurnRate {
        tokens_per_minute: round8(total as f64 / duration),
        cost_per_hour: round8(block.cost() / duration * 60.0),
    })
}

/// Linear extrapolation of tokens and cost from `now` to the block end
pub fn project_block_usage(block: &SessionBlock, now: DateTime<Utc>) -> Option<UsageProjection> {
    let rate = calculate_burn_rate(block)?;

    let remaining = block.end_time - now;
    if remaining <= Duration::zero() {
        return None;
    }

    let remaining_minutes = minutes(remaining);
    let projected_tokens = block.total_tokens() as f64 + rate.tokens_per_minute * remaining_minutes;
    let projected_cost = block.cost() + rate.cost_per_hour * (remaining_minutes / 60.0);

    Some(UsageProjection {
        projected_total_tokens: projected_tokens.round() as u64,
        projected_total_cost: projected_cost,
        remaining_minutes: remaining_minutes.trunc() as i64,
    })
}

/// Tokens per minute over the hour ending at `now`.
///
/// Sub-entry timing inside a block is not tracked, so a block overlapping the
/// window contributes `total_tokens * overlap / block_duration`.
pub fn calculate_hourly_burn_rate(blocks: Option<&[SessionBlock]>, now: DateTime<Utc>) -> f64 {
    let Some(blocks) = blocks else {
        return 0.0;
    };

    let hour_ago = now - Duration::hours(1);
    let tokens_in_hour: f64 = blocks
        .iter()
        .filter(|b| !b.is_gap)
        .filter_map(|block| {
            let effective_end = if block.is_active {
                now
            } else {
                block.actual_end_time.unwrap_or(now)
            };
            if effective_end < hour_ago {
                return None;
            }

            let overlap_start = block.start_time.max(hour_ago);
            let overlap_end = effective_end.min(now);
            if overlap_end <= overlap_start {
                return None;
            }

            let block_minutes = minutes(effective_end - block.start_time);
            if block_minutes <= 0.0 {
                return None;
            }

            let overlap_minutes = minutes(overlap_end - overlap_start);
            Some(block.total_tokens() as f64 * (overlap_minutes / block_minutes))
        })
        .sum();

    if tokens_in_hour > 0.0 {
        tokens_in_hour / 60.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccpulse_types::UsageEntry;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 20, h, m, 0).unwrap()
    }

    /// Block starting at `start` with entries at `start` and `last`
    fn block(start: DateTime<Utc>, last: DateTime<Utc>, tokens: u64, cost: f64) -> SessionBlock {
        let mut block = SessionBlock::open(start, Duration::hours(5));
        block.push_entry(UsageEntry::new(start, tokens, 0), "m".into(), cost);
        if last != start {
            block.push_entry(UsageEntry::new(last, 0, 0), "m".into(), 0.0);
        }
        block.finalize();
        block
    }

    #[test]
    fn test_burn_rate_one_minute_exact() {
        let mut b = block(at(10, 0), at(10, 1), 165, 0.5);
        b.is_active = true;

        let rate = calculate_burn_rate(&b).unwrap();
        assert_eq!(rate.tokens_per_minute, 165.0);
        assert_eq!(rate.cost_per_hour, 30.0);
    }

    #[test]
    fn test_burn_rate_requires_active_block() {
        let b = block(at(10, 0), at(10, 30), 1_000, 1.0);
        assert!(calculate_burn_rate(&b).is_none());
    }

    #[test]
    fn test_burn_rate_requires_tokens() {
        let mut b = block(at(10, 0), at(10, 30), 0, 0.0);
        b.is_active = true;
        assert!(calculate_burn_rate(&b).is_none());
    }

    #[test]
    fn test_burn_rate_short_block_floors_duration() {
        // Single entry: duration clamps to one minute
        let mut b = block(at(10, 0), at(10, 0), 300, 0.0);
        b.is_active = true;
        assert_eq!(calculate_burn_rate(&b).unwrap().tokens_per_minute, 300.0);
    }

    #[test]
    fn test_projection_extrapolates_to_end() {
        let mut b = block(at(10, 0), at(10, 30), 3_000, 3.0);
        b.is_active = true;

        // 100 tok/min, $6/h; 4h left at 11:00
        let projection = project_block_usage(&b, at(11, 0)).unwrap();
        assert_eq!(projection.remaining_minutes, 240);
        assert_eq!(projection.projected_total_tokens, 3_000 + 24_000);
        assert!((projection.projected_total_cost - 27.0).abs() < 1e-9);
    }

    #[test]
    fn test_projection_truncates_remaining_minutes() {
        let mut b = block(at(10, 0), at(10, 30), 3_000, 0.0);
        b.is_active = true;

        let now = at(14, 58) + Duration::seconds(50);
        assert_eq!(project_block_usage(&b, now).unwrap().remaining_minutes, 1);
    }

    #[test]
    fn test_projection_none_after_end() {
        let mut b = block(at(10, 0), at(10, 30), 3_000, 0.0);
        b.is_active = true;
        assert!(project_block_usage(&b, at(15, 0)).is_none());
    }

    #[test]
    fn test_hourly_rate_empty_inputs() {
        assert_eq!(calculate_hourly_burn_rate(Some(&[]), at(12, 0)), 0.0);
        assert_eq!(calculate_hourly_burn_rate(None, at(12, 0)), 0.0);
    }

    #[test]
    fn test_hourly_rate_active_block_fully_inside() {
        let mut b = block(at(11, 30), at(11, 45), 600, 0.0);
        b.is_active = true;

        // Active block counts up to now: all 600 tokens fall in the hour
        let rate = calculate_hourly_burn_rate(Some(&[b]), at(12, 0));
        assert!((rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_hourly_rate_partial_overlap() {
        // Finished block 10:00-11:30, window 10:30-11:30 covers two thirds
        let b = block(at(10, 0), at(11, 30), 900, 0.0);
        let rate = calculate_hourly_burn_rate(Some(&[b]), at(11, 30));
        assert!((rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_hourly_rate_skips_old_and_gap_blocks() {
        let old = block(at(6, 0), at(8, 0), 10_000, 0.0);
        let gap = SessionBlock::gap(at(8, 0), at(13, 30));
        let rate = calculate_hourly_burn_rate(Some(&[old, gap]), at(12, 0));
        assert_eq!(rate, 0.0);
    }
}
