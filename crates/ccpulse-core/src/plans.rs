//! Subscription plans and the token-limit policy
//!
//! Fixed plans answer from a static table. The custom plan adapts to the
//! user's own history through the P90 estimator.

use crate::config::P90Settings;
use crate::error::CoreError;
use crate::p90::P90Estimator;
use ccpulse_types::SessionBlock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

pub const DEFAULT_TOKEN_LIMIT: u64 = 44_000;
pub const DEFAULT_COST_LIMIT: f64 = 200.0;

/// Subscription plan types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    /// Claude Pro
    Pro,
    /// Claude Max 5x
    Max5,
    /// Claude Max 20x
    Max20,
    /// Limit derived from the user's own history
    #[default]
    Custom,
}

/// Static limits for a plan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanLimits {
    pub token_limit: u64,
    pub cost_limit: f64,
    pub message_limit: u64,
}

impl Plan {
    pub const ALL: [Plan; 4] = [Plan::Pro, Plan::Max5, Plan::Max20, Plan::Custom];

    pub fn limits(self) -> PlanLimits {
        match self {
            Self::Pro => PlanLimits {
                token_limit: 44_000,
                cost_limit: 18.0,
                message_limit: 250,
            },
            Self::Max5 => PlanLimits {
                token_limit: 88_000,
                cost_limit: 35.0,
                message_limit: 1_000,
            },
            Self::Max20 => PlanLimits {
                token_limit: 220_000,
                cost_limit: 140.0,
                message_limit: 2_000,
            },
            Self::Custom => PlanLimits {
                token_limit: DEFAULT_TOKEN_LIMIT,
                cost_limit: DEFAULT_COST_LIMIT,
                message_limit: 250,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pro => "pro",
            Self::Max5 => "max5",
            Self::Max20 => "max20",
            Self::Custom => "custom",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Pro => "Claude Pro",
            Self::Max5 => "Claude Max 5x",
            Self::Max20 => "Claude Max 20x",
            Self::Custom => "Custom (P90)",
        }
    }
}

impl FromStr for Plan {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pro" => Ok(Self::Pro),
            "max5" | "max5x" | "max-5x" | "max_5x" => Ok(Self::Max5),
            "max20" | "max20x" | "max-20x" | "max_20x" => Ok(Self::Max20),
            "custom" => Ok(Self::Custom),
            _ => Err(CoreError::UnknownPlan {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-cycle limit lookup used by the orchestrator
pub trait PlanPolicy: Send + Sync {
    fn token_limit(&self, plan: Plan, blocks: Option<&[SessionBlock]>) -> anyhow::Result<u64>;

    fn cost_limit(&self, plan: Plan) -> f64 {
        plan.limits().cost_limit
    }

    fn message_limit(&self, plan: Plan) -> u64 {
        plan.limits().message_limit
    }
}

/// Static table plus P90 estimation for the custom plan
pub struct StandardPlans {
    estimator: P90Estimator,
    custom_limit_tokens: Option<u64>,
}

impl StandardPlans {
    pub fn new(settings: P90Settings) -> Self {
        Self {
            estimator: P90Estimator::new(settings),
            custom_limit_tokens: None,
        }
    }

    /// Pin the custom plan to an explicit limit instead of estimating it
    pub fn with_custom_limit(mut self, tokens: Option<u64>) -> Self {
        self.custom_limit_tokens = tokens;
        self
    }

    pub fn estimator(&self) -> &P90Estimator {
        &self.estimator
    }
}

impl Default for StandardPlans {
    fn default() -> Self {
        Self::new(P90Settings::default())
    }
}

impl PlanPolicy for StandardPlans {
    fn token_limit(&self, plan: Plan, blocks: Option<&[SessionBlock]>) -> anyhow::Result<u64> {
        if plan != Plan::Custom {
            return Ok(plan.limits().token_limit);
        }

        if let Some(tokens) = self.custom_limit_tokens {
            return Ok(tokens);
        }

        let estimated = blocks
            .filter(|b| !b.is_empty())
            .and_then(|b| self.estimator.calculate_p90_limit(b, true));
        if let Some(limit) = estimated {
            debug!(limit, "Using P90 limit for custom plan");
            return Ok(limit);
        }

        Ok(plan.limits().token_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccpulse_types::UsageEntry;
    use chrono::{Duration, TimeZone, Utc};

    fn history(totals: &[u64]) -> Vec<SessionBlock> {
        totals
            .iter()
            .enumerate()
            .map(|(i, &tokens)| {
                let start = Utc.with_ymd_and_hms(2026, 1, 1 + i as u32, 0, 0, 0).unwrap();
                let mut block = SessionBlock::open(start, Duration::hours(5));
                block.push_entry(UsageEntry::new(start, tokens, 0), "m".into(), 0.0);
                block.finalize();
                block
            })
            .collect()
    }

    #[test]
    fn test_plan_parsing() {
        assert_eq!("PRO".parse::<Plan>().unwrap(), Plan::Pro);
        assert_eq!("max5".parse::<Plan>().unwrap(), Plan::Max5);
        assert_eq!("max-20x".parse::<Plan>().unwrap(), Plan::Max20);
        assert_eq!(" custom ".parse::<Plan>().unwrap(), Plan::Custom);
        assert!(matches!(
            "enterprise".parse::<Plan>(),
            Err(CoreError::UnknownPlan { .. })
        ));
    }

    #[test]
    fn test_fixed_plans_use_table() {
        let plans = StandardPlans::default();
        let blocks = history(&[500_000]);

        assert_eq!(plans.token_limit(Plan::Pro, Some(blocks.as_slice())).unwrap(), 44_000);
        assert_eq!(plans.token_limit(Plan::Max5, None).unwrap(), 88_000);
        assert_eq!(plans.token_limit(Plan::Max20, None).unwrap(), 220_000);
        assert_eq!(plans.cost_limit(Plan::Max20), 140.0);
        assert_eq!(plans.message_limit(Plan::Max5), 1_000);
    }

    #[test]
    fn test_custom_without_blocks_falls_back() {
        let plans = StandardPlans::default();
        assert_eq!(plans.token_limit(Plan::Custom, None).unwrap(), DEFAULT_TOKEN_LIMIT);
        assert_eq!(plans.token_limit(Plan::Custom, Some(&[] as &[SessionBlock])).unwrap(), DEFAULT_TOKEN_LIMIT);
        assert_eq!(plans.cost_limit(Plan::Custom), DEFAULT_COST_LIMIT);
    }

    #[test]
    fn test_custom_uses_p90() {
        let plans = StandardPlans::default();
        let blocks = history(&[200_000, 210_000, 215_000, 220_000]);

        let limit = plans.token_limit(Plan::Custom, Some(blocks.as_slice())).unwrap();
        assert!(limit > DEFAULT_TOKEN_LIMIT);
    }

    #[test]
    fn test_explicit_custom_limit_wins() {
        let plans = StandardPlans::default().with_custom_limit(Some(123_456));
        let blocks = history(&[200_000]);

        assert_eq!(plans.token_limit(Plan::Custom, Some(blocks.as_slice())).unwrap(), 123_456);
    }
}
