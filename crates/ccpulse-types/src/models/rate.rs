use serde::{Deserialize, Serialize};

/// Consumption rate of a block at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnRate {
    pub tokens_per_minute: f64,
    pub cost_per_hour: f64,
}

/// Linear extrapolation of a block's usage to its end time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageProjection {
    #[serde(rename = "totalTokens")]
    pub projected_total_tokens: u64,
    #[serde(rename = "totalCost")]
    pub projected_total_cost: f64,
    #[serde(rename = "remainingMinutes")]
    pub remaining_minutes: i64,
}
