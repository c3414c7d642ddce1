//! Usage entity model

pub mod block;
pub mod entry;
pub mod limit;
pub mod rate;

pub use block::{ModelStats, SessionBlock, SessionBlockWire};
pub use entry::{TokenCounts, UsageEntry};
pub use limit::{BlockContext, LimitDetectionResult, LimitKind};
pub use rate::{BurnRate, UsageProjection};
