//! ccpulse-types - Shared usage data types for ccpulse
//!
//! Pure data structures without heavy dependencies. No tokio, no async
//! runtime, no I/O. The canonical [`SessionBlock`] lives here together with
//! its camelCase wire form, which is the only shape handed to consumers.
//!
//! Used by:
//! - ccpulse-core (windowing, statistics, orchestration)
//! - ccpulse (binary)

pub mod models;

pub use models::{
    BlockContext, BurnRate, LimitDetectionResult, LimitKind, ModelStats, SessionBlock,
    SessionBlockWire, TokenCounts, UsageEntry, UsageProjection,
};
