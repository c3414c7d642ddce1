//! ccpulse-core - Core library for ccpulse
//!
//! Provides session windowing, burn rate and P90 limit estimation, the cached
//! data source, session tracking and the monitoring loop.

pub mod analyzer;
pub mod burn_rate;
pub mod config;
pub mod data_source;
pub mod error;
pub mod event;
pub mod orchestrator;
pub mod p90;
pub mod plans;
pub mod pricing;
pub mod report;
pub mod session_monitor;
pub mod source;

pub use analyzer::SessionAnalyzer;
pub use config::{CostMode, MonitorConfig, P90Settings, RetrySettings};
pub use data_source::{CachingDataSource, UsageData};
pub use error::{CoreError, FetchError};
pub use event::{EventBus, MonitorEvent, SkipReason};
pub use orchestrator::{MonitoringOrchestrator, OrchestratorBuilder, Snapshot, UpdateCallback};
pub use p90::P90Estimator;
pub use plans::{Plan, PlanPolicy, StandardPlans};
pub use report::{ErrorReport, ErrorReporter, TracingReporter};
pub use session_monitor::{SessionCallback, SessionEvent, SessionMonitor};
pub use source::{JsonlSource, SourceBatch, UsageSource};
