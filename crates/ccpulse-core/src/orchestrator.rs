//! Monitoring orchestrator
//!
//! Owns a dedicated worker thread that runs one cycle immediately and then
//! one per `update_interval`:
//!
//! ```text
//! get_data ──► to_wire ──► SessionMonitor::update ──► token limit
//!    │ None        │ Err           │ invalid              │
//!    ▼             ▼               ▼                      ▼
//!  skip        report          skip              Snapshot ──► callbacks ──► EventBus
//! ```
//!
//! Cycles are serialized: a `force_refresh` from another thread waits for an
//! in-flight loop cycle and vice versa. Callbacks may call back into the
//! orchestrator; a `force_refresh` from inside a cycle is ignored.

use crate::burn_rate::{calculate_burn_rate, calculate_hourly_burn_rate, project_block_usage};
use crate::config::MonitorConfig;
use crate::data_source::{CachingDataSource, UsageData};
use crate::error::{panic_message, CoreError};
use crate::event::{EventBus, MonitorEvent, SkipReason};
use crate::plans::{PlanPolicy, StandardPlans, DEFAULT_TOKEN_LIMIT};
use crate::report::{ErrorReport, ErrorReporter, TracingReporter};
use crate::session_monitor::{SessionCallback, SessionEvent, SessionMonitor};
use crate::source::UsageSource;
use ccpulse_types::{BurnRate, UsageProjection};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "orchestrator";

/// Called with every valid snapshot, in registration order
pub type UpdateCallback = Box<dyn Fn(&Snapshot) -> anyhow::Result<()> + Send + Sync>;

type SharedCallback = Arc<dyn Fn(&Snapshot) -> anyhow::Result<()> + Send + Sync>;

/// Everything one successful cycle produced
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Wire-format usage data (`blocks` + `metadata`)
    pub data: Value,
    pub token_limit: u64,
    pub cost_limit: f64,
    pub config: Arc<MonitorConfig>,
    pub session_id: Option<String>,
    pub session_count: usize,
    /// Tokens per minute over the trailing hour
    pub hourly_burn_rate: f64,
    pub burn_rate: Option<BurnRate>,
    pub projection: Option<UsageProjection>,
    pub generated_at: DateTime<Utc>,
}

impl Snapshot {
    /// JSON form handed to display layers
    pub fn to_json(&self) -> Result<Value, CoreError> {
        let serialize = |message: &str, value: Result<Value, serde_json::Error>| {
            value.map_err(|source| CoreError::Serialize {
                message: message.to_string(),
                source,
            })
        };

        let args = serialize("config", serde_json::to_value(self.config.as_ref()))?;
        let burn_rate = serialize("burn rate", serde_json::to_value(&self.burn_rate))?;
        let projection = serialize("projection", serde_json::to_value(&self.projection))?;

        Ok(json!({
            "data": self.data,
            "token_limit": self.token_limit,
            "cost_limit": self.cost_limit,
            "args": args,
            "session_id": self.session_id,
            "session_count": self.session_count,
            "hourly_burn_rate": self.hourly_burn_rate,
            "burn_rate": burn_rate,
            "projection": projection,
            "generated_at": self.generated_at,
        }))
    }
}

/// Boolean latch with wakeups
#[derive(Default)]
struct Signal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    fn clear(&self) {
        *self.set.lock() = false;
    }

    fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Block until set or `timeout` elapses; returns the final state
    fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                break;
            }
        }
        *set
    }
}

/// Sets the signal when the worker exits, including by panic
struct SetOnDrop(Arc<Signal>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

struct Worker {
    handle: JoinHandle<()>,
    /// Owned by this worker only, so a detached worker stays stopped
    stop: Arc<Signal>,
    finished: Arc<Signal>,
}

struct Shared {
    config: Arc<MonitorConfig>,
    data_source: CachingDataSource,
    monitor: Mutex<SessionMonitor>,
    policy: Box<dyn PlanPolicy>,
    reporter: Arc<dyn ErrorReporter>,
    callbacks: RwLock<Vec<SharedCallback>>,
    /// Registered while the monitor may be locked; moved in at the next cycle
    pending_session_callbacks: Mutex<Vec<SessionCallback>>,
    last_valid: RwLock<Option<Arc<Snapshot>>>,
    first_data: Signal,
    running: AtomicBool,
    cycle_lock: Mutex<()>,
    cycle_owner: Mutex<Option<ThreadId>>,
    events: EventBus,
}

/// Builder for [`MonitoringOrchestrator`]
pub struct OrchestratorBuilder {
    config: MonitorConfig,
    data_source: CachingDataSource,
    reporter: Arc<dyn ErrorReporter>,
    policy: Option<Box<dyn PlanPolicy>>,
    events: Option<EventBus>,
}

impl OrchestratorBuilder {
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.data_source = self.data_source.with_reporter(Arc::clone(&reporter));
        self.reporter = reporter;
        self
    }

    /// Replace the standard plan table and P90 estimation
    pub fn plan_policy(mut self, policy: impl PlanPolicy + 'static) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<MonitoringOrchestrator, CoreError> {
        self.config.validate()?;

        let policy = self.policy.unwrap_or_else(|| {
            Box::new(
                StandardPlans::new(self.config.p90.clone())
                    .with_custom_limit(self.config.custom_limit_tokens),
            )
        });
        let events = self.events.unwrap_or_default();

        let mut monitor = SessionMonitor::new()
            .with_reporter(Arc::clone(&self.reporter))
            .with_max_history(self.config.max_history_entries);
        let bus = events.clone();
        monitor.register_callback(Box::new(move |event, session_id, _| {
            let id = session_id.to_string();
            bus.publish(match event {
                SessionEvent::SessionStart => MonitorEvent::SessionStarted(id),
                SessionEvent::SessionEnd => MonitorEvent::SessionEnded(id),
            });
            Ok(())
        }));

        Ok(MonitoringOrchestrator {
            shared: Arc::new(Shared {
                config: Arc::new(self.config),
                data_source: self.data_source,
                monitor: Mutex::new(monitor),
                policy,
                reporter: self.reporter,
                callbacks: RwLock::new(Vec::new()),
                pending_session_callbacks: Mutex::new(Vec::new()),
                last_valid: RwLock::new(None),
                first_data: Signal::default(),
                running: AtomicBool::new(false),
                cycle_lock: Mutex::new(()),
                cycle_owner: Mutex::new(None),
                events,
            }),
            worker: Mutex::new(None),
        })
    }
}

/// Periodic fetch, validate, estimate and notify loop
pub struct MonitoringOrchestrator {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl MonitoringOrchestrator {
    pub fn new(config: MonitorConfig, source: impl UsageSource + 'static) -> Result<Self, CoreError> {
        Self::builder(config, source).build()
    }

    pub fn builder(config: MonitorConfig, source: impl UsageSource + 'static) -> OrchestratorBuilder {
        OrchestratorBuilder {
            data_source: CachingDataSource::from_config(source, &config),
            config,
            reporter: Arc::new(TracingReporter),
            policy: None,
            events: None,
        }
    }

    /// Spawn the worker. Starting a running orchestrator only logs a warning.
    pub fn start(&self) -> Result<(), CoreError> {
        let mut worker = self.worker.lock();
        if self.shared.running.load(Ordering::SeqCst) {
            warn!("Monitoring already running");
            return Ok(());
        }

        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let stop = Arc::new(Signal::default());
        let finished = Arc::new(Signal::default());
        let worker_stop = Arc::clone(&stop);
        let guard = SetOnDrop(Arc::clone(&finished));
        let spawned = thread::Builder::new()
            .name("monitoring".to_string())
            .spawn(move || {
                let _guard = guard;
                shared.run_loop(&worker_stop);
            });

        match spawned {
            Ok(handle) => {
                *worker = Some(Worker {
                    handle,
                    stop,
                    finished,
                });
                info!(
                    interval_secs = self.shared.config.update_interval_secs,
                    plan = %self.shared.config.plan,
                    "Monitoring started"
                );
                Ok(())
            }
            Err(source) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(CoreError::WorkerSpawn { source })
            }
        }
    }

    /// Signal the worker and wait up to `stop_timeout` for it to exit.
    ///
    /// A no-op when not running. On timeout the worker is detached and
    /// [`CoreError::StopTimeout`] returned; it exits at its next wakeup.
    pub fn stop(&self) -> Result<(), CoreError> {
        let mut worker = self.worker.lock();
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        if !was_running && worker.is_none() {
            return Ok(());
        }

        let result = match worker.take() {
            // Called from a callback on the worker itself; it exits after this cycle
            Some(w) if w.handle.thread().id() == thread::current().id() => {
                w.stop.set();
                Ok(())
            }
            Some(w) => {
                w.stop.set();
                let timeout = self.shared.config.stop_timeout();
                if w.finished.wait_for(timeout) {
                    if w.handle.join().is_err() {
                        warn!("Monitoring thread exited with a panic");
                    }
                    Ok(())
                } else {
                    warn!(
                        timeout_secs = timeout.as_secs(),
                        "Monitoring thread did not stop in time"
                    );
                    Err(CoreError::StopTimeout {
                        timeout_secs: timeout.as_secs(),
                    })
                }
            }
            None => Ok(()),
        };

        self.shared.first_data.clear();
        info!("Monitoring stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Run one cycle now, bypassing the data cache.
    ///
    /// Returns `None` without fetching when called from a callback of a
    /// cycle already in progress on this thread.
    pub fn force_refresh(&self) -> Option<Arc<Snapshot>> {
        self.shared.run_cycle_guarded(true)
    }

    /// Block until the first valid snapshot or `timeout`
    pub fn wait_for_initial_data(&self, timeout: Duration) -> bool {
        self.shared.first_data.wait_for(timeout)
    }

    /// Takes effect from the next dispatch; safe to call from a callback
    pub fn register_update_callback(&self, callback: UpdateCallback) {
        self.shared.callbacks.write().push(Arc::from(callback));
    }

    /// Takes effect from the next cycle; safe to call from a callback
    pub fn register_session_callback(&self, callback: SessionCallback) {
        self.shared.pending_session_callbacks.lock().push(callback);
    }

    pub fn last_valid_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.shared.last_valid.read().clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MonitorEvent> {
        self.shared.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn data_source(&self) -> &CachingDataSource {
        &self.shared.data_source
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }
}

impl Drop for MonitoringOrchestrator {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!(error = %e, "Stop on drop did not complete");
        }
    }
}

impl Shared {
    fn run_loop(&self, stop: &Signal) {
        let interval = self.config.update_interval();
        self.run_cycle_guarded(false);

        while !stop.wait_for(interval) {
            self.run_cycle_guarded(false);
        }
        debug!("Monitoring loop exited");
    }

    fn run_cycle_guarded(&self, force_refresh: bool) -> Option<Arc<Snapshot>> {
        let current = thread::current().id();
        if *self.cycle_owner.lock() == Some(current) {
            warn!("Refresh requested from inside a monitoring cycle, ignoring");
            return None;
        }

        let _cycle = self.cycle_lock.lock();
        *self.cycle_owner.lock() = Some(current);
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_cycle(force_refresh)));
        *self.cycle_owner.lock() = None;
        let err = match outcome {
            Ok(Ok(snapshot)) => return snapshot,
            Ok(Err(e)) => e,
            Err(payload) => CoreError::CyclePanicked {
                message: panic_message(payload.as_ref()),
            },
        };

        error!(error = %err, "Monitoring cycle failed");
        self.reporter
            .report_error(&err, ErrorReport::new(COMPONENT).context("monitoring_cycle"));
        self.events.publish(MonitorEvent::CycleSkipped(SkipReason::Failed));
        None
    }

    fn run_cycle(&self, force_refresh: bool) -> Result<Option<Arc<Snapshot>>, CoreError> {
        let Some(data) = self.data_source.get_data(force_refresh) else {
            warn!("No data fetched");
            self.events.publish(MonitorEvent::CycleSkipped(SkipReason::NoData));
            return Ok(None);
        };

        let now = Utc::now();
        let wire = data.to_wire(now)?;

        let (session_id, session_count) = {
            let mut monitor = self.monitor.lock();
            let pending = std::mem::take(&mut *self.pending_session_callbacks.lock());
            for callback in pending {
                monitor.register_callback(callback);
            }
            let (valid, errors) = monitor.update(&wire);
            if !valid {
                error!(errors = ?errors, "Data validation failed");
                self.events
                    .publish(MonitorEvent::CycleSkipped(SkipReason::InvalidData));
                return Ok(None);
            }
            (
                monitor.current_session_id().map(str::to_string),
                monitor.session_count(),
            )
        };

        let token_limit = self.token_limit(&data);
        let active = data.active_block();
        let snapshot = Arc::new(Snapshot {
            data: wire,
            token_limit,
            cost_limit: self.policy.cost_limit(self.config.plan),
            config: Arc::clone(&self.config),
            session_id,
            session_count,
            hourly_burn_rate: calculate_hourly_burn_rate(Some(data.blocks.as_slice()), now),
            burn_rate: active.and_then(calculate_burn_rate),
            projection: active.and_then(|b| project_block_usage(b, now)),
            generated_at: now,
        });

        *self.last_valid.write() = Some(Arc::clone(&snapshot));
        if !self.first_data.is_set() {
            info!("Received initial data");
            self.first_data.set();
        }

        self.notify(&snapshot);
        self.events
            .publish(MonitorEvent::SnapshotReady(Arc::clone(&snapshot)));
        Ok(Some(snapshot))
    }

    fn token_limit(&self, data: &UsageData) -> u64 {
        match self.policy.token_limit(self.config.plan, Some(data.blocks.as_slice())) {
            Ok(limit) => limit,
            Err(e) => {
                warn!(plan = %self.config.plan, error = %e, "Token limit lookup failed, using default");
                self.reporter.report_error(
                    &*e,
                    ErrorReport::new(COMPONENT)
                        .context("token_limit")
                        .tag("plan", self.config.plan.as_str()),
                );
                DEFAULT_TOKEN_LIMIT
            }
        }
    }

    fn notify(&self, snapshot: &Snapshot) {
        let callbacks = self.callbacks.read().clone();
        for (index, callback) in callbacks.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(snapshot)));
            let err = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => CoreError::CallbackFailed {
                    message: format!("{e:#}"),
                },
                Err(payload) => CoreError::CallbackPanicked {
                    message: panic_message(payload.as_ref()),
                },
            };
            error!(index, error = %err, "Update callback failed");
            self.reporter.report_error(
                &err,
                ErrorReport::new(COMPONENT)
                    .context("callback_error")
                    .data(json!({ "callback_index": index })),
            );
        }
    }
}
