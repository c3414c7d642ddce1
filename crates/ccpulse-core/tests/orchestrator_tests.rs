//! Lifecycle tests for the monitoring orchestrator

use ccpulse_core::error::FetchError;
use ccpulse_core::{MonitorConfig, MonitorEvent, MonitoringOrchestrator, SessionEvent, SourceBatch};
use ccpulse_types::UsageEntry;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

fn config() -> MonitorConfig {
    MonitorConfig {
        update_interval_secs: 1,
        cache_ttl_secs: 0,
        stop_timeout_secs: 5,
        ..MonitorConfig::default()
    }
}

fn live_source(
    loads: Arc<AtomicUsize>,
) -> impl Fn() -> Result<SourceBatch, FetchError> + Send + Sync + 'static {
    move || {
        loads.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        Ok(SourceBatch {
            entries: vec![
                UsageEntry::new(now - ChronoDuration::minutes(15), 100, 50),
                UsageEntry::new(now - ChronoDuration::minutes(2), 200, 100),
            ],
            raw_records: vec![],
        })
    }
}

/// Thread ids of every cycle that reached the update callbacks
fn record_cycle_threads(orchestrator: &MonitoringOrchestrator) -> Arc<Mutex<Vec<ThreadId>>> {
    let threads = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&threads);
    orchestrator.register_update_callback(Box::new(move |_| {
        sink.lock().unwrap().push(thread::current().id());
        Ok(())
    }));
    threads
}

fn distinct(threads: &Mutex<Vec<ThreadId>>) -> usize {
    threads.lock().unwrap().iter().collect::<HashSet<_>>().len()
}

#[test]
fn test_start_twice_runs_one_worker() {
    let loads = Arc::new(AtomicUsize::new(0));
    let orchestrator = MonitoringOrchestrator::new(config(), live_source(loads.clone())).unwrap();
    let threads = record_cycle_threads(&orchestrator);

    orchestrator.start().unwrap();
    orchestrator.start().unwrap();
    assert!(orchestrator.is_running());
    assert!(orchestrator.wait_for_initial_data(Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(1500));

    assert!(threads.lock().unwrap().len() >= 2);
    assert_eq!(distinct(&threads), 1);

    orchestrator.stop().unwrap();
    assert!(!orchestrator.is_running());

    let after_stop = loads.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(1500));
    assert_eq!(loads.load(Ordering::SeqCst), after_stop);
}

#[test]
fn test_restart_after_stop_timeout_keeps_one_worker() {
    let config = MonitorConfig {
        stop_timeout_secs: 0,
        ..config()
    };
    let orchestrator =
        MonitoringOrchestrator::new(config, live_source(Arc::new(AtomicUsize::new(0)))).unwrap();
    orchestrator.register_update_callback(Box::new(|_| {
        thread::sleep(Duration::from_millis(300));
        Ok(())
    }));
    let threads = record_cycle_threads(&orchestrator);

    orchestrator.start().unwrap();
    // Initial data is signalled before callbacks run, so the worker is mid-cycle
    assert!(orchestrator.wait_for_initial_data(Duration::from_secs(5)));
    assert!(orchestrator.stop().is_err());
    orchestrator.start().unwrap();

    // Let the detached worker finish its last cycle
    thread::sleep(Duration::from_millis(1000));
    threads.lock().unwrap().clear();
    thread::sleep(Duration::from_millis(3000));

    assert!(threads.lock().unwrap().len() >= 2);
    assert_eq!(distinct(&threads), 1);
    let _ = orchestrator.stop();
}

#[test]
fn test_stop_when_stopped_is_noop() {
    let orchestrator =
        MonitoringOrchestrator::new(config(), live_source(Arc::new(AtomicUsize::new(0)))).unwrap();
    orchestrator.stop().unwrap();
    orchestrator.stop().unwrap();
    assert!(!orchestrator.is_running());
}

#[test]
fn test_stop_clears_initial_data_flag() {
    let orchestrator =
        MonitoringOrchestrator::new(config(), live_source(Arc::new(AtomicUsize::new(0)))).unwrap();

    orchestrator.start().unwrap();
    assert!(orchestrator.wait_for_initial_data(Duration::from_secs(5)));
    orchestrator.stop().unwrap();

    assert!(!orchestrator.wait_for_initial_data(Duration::from_millis(10)));
    assert!(orchestrator.last_valid_snapshot().is_some());
}

#[test]
fn test_failing_callback_does_not_block_initial_data() {
    let orchestrator =
        MonitoringOrchestrator::new(config(), live_source(Arc::new(AtomicUsize::new(0)))).unwrap();
    orchestrator.register_update_callback(Box::new(|_| anyhow::bail!("render failed")));

    orchestrator.start().unwrap();
    assert!(orchestrator.wait_for_initial_data(Duration::from_secs(5)));
    orchestrator.stop().unwrap();
}

#[test]
fn test_source_without_data_never_signals() {
    let source = || -> Result<SourceBatch, FetchError> { Err(FetchError::format("not jsonl")) };
    let orchestrator = MonitoringOrchestrator::new(config(), source).unwrap();

    orchestrator.start().unwrap();
    assert!(!orchestrator.wait_for_initial_data(Duration::from_millis(300)));
    orchestrator.stop().unwrap();
    assert!(orchestrator.last_valid_snapshot().is_none());
}

#[test]
fn test_session_callbacks_and_events() {
    let orchestrator =
        MonitoringOrchestrator::new(config(), live_source(Arc::new(AtomicUsize::new(0)))).unwrap();
    let mut events = orchestrator.subscribe();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    orchestrator.register_session_callback(Box::new(move |event, id, _| {
        sink.lock().unwrap().push((event, id.to_string()));
        Ok(())
    }));

    let snapshot = orchestrator.force_refresh().unwrap();
    let session_id = snapshot.session_id.clone().unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(SessionEvent::SessionStart, session_id.clone())]
    );

    let mut started = false;
    let mut ready = false;
    while let Ok(event) = events.try_recv() {
        match event {
            MonitorEvent::SessionStarted(id) => started = id == session_id,
            MonitorEvent::SnapshotReady(s) => ready = s.token_limit == snapshot.token_limit,
            _ => {}
        }
    }
    assert!(started);
    assert!(ready);
}

#[test]
fn test_force_refresh_while_running() {
    let loads = Arc::new(AtomicUsize::new(0));
    let orchestrator = MonitoringOrchestrator::new(config(), live_source(loads.clone())).unwrap();

    orchestrator.start().unwrap();
    assert!(orchestrator.wait_for_initial_data(Duration::from_secs(5)));

    let before = loads.load(Ordering::SeqCst);
    let snapshot = orchestrator.force_refresh().unwrap();
    assert!(loads.load(Ordering::SeqCst) > before);
    assert_eq!(snapshot.session_count, 1);

    orchestrator.stop().unwrap();
}
