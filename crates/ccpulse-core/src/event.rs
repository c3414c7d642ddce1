//! Event bus for ccpulse using tokio::broadcast
//!
//! Async consumers subscribe here instead of registering synchronous
//! callbacks on the orchestrator.

use crate::orchestrator::Snapshot;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted by the monitoring loop
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A cycle produced a valid snapshot
    SnapshotReady(Arc<Snapshot>),
    /// A new active session block appeared
    SessionStarted(String),
    /// The tracked session is no longer active
    SessionEnded(String),
    /// A cycle produced nothing
    CycleSkipped(SkipReason),
}

/// Why a cycle was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoData,
    InvalidData,
    Failed,
}

/// Event bus for broadcasting monitor events
///
/// Slow subscribers lag and lose the oldest events; the loop never blocks.
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create with default capacity (64 events)
    pub fn default_capacity() -> Self {
        Self::new(64)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: MonitorEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::default_capacity()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
