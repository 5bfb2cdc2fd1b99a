//! Status events for state transitions
//!
//! Every transition written to the store is published here. Delivery is
//! fire-and-forget: a send never blocks and events are dropped when nobody
//! subscribes or a subscriber lags behind.

use crate::runtime::execution::ExecutionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

/// A single observed state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub workload_id: String,
    pub old_state: ExecutionState,
    pub new_state: ExecutionState,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast channel for status events
#[derive(Debug, Clone)]
pub struct StatusSink {
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    /// Publish a transition
    pub fn emit(&self, workload_id: &str, old_state: ExecutionState, new_state: ExecutionState) {
        let event = StatusEvent {
            workload_id: workload_id.to_string(),
            old_state,
            new_state,
            timestamp: Utc::now(),
        };
        if self.sender.send(event).is_err() {
            trace!("No status subscribers for workload {}", workload_id);
        }
    }
}

impl Default for StatusSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let sink = StatusSink::new();
        sink.emit("wl-1", ExecutionState::Uploaded, ExecutionState::Running);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let sink = StatusSink::new();
        let mut rx = sink.subscribe();

        sink.emit("wl-1", ExecutionState::Running, ExecutionState::Crashed);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.workload_id, "wl-1");
        assert_eq!(event.old_state, ExecutionState::Running);
        assert_eq!(event.new_state, ExecutionState::Crashed);
    }
}
