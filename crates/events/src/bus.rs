//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans [`MonitorEvent`]s out to every subscriber. It is
//! designed to be shared via `Arc<EventBus>` across the monitor.

use chrono::Utc;
use jobwatch_core::connection::ConnectionState;
use jobwatch_core::job_status::JobStatusEvent;
use jobwatch_core::status::JobStatus;
use jobwatch_core::types::{JobId, ServerId, Timestamp};
use serde::Serialize;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// MonitorEvent
// ---------------------------------------------------------------------------

/// Something observable happened for one monitored server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// The channel for a server moved to a new state.
    ConnectionStateChanged {
        server_id: ServerId,
        state: ConnectionState,
        at: Timestamp,
    },

    /// The remote side acknowledged the listener registration.
    ListenerRegistered { server_id: ServerId, at: Timestamp },

    /// A validated job status update was routed.
    JobStatusChanged {
        server_id: ServerId,
        job_id: Option<JobId>,
        status: JobStatus,
        at: Timestamp,
    },

    /// The dependency graph for a server was rebuilt.
    GraphRebuilt {
        server_id: ServerId,
        nodes: usize,
        max_level: u32,
        at: Timestamp,
    },
}

impl MonitorEvent {
    pub fn state_changed(server_id: ServerId, state: ConnectionState) -> Self {
        Self::ConnectionStateChanged {
            server_id,
            state,
            at: Utc::now(),
        }
    }

    pub fn listener_registered(server_id: ServerId) -> Self {
        Self::ListenerRegistered {
            server_id,
            at: Utc::now(),
        }
    }

    pub fn job_status_changed(event: &JobStatusEvent) -> Self {
        Self::JobStatusChanged {
            server_id: event.server_id,
            job_id: event.job_id,
            status: event.status.clone(),
            at: event.timestamp,
        }
    }

    pub fn graph_rebuilt(server_id: ServerId, nodes: usize, max_level: u32) -> Self {
        Self::GraphRebuilt {
            server_id,
            nodes,
            max_level,
            at: Utc::now(),
        }
    }

    /// Server the event concerns.
    pub fn server_id(&self) -> ServerId {
        match self {
            Self::ConnectionStateChanged { server_id, .. }
            | Self::ListenerRegistered { server_id, .. }
            | Self::JobStatusChanged { server_id, .. }
            | Self::GraphRebuilt { server_id, .. } => *server_id,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use jobwatch_core::connection::ConnectionState;
/// use jobwatch_events::bus::{EventBus, MonitorEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(MonitorEvent::state_changed(1, ConnectionState::Connected));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest un-consumed messages are dropped
    /// and slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Events published with no subscribers are dropped.
    pub fn publish(&self, event: MonitorEvent) {
        tracing::trace!(server_id = event.server_id(), ?event, "Publishing monitor event");
        // SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(MonitorEvent::state_changed(7, ConnectionState::Listening));

        let received = rx.recv().await.expect("should receive the event");
        assert_matches!(
            received,
            MonitorEvent::ConnectionStateChanged {
                server_id: 7,
                state: ConnectionState::Listening,
                ..
            }
        );
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(MonitorEvent::listener_registered(3));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1, e2);
        assert_eq!(e1.server_id(), 3);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(MonitorEvent::graph_rebuilt(1, 0, 0));
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = MonitorEvent::graph_rebuilt(2, 5, 3);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "graph_rebuilt");
        assert_eq!(json["nodes"], 5);
    }
}
