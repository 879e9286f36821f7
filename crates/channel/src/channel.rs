//! The per-server event channel task.
//!
//! An [`EventChannel`] owns one [`TransportLink`] and is the only writer
//! of its server's [`ConnectionState`]. It drives listener registration
//! and the heartbeat from transport lifecycle events. Status updates go
//! through a queue to a delivery task that feeds the [`StatusSink`] in
//! arrival order, so a slow sink never stalls the channel loop.

use std::sync::Arc;
use std::time::Duration;

use jobwatch_core::connection::ConnectionState;
use jobwatch_core::job_status::JobStatusUpdate;
use jobwatch_core::types::ServerId;
use jobwatch_events::{EventBus, MonitorEvent};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::heartbeat::{HeartbeatMonitor, DEFAULT_HEARTBEAT_INTERVAL};
use crate::messages::{parse_message, InboundMessage};
use crate::registration::{ListenerRegistration, DEFAULT_RETRY_DELAY};
use crate::sink::StatusSink;
use crate::transport::{OutboundEvent, TransportEvent, TransportLink};

/// Timers shared by every channel a manager creates.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    pub heartbeat_interval: Duration,
    pub registration_retry: Duration,
    /// How long `disconnect` waits for a channel task before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            registration_retry: DEFAULT_RETRY_DELAY,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

pub(crate) struct EventChannel {
    server_id: ServerId,
    link: TransportLink,
    state: watch::Sender<ConnectionState>,
    registration: ListenerRegistration,
    heartbeat: HeartbeatMonitor,
    session_id: Option<String>,
    sink: Arc<dyn StatusSink>,
    /// Open while `run` is active.
    updates: Option<mpsc::UnboundedSender<JobStatusUpdate>>,
    bus: Arc<EventBus>,
}

impl EventChannel {
    pub(crate) fn new(
        server_id: ServerId,
        link: TransportLink,
        state: watch::Sender<ConnectionState>,
        settings: &ChannelSettings,
        sink: Arc<dyn StatusSink>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            server_id,
            link,
            state,
            registration: ListenerRegistration::new(server_id, settings.registration_retry),
            heartbeat: HeartbeatMonitor::new(settings.heartbeat_interval),
            session_id: None,
            sink,
            updates: None,
            bus,
        }
    }

    /// Drive the channel until `cancel` fires or the transport gives up.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(server_id = self.server_id, "Event channel started");
        let initial = *self.state.borrow();
        self.bus.publish(MonitorEvent::state_changed(self.server_id, initial));

        let (updates, queue) = mpsc::unbounded_channel();
        self.updates = Some(updates);
        let delivery = AbortOnDropHandle::new(tokio::spawn(deliver_updates(
            self.server_id,
            Arc::clone(&self.sink),
            queue,
            cancel.clone(),
        )));

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.teardown();
                    break;
                }
                event = self.link.events.recv() => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        tracing::debug!(server_id = self.server_id, "Transport ended");
                        self.heartbeat.stop();
                        self.registration.reset();
                        self.session_id = None;
                        if self.current_state().is_live() {
                            self.set_state(ConnectionState::Disconnected);
                        }
                        break;
                    }
                },
                _ = self.heartbeat.tick() => self.on_heartbeat(),
                _ = self.registration.retry_due() => self.on_retry_due(),
            }
        }

        // Queued updates still drain unless the channel was cancelled.
        self.updates = None;
        if let Err(e) = delivery.await {
            tracing::warn!(server_id = self.server_id, error = %e, "Status delivery task failed");
        }

        tracing::info!(server_id = self.server_id, "Event channel stopped");
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            tracing::info!(server_id = self.server_id, state = %next, "Channel state changed");
            self.bus.publish(MonitorEvent::state_changed(self.server_id, next));
        }
    }

    fn send(&self, event: OutboundEvent) {
        tracing::debug!(server_id = self.server_id, event = %event.event, "Emitting");
        if self.link.outbound.send(event).is_err() {
            tracing::debug!(server_id = self.server_id, "Transport gone, outbound event dropped");
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { session_id } => {
                tracing::info!(server_id = self.server_id, %session_id, "Connected");
                self.set_state(ConnectionState::Connected);
                let request = self.registration.start(&session_id);
                self.session_id = Some(session_id);
                self.send(request);
            }
            TransportEvent::Reconnected {
                session_id,
                attempts,
            } => {
                tracing::info!(server_id = self.server_id, %session_id, attempts, "Reconnected");
                self.set_state(ConnectionState::Connected);
                let request = self.registration.restart_after_reconnect(&session_id);
                self.session_id = Some(session_id);
                self.send(request);
            }
            TransportEvent::ConnectError { message } => {
                tracing::warn!(server_id = self.server_id, error = %message, "Connection error");
                self.drop_session();
                self.set_state(ConnectionState::Error);
            }
            TransportEvent::Error { message } => {
                tracing::warn!(server_id = self.server_id, error = %message, "Transport error");
                if self.current_state() == ConnectionState::Connecting {
                    self.set_state(ConnectionState::Error);
                }
            }
            TransportEvent::Disconnected { reason } => {
                tracing::info!(server_id = self.server_id, %reason, "Disconnected");
                self.drop_session();
                self.set_state(ConnectionState::Disconnected);
            }
            TransportEvent::ReconnectAttempt { attempt } => {
                tracing::debug!(server_id = self.server_id, attempt, "Reconnect attempt");
                self.set_state(ConnectionState::Connecting);
            }
            TransportEvent::ReconnectFailed => {
                tracing::warn!(server_id = self.server_id, "Reconnect attempts exhausted");
                self.drop_session();
                self.set_state(ConnectionState::Error);
            }
            TransportEvent::Message { event, payload } => self.on_message(&event, payload),
        }
    }

    fn on_message(&mut self, event: &str, payload: Value) {
        match parse_message(event, payload) {
            Ok(InboundMessage::ListenerStarted) => {
                tracing::info!(server_id = self.server_id, "Job status listener started");
                self.registration.on_started();
                self.set_state(ConnectionState::Listening);
                self.heartbeat.start();
                self.bus.publish(MonitorEvent::listener_registered(self.server_id));
            }
            Ok(InboundMessage::ListenerError(error)) => {
                tracing::warn!(server_id = self.server_id, error = %error, "Job status listener error");
                if self.current_state() == ConnectionState::Listening {
                    self.set_state(ConnectionState::Connected);
                }
                if self.registration.on_error(&error) {
                    tracing::info!(
                        server_id = self.server_id,
                        delay_secs = self.registration.retry_delay().as_secs(),
                        "Listener registration retry scheduled",
                    );
                }
            }
            Ok(InboundMessage::StatusUpdate(update)) => {
                tracing::debug!(server_id = self.server_id, job_id = ?update.job_id, "Job status update");
                let queued = self.updates.as_ref().is_some_and(|tx| tx.send(update).is_ok());
                if !queued {
                    tracing::debug!(server_id = self.server_id, "Delivery stopped, update dropped");
                }
            }
            Ok(InboundMessage::Other(name)) => {
                tracing::trace!(server_id = self.server_id, event = %name, "Ignoring event");
            }
            Err(e) => {
                tracing::warn!(
                    server_id = self.server_id,
                    event,
                    error = %e,
                    "Invalid job status update payload",
                );
            }
        }
    }

    fn on_heartbeat(&mut self) {
        if !self.current_state().is_connected() {
            tracing::debug!(server_id = self.server_id, "Heartbeat skipped, not connected");
            self.heartbeat.stop();
            return;
        }
        if let Some(session_id) = self.session_id.as_deref() {
            self.send(HeartbeatMonitor::ping(session_id));
        }
    }

    fn on_retry_due(&mut self) {
        let request = self.registration.take_retry(self.session_id.as_deref());
        match request {
            Some(request) if self.current_state().is_connected() => {
                tracing::info!(server_id = self.server_id, "Retrying listener registration");
                self.send(request);
            }
            _ => {
                tracing::debug!(server_id = self.server_id, "Registration retry skipped, not connected");
            }
        }
    }

    fn drop_session(&mut self) {
        self.heartbeat.stop();
        self.registration.reset();
        self.session_id = None;
    }

    fn teardown(&mut self) {
        let connected = self.current_state().is_connected();
        if let Some(stop) = self.registration.stop(connected) {
            self.send(stop);
        }
        self.heartbeat.stop();
        self.session_id = None;
        self.link.shutdown.cancel();
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Feed queued updates to `sink` one at a time. Cancellation drops the
/// rest of the queue and any delivery in progress.
async fn deliver_updates(
    server_id: ServerId,
    sink: Arc<dyn StatusSink>,
    mut queue: mpsc::UnboundedReceiver<JobStatusUpdate>,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            update = queue.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(server_id, "Delivery cancelled mid-update");
                break;
            }
            _ = sink.deliver(update) => {}
        }
    }
}
