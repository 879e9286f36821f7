//! Registry of per-server event channels.
//!
//! [`ChannelManager`] maps each server id to at most one live
//! [`EventChannel`](crate::channel) task. Connecting a server that
//! already has a live channel is a no-op; a stale binding (one whose
//! channel ended in `Disconnected` or `Error`, or whose task is gone) is
//! replaced.
//!
//! A single teardown hook is installed per manager on the first
//! connect. Cancelling [`ChannelManager::teardown_token`] shuts every
//! channel down.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use jobwatch_core::connection::ConnectionState;
use jobwatch_core::types::ServerId;
use jobwatch_events::EventBus;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelSettings, EventChannel};
use crate::sink::StatusSink;
use crate::transport::Transport;

pub struct ChannelManager {
    /// Bindings indexed by server id.
    bindings: RwLock<HashMap<ServerId, ServerBinding>>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn StatusSink>,
    bus: Arc<EventBus>,
    settings: ChannelSettings,
    /// Master token; every channel token is a child of it.
    teardown: CancellationToken,
    teardown_hook: OnceLock<JoinHandle<()>>,
}

/// Bookkeeping for one server's channel.
struct ServerBinding {
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerBinding {
    /// Last published state, or `Disconnected` once the task has ended
    /// without publishing one.
    fn current_state(&self) -> ConnectionState {
        let state = *self.state.borrow();
        if state.is_live() && self.task.is_finished() {
            ConnectionState::Disconnected
        } else {
            state
        }
    }

    /// Cancel the channel and wait for its task, aborting after `grace`.
    async fn stop(mut self, server_id: ServerId, grace: Duration) {
        tracing::info!(server_id, "Stopping event channel");
        self.cancel.cancel();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(server_id, error = %e, "Event channel task ended abnormally");
            }
            Err(_) => {
                tracing::warn!(server_id, "Event channel did not stop in time, aborting");
                self.task.abort();
            }
        }
    }
}

impl ChannelManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn StatusSink>,
        bus: Arc<EventBus>,
        settings: ChannelSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            bindings: RwLock::new(HashMap::new()),
            transport,
            sink,
            bus,
            settings,
            teardown: CancellationToken::new(),
            teardown_hook: OnceLock::new(),
        })
    }

    /// Ensure a live channel exists for `server_id`.
    ///
    /// Returns `Ok(true)` when a new channel was opened and `Ok(false)`
    /// when a live one already existed.
    pub async fn connect(self: &Arc<Self>, server_id: ServerId) -> Result<bool, ChannelError> {
        if self.teardown.is_cancelled() {
            return Err(ChannelError::TornDown);
        }

        let mut bindings = self.bindings.write().await;

        if let Some(existing) = bindings.get(&server_id) {
            let state = existing.current_state();
            if state.is_live() {
                tracing::debug!(server_id, %state, "Channel already live");
                return Ok(false);
            }
        }

        if let Some(stale) = bindings.remove(&server_id) {
            tracing::info!(server_id, "Replacing stale event channel");
            stale.stop(server_id, self.settings.shutdown_grace).await;
        }

        let link = self.transport.open(server_id);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = self.teardown.child_token();
        let channel = EventChannel::new(
            server_id,
            link,
            state_tx,
            &self.settings,
            Arc::clone(&self.sink),
            Arc::clone(&self.bus),
        );
        let task = tokio::spawn(channel.run(cancel.clone()));

        bindings.insert(
            server_id,
            ServerBinding {
                state: state_rx,
                cancel,
                task,
            },
        );
        drop(bindings);

        self.install_teardown_hook();
        Ok(true)
    }

    /// Tear down the channel for `server_id`.
    ///
    /// When this returns no handler of that channel will run again.
    /// Returns `false` if there was no binding.
    pub async fn disconnect(&self, server_id: ServerId) -> bool {
        let binding = self.bindings.write().await.remove(&server_id);
        match binding {
            Some(binding) => {
                binding.stop(server_id, self.settings.shutdown_grace).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every channel.
    ///
    /// The registry stays locked until every channel has stopped, so a
    /// concurrent caller returns only after the teardown finished.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down channel manager");

        let mut bindings = self.bindings.write().await;
        let drained: Vec<_> = bindings.drain().collect();
        for (server_id, binding) in drained {
            binding.stop(server_id, self.settings.shutdown_grace).await;
        }
        drop(bindings);

        tracing::info!("Channel manager shut down complete");
    }

    pub async fn state(&self, server_id: ServerId) -> Option<ConnectionState> {
        let bindings = self.bindings.read().await;
        bindings.get(&server_id).map(ServerBinding::current_state)
    }

    /// Observe state transitions for one server.
    pub async fn watch_state(&self, server_id: ServerId) -> Option<watch::Receiver<ConnectionState>> {
        self.bindings
            .read()
            .await
            .get(&server_id)
            .map(|b| b.state.clone())
    }

    /// Server ids with a binding, sorted.
    pub async fn server_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<_> = self.bindings.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Cancel to tear down every channel of this manager.
    pub fn teardown_token(&self) -> CancellationToken {
        self.teardown.clone()
    }

    pub fn teardown_hook_installed(&self) -> bool {
        self.teardown_hook.get().is_some()
    }

    // ---- private helpers ----

    fn install_teardown_hook(self: &Arc<Self>) {
        self.teardown_hook.get_or_init(|| {
            tracing::debug!("Installing channel teardown hook");
            let manager = Arc::downgrade(self);
            let token = self.teardown.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                if let Some(manager) = manager.upgrade() {
                    manager.shutdown().await;
                }
            })
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel manager has been torn down")]
    TornDown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockLink, MockTransport, RecordingSink};
    use crate::transport::TransportEvent;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use jobwatch_core::job_status::JobStatusUpdate;
    use jobwatch_core::wire;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(1);

    fn setup() -> (Arc<ChannelManager>, Arc<MockTransport>, Arc<RecordingSink>, Arc<EventBus>) {
        let transport = MockTransport::new();
        let sink = RecordingSink::new();
        let bus = Arc::new(EventBus::default());
        let manager = ChannelManager::new(
            transport.clone(),
            sink.clone(),
            Arc::clone(&bus),
            ChannelSettings::default(),
        );
        (manager, transport, sink, bus)
    }

    /// Sink whose deliveries never complete.
    #[derive(Default)]
    struct StalledSink {
        started: AtomicUsize,
    }

    #[async_trait]
    impl StatusSink for StalledSink {
        async fn deliver(&self, _update: JobStatusUpdate) {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
    }

    async fn wait_for_state(manager: &ChannelManager, server_id: ServerId, want: ConnectionState) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while manager.state(server_id).await != Some(want) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "server {server_id} never reached {want}");
    }

    /// Connect server 1 and consume the initial start request.
    async fn connected(manager: &Arc<ChannelManager>, transport: &MockTransport) -> MockLink {
        manager.connect(1).await.unwrap();
        let mut link = transport.take_link().unwrap();
        assert!(link.connect("s1"));
        let start = link.next_outbound(WAIT).await.unwrap();
        assert_eq!(start.event, wire::EVENT_START_LISTENER);
        link
    }

    // -----------------------------------------------------------------------
    // connect / disconnect
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let (manager, transport, _, _) = setup();
        assert!(manager.connect(1).await.unwrap());
        assert!(!manager.connect(1).await.unwrap());
        assert_eq!(transport.opened(), 1);
        assert_eq!(manager.server_ids().await, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_open_one_channel() {
        let (manager, transport, _, _) = setup();
        let (a, b) = tokio::join!(manager.connect(1), manager.connect(1));
        assert!(a.unwrap() ^ b.unwrap());
        assert_eq!(transport.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_request_carries_session_id() {
        let (manager, transport, _, _) = setup();
        manager.connect(4).await.unwrap();
        let mut link = transport.take_link().unwrap();
        assert_eq!(link.server_id, 4);
        link.connect("abc");

        let start = link.next_outbound(WAIT).await.unwrap();
        assert_eq!(start.payload["sid"], 4);
        assert_eq!(start.payload["client_info"]["client_id"], "abc");
        assert!(start.payload["client_info"].get("reconnect").is_none());
        wait_for_state(&manager, 4, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_binding_is_replaced() {
        let (manager, transport, _, _) = setup();
        manager.connect(1).await.unwrap();
        let link = transport.take_link().unwrap();
        link.emit(TransportEvent::ReconnectFailed);
        wait_for_state(&manager, 1, ConnectionState::Error).await;

        assert!(manager.connect(1).await.unwrap());
        assert_eq!(transport.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_channel_task_is_replaced() {
        let (manager, transport, _, _) = setup();
        let link = connected(&manager, &transport).await;
        link.message(wire::EVENT_LISTENER_STARTED, json!({"sid": 1}));
        wait_for_state(&manager, 1, ConnectionState::Listening).await;

        if let Some(binding) = manager.bindings.read().await.get(&1) {
            binding.task.abort();
        }
        let ended = tokio::time::timeout(WAIT, async {
            while manager.state(1).await != Some(ConnectionState::Disconnected) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(ended.is_ok());

        assert!(manager.connect(1).await.unwrap());
        assert_eq!(transport.opened(), 2);
        let mut next = transport.take_link().unwrap();
        assert!(next.connect("s2"));
        let start = next.next_outbound(WAIT).await.unwrap();
        assert_eq!(start.event, wire::EVENT_START_LISTENER);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_sends_stop_and_silences_channel() {
        let (manager, transport, sink, _) = setup();
        let mut link = connected(&manager, &transport).await;
        wait_for_state(&manager, 1, ConnectionState::Connected).await;

        assert!(manager.disconnect(1).await);
        assert!(link.shutdown.is_cancelled());
        assert_eq!(manager.state(1).await, None);

        let stop = link.next_outbound(WAIT).await.unwrap();
        assert_eq!(stop.event, wire::EVENT_STOP_LISTENER);
        assert_eq!(stop.payload, json!({"sid": 1}));

        let accepted = link.message(wire::EVENT_STATUS_UPDATE, json!({"sid": 1, "status": "s"}));
        assert!(!accepted);
        assert!(sink.updates().is_empty());
        assert!(!manager.disconnect(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_not_connected_sends_nothing() {
        let (manager, transport, _, _) = setup();
        manager.connect(1).await.unwrap();
        let mut link = transport.take_link().unwrap();
        manager.disconnect(1).await;
        assert!(link.next_outbound(WAIT).await.is_none());
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn listener_ack_moves_to_listening() {
        let (manager, transport, _, bus) = setup();
        let mut events = bus.subscribe();
        let link = connected(&manager, &transport).await;
        link.message(wire::EVENT_LISTENER_STARTED, json!({"sid": 1}));
        wait_for_state(&manager, 1, ConnectionState::Listening).await;

        let mut registered = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, jobwatch_events::MonitorEvent::ListenerRegistered { server_id: 1, .. }) {
                registered = true;
            }
        }
        assert!(registered);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_sends_exactly_one_start() {
        let (manager, transport, _, _) = setup();
        let mut link = connected(&manager, &transport).await;

        link.emit(TransportEvent::Disconnected {
            reason: "transport close".into(),
        });
        link.emit(TransportEvent::ReconnectAttempt { attempt: 1 });
        link.emit(TransportEvent::Reconnected {
            session_id: "s2".into(),
            attempts: 1,
        });

        let restart = link.next_outbound(WAIT).await.unwrap();
        assert_eq!(restart.event, wire::EVENT_START_LISTENER);
        assert_eq!(restart.payload["client_info"]["client_id"], "s2");
        assert_eq!(restart.payload["client_info"]["reconnect"], true);
        assert!(link.next_outbound(WAIT).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn listener_error_retries_once() {
        let (manager, transport, _, _) = setup();
        let mut link = connected(&manager, &transport).await;

        link.message(wire::EVENT_LISTENER_ERROR, json!({"message": "no agent"}));
        link.message(wire::EVENT_LISTENER_ERROR, json!({"message": "no agent"}));

        let retry = link.next_outbound(Duration::from_secs(6)).await.unwrap();
        assert_eq!(retry.event, wire::EVENT_START_LISTENER);
        assert_eq!(retry.payload["client_info"]["retry"], true);
        assert!(link.next_outbound(Duration::from_secs(30)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_skipped_after_disconnect() {
        let (manager, transport, _, _) = setup();
        let mut link = connected(&manager, &transport).await;

        link.message(wire::EVENT_LISTENER_ERROR, json!({"message": "no agent"}));
        link.emit(TransportEvent::Disconnected {
            reason: "ping timeout".into(),
        });
        assert!(link.next_outbound(Duration::from_secs(10)).await.is_none());
    }

    // -----------------------------------------------------------------------
    // Heartbeat
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_while_listening_and_stops_on_disconnect() {
        let (manager, transport, _, _) = setup();
        let mut link = connected(&manager, &transport).await;
        link.message(wire::EVENT_LISTENER_STARTED, json!({}));
        wait_for_state(&manager, 1, ConnectionState::Listening).await;

        let ping = link.next_outbound(Duration::from_secs(31)).await.unwrap();
        assert_eq!(ping.event, wire::EVENT_PING);
        assert_eq!(ping.payload["client_id"], "s1");

        link.emit(TransportEvent::Disconnected {
            reason: "transport close".into(),
        });
        wait_for_state(&manager, 1, ConnectionState::Disconnected).await;
        assert!(link.next_outbound(Duration::from_secs(120)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_heartbeat_interval_keeps_channel_alive() {
        let transport = MockTransport::new();
        let settings = ChannelSettings {
            heartbeat_interval: Duration::ZERO,
            ..ChannelSettings::default()
        };
        let manager = ChannelManager::new(
            transport.clone(),
            RecordingSink::new(),
            Arc::new(EventBus::default()),
            settings,
        );
        let mut link = connected(&manager, &transport).await;
        link.message(wire::EVENT_LISTENER_STARTED, json!({"sid": 1}));
        wait_for_state(&manager, 1, ConnectionState::Listening).await;

        let ping = link.next_outbound(Duration::from_secs(2)).await.unwrap();
        assert_eq!(ping.event, wire::EVENT_PING);
        assert!(!manager.connect(1).await.unwrap());
        assert_eq!(manager.state(1).await, Some(ConnectionState::Listening));
    }

    #[tokio::test(start_paused = true)]
    async fn no_heartbeat_before_ack() {
        let (manager, transport, _, _) = setup();
        let mut link = connected(&manager, &transport).await;
        assert!(link.next_outbound(Duration::from_secs(90)).await.is_none());
    }

    // -----------------------------------------------------------------------
    // Status updates
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn updates_reach_sink_in_order() {
        let (manager, transport, sink, _) = setup();
        let link = connected(&manager, &transport).await;

        link.message(wire::EVENT_STATUS_UPDATE, json!({"sid": 1, "job_id": 1, "status": "r"}));
        link.message(wire::EVENT_STATUS_UPDATE, json!("garbage"));
        link.message(wire::EVENT_STATUS_UPDATE, json!({"sid": 1, "job_id": 1, "status": "s"}));

        assert!(sink.wait_for(2, WAIT).await);
        let statuses: Vec<_> = sink.updates().into_iter().filter_map(|u| u.status).collect();
        assert_eq!(statuses, vec!["r", "s"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_sink_does_not_block_channel() {
        let transport = MockTransport::new();
        let sink = Arc::new(StalledSink::default());
        let manager = ChannelManager::new(
            transport.clone(),
            sink.clone(),
            Arc::new(EventBus::default()),
            ChannelSettings::default(),
        );
        let mut link = connected(&manager, &transport).await;

        link.message(wire::EVENT_STATUS_UPDATE, json!({"sid": 1, "job_id": 1, "status": "r"}));
        link.message(wire::EVENT_STATUS_UPDATE, json!({"sid": 1, "job_id": 1, "status": "s"}));
        link.message(wire::EVENT_LISTENER_STARTED, json!({"sid": 1}));
        wait_for_state(&manager, 1, ConnectionState::Listening).await;

        let ping = link.next_outbound(Duration::from_secs(31)).await.unwrap();
        assert_eq!(ping.event, wire::EVENT_PING);
        assert_eq!(sink.started.load(Ordering::SeqCst), 1);

        let stopped = tokio::time::timeout(Duration::from_secs(1), manager.disconnect(1)).await;
        assert_eq!(stopped.ok(), Some(true));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.started.load(Ordering::SeqCst), 1);
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn teardown_hook_installed_once_and_tears_down() {
        let (manager, _transport, _, _) = setup();
        assert!(!manager.teardown_hook_installed());
        for id in 1..=3 {
            manager.connect(id).await.unwrap();
        }
        assert!(manager.teardown_hook_installed());

        manager.teardown_token().cancel();
        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while !manager.server_ids().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(drained.is_ok());
        assert_matches!(manager.connect(4).await, Err(ChannelError::TornDown));
    }
}
