//! Top-level controller owned by the host application.
//!
//! [`JobMonitor`] is created before the host is ready and wired up by a
//! single [`attach`](JobMonitor::attach) call once it is. From then on
//! node selections open event channels, status updates flow through the
//! [`StatusEventRouter`], and dependency graphs follow job changes.

use std::sync::{Arc, OnceLock};

use jobwatch_channel::channel::ChannelSettings;
use jobwatch_channel::manager::{ChannelError, ChannelManager};
use jobwatch_channel::transport::Transport;
use jobwatch_core::connection::ConnectionState;
use jobwatch_core::dependency_graph::LeveledGraph;
use jobwatch_core::types::ServerId;
use jobwatch_events::{EventBus, MonitorEvent};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::feed::{DependencyFeed, FeedError};
use crate::graph::GraphRefresher;
use crate::host::{HostTree, Notifier, SelectedNode};
use crate::router::StatusEventRouter;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitor is not attached to a host")]
    NotAttached,

    #[error("Monitor is already attached to a host")]
    AlreadyAttached,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Feed(#[from] FeedError),
}

/// Everything created by `attach`.
struct Attached {
    manager: Arc<ChannelManager>,
    router: Arc<StatusEventRouter>,
    graphs: Arc<GraphRefresher>,
}

pub struct JobMonitor {
    transport: Arc<dyn Transport>,
    feed: Arc<dyn DependencyFeed>,
    bus: Arc<EventBus>,
    settings: ChannelSettings,
    attached: OnceLock<Attached>,
}

impl JobMonitor {
    pub fn new(
        transport: Arc<dyn Transport>,
        feed: Arc<dyn DependencyFeed>,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            transport,
            feed,
            bus: Arc::new(EventBus::default()),
            settings,
            attached: OnceLock::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Wire the monitor to a ready host. Must be called exactly once,
    /// from within a Tokio runtime.
    pub fn attach(
        &self,
        host: Arc<dyn HostTree>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<(), MonitorError> {
        let mut attached_now = false;
        self.attached.get_or_init(|| {
            attached_now = true;

            let router = Arc::new(StatusEventRouter::new(host, notifier, Arc::clone(&self.bus)));
            let manager = ChannelManager::new(
                Arc::clone(&self.transport),
                router.clone(),
                Arc::clone(&self.bus),
                self.settings.clone(),
            );
            let graphs = Arc::new(GraphRefresher::new(Arc::clone(&self.feed), Arc::clone(&self.bus)));
            tokio::spawn(Arc::clone(&graphs).run(self.bus.subscribe(), Arc::clone(&manager)));

            tracing::info!("Job monitor attached");
            Attached {
                manager,
                router,
                graphs,
            }
        });

        if attached_now {
            Ok(())
        } else {
            Err(MonitorError::AlreadyAttached)
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.get().is_some()
    }

    /// React to the host selecting a tree node. Job and job-collection
    /// nodes open their server's channel; other nodes are ignored.
    ///
    /// Returns `true` when a new channel was opened.
    pub async fn on_node_selected(&self, node: SelectedNode) -> Result<bool, MonitorError> {
        let attached = self.attached()?;
        if !node.kind.wants_live_status() {
            tracing::trace!(server_id = node.server_id, kind = ?node.kind, "Selection ignored");
            return Ok(false);
        }
        Ok(attached.manager.connect(node.server_id).await?)
    }

    pub async fn connect(&self, server_id: ServerId) -> Result<bool, MonitorError> {
        Ok(self.attached()?.manager.connect(server_id).await?)
    }

    pub async fn disconnect(&self, server_id: ServerId) -> Result<bool, MonitorError> {
        let attached = self.attached()?;
        let removed = attached.manager.disconnect(server_id).await;
        attached.graphs.forget(server_id).await;
        Ok(removed)
    }

    /// Tear down every channel. Later connects fail.
    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        let attached = self.attached()?;
        attached.manager.teardown_token().cancel();
        attached.manager.shutdown().await;
        Ok(())
    }

    pub async fn state(&self, server_id: ServerId) -> Result<Option<ConnectionState>, MonitorError> {
        Ok(self.attached()?.manager.state(server_id).await)
    }

    pub async fn connected_servers(&self) -> Result<Vec<ServerId>, MonitorError> {
        Ok(self.attached()?.manager.server_ids().await)
    }

    pub async fn graph(&self, server_id: ServerId) -> Result<Option<Arc<LeveledGraph>>, MonitorError> {
        Ok(self.attached()?.graphs.latest(server_id).await)
    }

    pub async fn refresh_graph(&self, server_id: ServerId) -> Result<Arc<LeveledGraph>, MonitorError> {
        Ok(self.attached()?.graphs.refresh(server_id).await?)
    }

    /// The router, for hosts that receive updates from elsewhere.
    pub fn router(&self) -> Result<Arc<StatusEventRouter>, MonitorError> {
        Ok(Arc::clone(&self.attached()?.router))
    }

    /// Cancel to tear the monitor down from outside.
    pub fn teardown_token(&self) -> Result<CancellationToken, MonitorError> {
        Ok(self.attached()?.manager.teardown_token())
    }

    fn attached(&self) -> Result<&Attached, MonitorError> {
        self.attached.get().ok_or(MonitorError::NotAttached)
    }
}
