//! Keeps the latest leveled dependency graph per server.
//!
//! Graphs are rebuilt wholesale from the [`DependencyFeed`] on every
//! accepted job status change and on demand. Status changes for
//! servers without a channel binding are ignored, and a rebuild that
//! finishes after its server was forgotten is discarded.

use std::collections::HashMap;
use std::sync::Arc;

use jobwatch_channel::manager::ChannelManager;
use jobwatch_core::dependency_graph::{DependencyGraphBuilder, LeveledGraph};
use jobwatch_core::types::ServerId;
use jobwatch_events::{EventBus, MonitorEvent};
use tokio::sync::{broadcast, RwLock};

use crate::feed::{DependencyFeed, FeedError};

pub struct GraphRefresher {
    feed: Arc<dyn DependencyFeed>,
    builder: DependencyGraphBuilder,
    cache: RwLock<GraphCache>,
    bus: Arc<EventBus>,
}

#[derive(Default)]
struct GraphCache {
    graphs: HashMap<ServerId, Arc<LeveledGraph>>,
    /// Bumped by every `forget`.
    epochs: HashMap<ServerId, u64>,
}

impl GraphCache {
    fn epoch(&self, server_id: ServerId) -> u64 {
        self.epochs.get(&server_id).copied().unwrap_or_default()
    }
}

impl GraphRefresher {
    pub fn new(feed: Arc<dyn DependencyFeed>, bus: Arc<EventBus>) -> Self {
        Self {
            feed,
            builder: DependencyGraphBuilder::new(),
            cache: RwLock::new(GraphCache::default()),
            bus,
        }
    }

    /// Fetch and rebuild the graph for `server_id`.
    pub async fn refresh(&self, server_id: ServerId) -> Result<Arc<LeveledGraph>, FeedError> {
        let epoch = self.epoch(server_id).await;
        self.rebuild(server_id, epoch).await
    }

    async fn epoch(&self, server_id: ServerId) -> u64 {
        self.cache.read().await.epoch(server_id)
    }

    /// Cache and announce the result only if `server_id` was not
    /// forgotten since `epoch` was read.
    async fn rebuild(&self, server_id: ServerId, epoch: u64) -> Result<Arc<LeveledGraph>, FeedError> {
        let data = self.feed.fetch(server_id).await?;
        let graph = Arc::new(self.builder.build(data.nodes, data.links));

        for skipped in &graph.skipped {
            tracing::debug!(
                server_id,
                source = skipped.edge.source,
                target_job = skipped.edge.target,
                reason = %skipped.reason,
                "Dependency edge skipped",
            );
        }
        tracing::info!(
            server_id,
            nodes = graph.nodes.len(),
            max_level = graph.max_level(),
            skipped = graph.skipped.len(),
            "Dependency graph rebuilt",
        );

        let mut cache = self.cache.write().await;
        if cache.epoch(server_id) != epoch {
            tracing::debug!(server_id, "Server forgotten during rebuild, graph discarded");
            return Ok(graph);
        }
        cache.graphs.insert(server_id, Arc::clone(&graph));
        self.bus.publish(MonitorEvent::graph_rebuilt(
            server_id,
            graph.nodes.len(),
            graph.max_level(),
        ));
        Ok(graph)
    }

    pub async fn latest(&self, server_id: ServerId) -> Option<Arc<LeveledGraph>> {
        self.cache.read().await.graphs.get(&server_id).cloned()
    }

    /// Drop the cached graph and invalidate rebuilds already running.
    pub async fn forget(&self, server_id: ServerId) {
        let mut cache = self.cache.write().await;
        cache.graphs.remove(&server_id);
        *cache.epochs.entry(server_id).or_default() += 1;
    }

    /// Rebuild on every `JobStatusChanged` for a server `manager` still
    /// binds, until the manager is torn down or the bus closes.
    pub async fn run(
        self: Arc<Self>,
        mut receiver: broadcast::Receiver<MonitorEvent>,
        manager: Arc<ChannelManager>,
    ) {
        let cancel = manager.teardown_token();
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = receiver.recv() => received,
            };

            match received {
                Ok(MonitorEvent::JobStatusChanged { server_id, .. }) => {
                    let epoch = self.epoch(server_id).await;
                    if manager.state(server_id).await.is_none() {
                        tracing::debug!(server_id, "Server not bound, graph rebuild skipped");
                        continue;
                    }
                    if let Err(e) = self.rebuild(server_id, epoch).await {
                        tracing::warn!(server_id, error = %e, "Failed to rebuild dependency graph");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Graph refresher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, graph refresher shutting down");
                    break;
                }
            }
        }
    }
}
