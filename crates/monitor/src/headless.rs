//! Host collaborators for running without a UI.

use async_trait::async_trait;
use jobwatch_events::MonitorEvent;
use tokio::sync::broadcast;

use crate::host::{HostTree, Notifier, RefreshError, RefreshTarget, TreeNode};

/// Treats every target as loaded and logs refresh requests.
pub struct LoggingHostTree;

#[async_trait]
impl HostTree for LoggingHostTree {
    async fn locate(&self, target: &RefreshTarget) -> Option<TreeNode> {
        Some(TreeNode(target.to_string()))
    }

    async fn refresh(&self, node: &TreeNode) -> Result<(), RefreshError> {
        tracing::info!(node = %node.0, "Refresh");
        Ok(())
    }

    async fn unload(&self, node: &TreeNode) -> Result<(), RefreshError> {
        tracing::info!(node = %node.0, "Unload");
        Ok(())
    }

    async fn reload(&self, node: &TreeNode) -> Result<(), RefreshError> {
        tracing::info!(node = %node.0, "Reload");
        Ok(())
    }
}

pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify_success(&self, text: &str) {
        tracing::info!(notice = text, "Job succeeded");
    }

    fn notify_error(&self, text: &str) {
        tracing::warn!(notice = text, "Job failed");
    }
}

/// Log monitor events until the bus closes.
pub async fn log_events(mut receiver: broadcast::Receiver<MonitorEvent>) {
    loop {
        match receiver.recv().await {
            Ok(MonitorEvent::GraphRebuilt {
                server_id,
                nodes,
                max_level,
                ..
            }) => {
                tracing::info!(server_id, nodes, max_level, "Dependency graph");
            }
            Ok(MonitorEvent::ConnectionStateChanged {
                server_id, state, ..
            }) => {
                tracing::info!(server_id, %state, "Connection");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
