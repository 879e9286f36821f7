//! Collaborator contracts implemented by the hosting application.

use async_trait::async_trait;
use jobwatch_core::types::{JobId, ServerId};

/// What a status event asks the host to refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshTarget {
    /// One job node.
    Job { server_id: ServerId, job_id: JobId },
    /// Every job under a server.
    JobCollection { server_id: ServerId },
}

impl RefreshTarget {
    pub fn server_id(&self) -> ServerId {
        match self {
            Self::Job { server_id, .. } | Self::JobCollection { server_id } => *server_id,
        }
    }

    /// The collection a job target falls back to.
    pub fn collection(&self) -> Self {
        Self::JobCollection {
            server_id: self.server_id(),
        }
    }
}

impl std::fmt::Display for RefreshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Job { server_id, job_id } => write!(f, "job {job_id} on server {server_id}"),
            Self::JobCollection { server_id } => write!(f, "jobs of server {server_id}"),
        }
    }
}

/// Opaque handle to a node currently loaded in the host tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeNode(pub String);

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The node is not loaded (collapsed or never expanded).
    #[error("Refresh target not found: {0}")]
    NotFound(RefreshTarget),

    #[error("Refresh failed: {0}")]
    Failed(String),
}

/// The navigation tree that displays jobs.
#[async_trait]
pub trait HostTree: Send + Sync + 'static {
    /// Find the loaded node for `target`, if any.
    async fn locate(&self, target: &RefreshTarget) -> Option<TreeNode>;

    async fn refresh(&self, node: &TreeNode) -> Result<(), RefreshError>;

    async fn unload(&self, node: &TreeNode) -> Result<(), RefreshError>;

    async fn reload(&self, node: &TreeNode) -> Result<(), RefreshError>;
}

/// User-visible notices.
pub trait Notifier: Send + Sync + 'static {
    fn notify_success(&self, text: &str);
    fn notify_error(&self, text: &str);
}

/// Kinds of tree node the host reports selections for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Server,
    JobCollection,
    Job,
    /// Steps, schedules and anything else.
    Other,
}

impl NodeKind {
    /// Whether selecting this node should open the server's channel.
    pub fn wants_live_status(&self) -> bool {
        matches!(self, Self::Job | Self::JobCollection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedNode {
    pub kind: NodeKind,
    pub server_id: ServerId,
}
