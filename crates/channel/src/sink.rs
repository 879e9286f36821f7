//! Where a channel hands off decoded status updates.

use async_trait::async_trait;
use jobwatch_core::job_status::JobStatusUpdate;

/// Receives every `job_status_update` in arrival order.
#[async_trait]
pub trait StatusSink: Send + Sync + 'static {
    async fn deliver(&self, update: JobStatusUpdate);
}
