//! Source of per-server job dependency data.
//!
//! [`HttpDependencyFeed`] reads `GET <base>/dashboard/job_dependency_graph/<sid>`
//! using [`reqwest`]. The graph may sit at the top level of the response
//! or inside a `data` envelope.

use async_trait::async_trait;
use jobwatch_core::dependency_graph::{DependencyEdge, JobNode};
use jobwatch_core::types::ServerId;
use serde::Deserialize;
use serde_json::Value;

/// Flat dependency data for one server.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DependencyFeedData {
    #[serde(default)]
    pub nodes: Vec<JobNode>,
    #[serde(default, alias = "edges")]
    pub links: Vec<DependencyEdge>,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("Dependency feed error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Invalid dependency graph: {0}")]
    Decode(String),
}

#[async_trait]
pub trait DependencyFeed: Send + Sync + 'static {
    async fn fetch(&self, server_id: ServerId) -> Result<DependencyFeedData, FeedError>;
}

pub struct HttpDependencyFeed {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDependencyFeed {
    /// * `base_url` - web application root, e.g. `http://127.0.0.1:5050`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self, server_id: ServerId) -> String {
        format!("{}/dashboard/job_dependency_graph/{server_id}", self.base_url)
    }
}

#[async_trait]
impl DependencyFeed for HttpDependencyFeed {
    async fn fetch(&self, server_id: ServerId) -> Result<DependencyFeedData, FeedError> {
        let response = self.client.get(self.endpoint(server_id)).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = response.json().await?;
        parse_feed(value)
    }
}

/// Extract the dependency graph from a feed response body.
pub fn parse_feed(value: Value) -> Result<DependencyFeedData, FeedError> {
    let graph = find_graph(&value)
        .ok_or_else(|| FeedError::Decode("no dependency_graph in response".into()))?;
    DependencyFeedData::deserialize(graph).map_err(|e| FeedError::Decode(e.to_string()))
}

fn find_graph(value: &Value) -> Option<&Value> {
    if let Some(graph) = value.get("dependency_graph") {
        return Some(graph);
    }
    let data = value.get("data")?;
    data.get("dependency_graph")
        .or_else(|| data.get("nodes").map(|_| data))
}
