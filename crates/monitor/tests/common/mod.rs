//! Shared doubles for monitor integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use jobwatch_core::types::ServerId;
use jobwatch_monitor::feed::{DependencyFeed, DependencyFeedData, FeedError};
use jobwatch_monitor::host::{HostTree, Notifier, RefreshError, RefreshTarget, TreeNode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Refresh(String),
    Unload(String),
    Reload(String),
}

/// Host tree with a configurable set of loaded nodes.
#[derive(Default)]
pub struct RecordingHost {
    loaded: Mutex<HashSet<RefreshTarget>>,
    calls: Mutex<Vec<HostCall>>,
    fail_refresh: AtomicBool,
    panic_on_locate: AtomicBool,
}

impl RecordingHost {
    pub fn with_loaded(targets: &[RefreshTarget]) -> Self {
        let host = Self::default();
        host.loaded.lock().unwrap().extend(targets.iter().copied());
        host
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub fn panic_on_locate(&self, panic: bool) {
        self.panic_on_locate.store(panic, Ordering::SeqCst);
    }
}

#[async_trait]
impl HostTree for RecordingHost {
    async fn locate(&self, target: &RefreshTarget) -> Option<TreeNode> {
        if self.panic_on_locate.load(Ordering::SeqCst) {
            panic!("tree exploded");
        }
        let loaded = self.loaded.lock().unwrap().contains(target);
        loaded.then(|| TreeNode(target.to_string()))
    }

    async fn refresh(&self, node: &TreeNode) -> Result<(), RefreshError> {
        self.calls.lock().unwrap().push(HostCall::Refresh(node.0.clone()));
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(RefreshError::Failed("stale node".into()));
        }
        Ok(())
    }

    async fn unload(&self, node: &TreeNode) -> Result<(), RefreshError> {
        self.calls.lock().unwrap().push(HostCall::Unload(node.0.clone()));
        Ok(())
    }

    async fn reload(&self, node: &TreeNode) -> Result<(), RefreshError> {
        self.calls.lock().unwrap().push(HostCall::Reload(node.0.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notified {
    Success(String),
    Error(String),
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notified>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notified> {
        self.notices.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_success(&self, text: &str) {
        self.notices.lock().unwrap().push(Notified::Success(text.to_string()));
    }

    fn notify_error(&self, text: &str) {
        self.notices.lock().unwrap().push(Notified::Error(text.to_string()));
    }
}

/// Feed serving fixed data per server.
#[derive(Default)]
pub struct StaticFeed {
    graphs: Mutex<HashMap<ServerId, DependencyFeedData>>,
    latency: Option<Duration>,
}

impl StaticFeed {
    pub fn with(server_id: ServerId, data: DependencyFeedData) -> Self {
        let feed = Self::default();
        feed.graphs.lock().unwrap().insert(server_id, data);
        feed
    }

    /// Every fetch sleeps for `latency` first.
    pub fn slow(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl DependencyFeed for StaticFeed {
    async fn fetch(&self, server_id: ServerId) -> Result<DependencyFeedData, FeedError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.graphs
            .lock()
            .unwrap()
            .get(&server_id)
            .cloned()
            .ok_or_else(|| FeedError::Decode(format!("no graph for server {server_id}")))
    }
}
