//! In-memory doubles for exercising channels without a server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobwatch_core::job_status::JobStatusUpdate;
use jobwatch_core::types::ServerId;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::sink::StatusSink;
use crate::transport::{OutboundEvent, Transport, TransportEvent, TransportLink};

/// Transport whose links are driven by the test.
#[derive(Default)]
pub struct MockTransport {
    links: Mutex<VecDeque<MockLink>>,
    opened: AtomicUsize,
}

/// The test-side ends of one opened link.
pub struct MockLink {
    pub server_id: ServerId,
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub outbound: mpsc::UnboundedReceiver<OutboundEvent>,
    pub shutdown: CancellationToken,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of links opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Oldest link not yet taken.
    pub fn take_link(&self) -> Option<MockLink> {
        self.links.lock().ok()?.pop_front()
    }
}

impl Transport for MockTransport {
    fn open(&self, server_id: ServerId) -> TransportLink {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut links) = self.links.lock() {
            links.push_back(MockLink {
                server_id,
                events: event_tx,
                outbound: out_rx,
                shutdown: shutdown.clone(),
            });
        }

        TransportLink {
            events: event_rx,
            outbound: out_tx,
            shutdown,
        }
    }
}

impl MockLink {
    /// Returns `false` once the channel has dropped its end.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn connect(&self, session_id: &str) -> bool {
        self.emit(TransportEvent::Connected {
            session_id: session_id.to_string(),
        })
    }

    pub fn message(&self, event: &str, payload: Value) -> bool {
        self.emit(TransportEvent::Message {
            event: event.to_string(),
            payload,
        })
    }

    /// Next outbound event, or `None` if nothing arrives within `within`.
    pub async fn next_outbound(&mut self, within: Duration) -> Option<OutboundEvent> {
        tokio::time::timeout(within, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Sink that records every update it receives.
#[derive(Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<JobStatusUpdate>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn updates(&self) -> Vec<JobStatusUpdate> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }

    /// Wait until at least `count` updates arrived.
    pub async fn wait_for(&self, count: usize, within: Duration) -> bool {
        tokio::time::timeout(within, async {
            while self.updates().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn deliver(&self, update: JobStatusUpdate) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push(update);
        }
    }
}
