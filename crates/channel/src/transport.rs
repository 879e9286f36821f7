//! The seam between an event channel and the wire.
//!
//! A [`Transport`] opens one [`TransportLink`] per server. The link
//! reports lifecycle events and inbound messages on `events`, accepts
//! outbound messages on `outbound`, and is closed by cancelling
//! `shutdown`.

use std::time::Duration;

use jobwatch_core::types::ServerId;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::CodecError;

/// Lifecycle and message events reported by a transport.
///
/// Per session exactly one of `Connected` or `Reconnected` is emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// First successful session.
    Connected { session_id: String },
    /// A handshake attempt failed.
    ConnectError { message: String },
    /// Non-fatal transport error.
    Error { message: String },
    /// An established session ended.
    Disconnected { reason: String },
    /// About to retry after a drop or failed handshake.
    ReconnectAttempt { attempt: u32 },
    /// A session was re-established after a drop.
    Reconnected { session_id: String, attempts: u32 },
    /// Reconnect budget exhausted; the transport has stopped.
    ReconnectFailed,
    /// Application event received on the namespace.
    Message { event: String, payload: Value },
}

/// An application event to emit on the namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event: String,
    pub payload: Value,
}

impl OutboundEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// The channel-side ends of an open transport.
pub struct TransportLink {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub outbound: mpsc::UnboundedSender<OutboundEvent>,
    pub shutdown: CancellationToken,
}

/// Opens transport sessions towards a server.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, server_id: ServerId) -> TransportLink;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("WebSocket connection failed: {0}")]
    Connect(String),

    #[error("Namespace connect rejected: {0}")]
    Rejected(String),

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection closed")]
    Closed,
}
