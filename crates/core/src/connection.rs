//! Per-server connection lifecycle state.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the event channel bound to one server.
///
/// Only the owning `EventChannel` writes this value; everything else
/// observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected and the remote side acknowledged the listener registration.
    Listening,
    Error,
}

impl ConnectionState {
    /// Return the wire-format string for this variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listening => "listening",
            Self::Error => "error",
        }
    }

    /// A live channel is one that is connected or still trying to connect.
    ///
    /// `connect()` is a no-op for a server whose channel is live.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Listening)
    }

    /// True while a transport session is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Listening)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
