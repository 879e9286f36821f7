//! Persistent, reconnecting job-status event channels.
//!
//! One [`EventChannel`](channel) per monitored server carries the
//! listener registration handshake, an application heartbeat and the
//! pushed status updates. [`ChannelManager`](manager::ChannelManager)
//! owns the server-id to channel bindings. The wire side is abstracted
//! behind [`Transport`](transport::Transport); [`client`] provides the
//! Socket.IO-over-WebSocket implementation.

pub mod channel;
pub mod client;
pub mod codec;
pub mod heartbeat;
pub mod manager;
pub mod messages;
pub mod reconnect;
pub mod registration;
pub mod sink;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
