//! In-process event bus for the job monitor.
//!
//! - [`EventBus`]: publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`MonitorEvent`]: connection, registration, status and graph
//!   notifications shared between the channel layer and its consumers.

pub mod bus;

pub use bus::{EventBus, MonitorEvent};
