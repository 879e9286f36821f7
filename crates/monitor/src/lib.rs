//! Live job monitoring: routes pushed job status updates into the host
//! tree and notifier, and keeps per-server dependency graphs current.
//!
//! The host calls [`JobMonitor::attach`](controller::JobMonitor::attach)
//! once it is ready, then reports node selections; the monitor opens
//! one event channel per selected server.

pub mod config;
pub mod controller;
pub mod feed;
pub mod graph;
pub mod headless;
pub mod host;
pub mod router;

pub use controller::{JobMonitor, MonitorError};
