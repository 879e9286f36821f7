//! Event names exchanged with the job-status service.
//!
//! Application events travel inside Socket.IO EVENT packets on the
//! [`NAMESPACE`] namespace.

/// Socket.IO namespace that carries job status traffic.
pub const NAMESPACE: &str = "/pgagent";

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Ask the server to start pushing status events for a server id.
pub const EVENT_START_LISTENER: &str = "start_job_status_listener";

/// Ask the server to stop pushing status events for a server id.
pub const EVENT_STOP_LISTENER: &str = "stop_job_status_listener";

/// Application-level keep-alive.
pub const EVENT_PING: &str = "ping";

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// The listener registration was accepted.
pub const EVENT_LISTENER_STARTED: &str = "job_status_listener_started";

/// The listener registration was rejected.
pub const EVENT_LISTENER_ERROR: &str = "job_status_listener_error";

/// A job changed state.
pub const EVENT_STATUS_UPDATE: &str = "job_status_update";
