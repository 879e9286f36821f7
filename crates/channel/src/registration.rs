//! Listener registration handshake for one server.
//!
//! A registration is requested on every new session and acknowledged by
//! the server with `job_status_listener_started`. A rejection schedules
//! a single delayed retry; further rejections while that retry is
//! pending do not schedule another.

use std::time::Duration;

use jobwatch_core::types::ServerId;
use serde_json::Value;
use tokio::time::Instant;

use crate::messages::{ClientInfo, StartListenerRequest, StopListenerRequest};
use crate::transport::OutboundEvent;

/// Delay before re-requesting a rejected registration.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The server rejected the listener registration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Listener registration rejected: {message}")]
pub struct RegistrationError {
    pub message: String,
}

impl RegistrationError {
    pub fn from_payload(payload: &Value) -> Self {
        let message = match payload {
            Value::String(s) => s.clone(),
            Value::Null => "unspecified".to_string(),
            other => ["message", "error"]
                .iter()
                .find_map(|key| other.get(key).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        };
        Self { message }
    }
}

pub struct ListenerRegistration {
    server_id: ServerId,
    retry_delay: Duration,
    active: bool,
    retry_at: Option<Instant>,
}

impl ListenerRegistration {
    pub fn new(server_id: ServerId, retry_delay: Duration) -> Self {
        Self {
            server_id,
            retry_delay,
            active: false,
            retry_at: None,
        }
    }

    /// Whether the server acknowledged the current registration.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_at.is_some()
    }

    /// Request for a fresh session.
    pub fn start(&mut self, client_id: &str) -> OutboundEvent {
        self.active = false;
        self.request(ClientInfo::new(client_id))
    }

    /// Request for a session re-established after a drop.
    pub fn restart_after_reconnect(&mut self, client_id: &str) -> OutboundEvent {
        self.active = false;
        let mut info = ClientInfo::new(client_id);
        info.reconnect = true;
        self.request(info)
    }

    /// Stop the registration. A stop request is only produced while
    /// connected.
    pub fn stop(&mut self, connected: bool) -> Option<OutboundEvent> {
        self.reset();
        connected.then(|| StopListenerRequest { sid: self.server_id }.into())
    }

    pub fn on_started(&mut self) {
        self.active = true;
        self.retry_at = None;
    }

    /// Record a rejection. Returns `true` when a new retry was scheduled.
    pub fn on_error(&mut self, error: &RegistrationError) -> bool {
        self.active = false;
        if self.retry_at.is_some() {
            tracing::debug!(
                server_id = self.server_id,
                error = %error,
                "Registration retry already pending",
            );
            return false;
        }
        self.retry_at = Some(Instant::now() + self.retry_delay);
        true
    }

    /// Forget the registration and any pending retry.
    pub fn reset(&mut self) {
        self.active = false;
        self.retry_at = None;
    }

    /// Resolves when the pending retry is due; never resolves otherwise.
    pub async fn retry_due(&self) {
        match self.retry_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    /// Consume the pending retry, producing the retry request when a
    /// session id is known.
    pub fn take_retry(&mut self, client_id: Option<&str>) -> Option<OutboundEvent> {
        self.retry_at = None;
        let client_id = client_id?;
        let mut info = ClientInfo::new(client_id);
        info.retry = true;
        Some(self.request(info))
    }

    fn request(&self, client_info: ClientInfo) -> OutboundEvent {
        StartListenerRequest {
            sid: self.server_id,
            client_info,
        }
        .into()
    }
}
