//! Typed payloads for the job-status namespace.

use chrono::Utc;
use jobwatch_core::job_status::JobStatusUpdate;
use jobwatch_core::types::ServerId;
use jobwatch_core::wire;
use serde::Serialize;
use serde_json::Value;

use crate::registration::RegistrationError;
use crate::transport::OutboundEvent;

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Client identity attached to listener requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    /// Session id of the transport connection.
    pub client_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retry: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reconnect: bool,
}

impl ClientInfo {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            retry: false,
            reconnect: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartListenerRequest {
    pub sid: ServerId,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopListenerRequest {
    pub sid: ServerId,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingRequest {
    pub timestamp: i64,
    pub client_id: String,
}

impl PingRequest {
    pub fn new(client_id: &str) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            client_id: client_id.to_string(),
        }
    }
}

fn outbound<T: Serialize>(event: &str, body: &T) -> OutboundEvent {
    // These payloads are plain structs of strings and integers.
    OutboundEvent::new(event, serde_json::to_value(body).unwrap_or(Value::Null))
}

impl From<StartListenerRequest> for OutboundEvent {
    fn from(request: StartListenerRequest) -> Self {
        outbound(wire::EVENT_START_LISTENER, &request)
    }
}

impl From<StopListenerRequest> for OutboundEvent {
    fn from(request: StopListenerRequest) -> Self {
        outbound(wire::EVENT_STOP_LISTENER, &request)
    }
}

impl From<PingRequest> for OutboundEvent {
    fn from(request: PingRequest) -> Self {
        outbound(wire::EVENT_PING, &request)
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// An application event received on the namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ListenerStarted,
    ListenerError(RegistrationError),
    StatusUpdate(JobStatusUpdate),
    /// Any other event name; ignored by the channel.
    Other(String),
}

/// Classify an inbound event by name and decode its payload.
///
/// Only a `job_status_update` can fail: a payload that is not a JSON
/// object is rejected.
pub fn parse_message(event: &str, payload: Value) -> Result<InboundMessage, serde_json::Error> {
    match event {
        wire::EVENT_LISTENER_STARTED => Ok(InboundMessage::ListenerStarted),
        wire::EVENT_LISTENER_ERROR => Ok(InboundMessage::ListenerError(
            RegistrationError::from_payload(&payload),
        )),
        wire::EVENT_STATUS_UPDATE => {
            serde_json::from_value(payload).map(InboundMessage::StatusUpdate)
        }
        other => Ok(InboundMessage::Other(other.to_string())),
    }
}
