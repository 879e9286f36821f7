//! Job status updates as they arrive on the wire, and the validated
//! event the router acts on.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;
use crate::status::JobStatus;
use crate::types::{JobId, ServerId, Timestamp};

/// Per-event notification switches sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPolicy {
    /// Whether a user-visible notice may be shown for this event.
    #[serde(default = "default_true")]
    pub browser: bool,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self { browser: true }
    }
}

fn default_true() -> bool {
    true
}

/// Raw `job_status_update` payload.
///
/// Every field is optional here; [`JobStatusUpdate::into_event`] decides
/// whether the record is usable. Ids may arrive as numbers or numeric
/// strings; an id of `0` counts as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    #[serde(default, deserialize_with = "lenient_id")]
    pub sid: Option<ServerId>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub custom_text: Option<String>,
    #[serde(default)]
    pub notification: Option<NotificationPolicy>,
    /// RFC 3339 time the server observed the transition.
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// A validated job lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusEvent {
    pub server_id: ServerId,
    /// `None` means the server did not say which job changed.
    pub job_id: Option<JobId>,
    pub job_name: Option<String>,
    pub status: JobStatus,
    pub description: Option<String>,
    pub custom_text: Option<String>,
    pub notification: NotificationPolicy,
    pub timestamp: Timestamp,
}

impl JobStatusUpdate {
    /// Validate and normalize the raw payload.
    ///
    /// Fails when the status code or the server id is missing. Blank
    /// strings count as missing.
    pub fn into_event(self) -> Result<JobStatusEvent, CoreError> {
        let status = non_blank(self.status)
            .ok_or_else(|| CoreError::MalformedEvent("missing status".into()))?;
        let server_id = self
            .sid
            .ok_or_else(|| CoreError::MalformedEvent("missing server id".into()))?;

        let timestamp = self
            .timestamp
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(JobStatusEvent {
            server_id,
            job_id: self.job_id,
            job_name: non_blank(self.job_name),
            status: JobStatus::normalize(&status),
            description: non_blank(self.description),
            custom_text: non_blank(self.custom_text),
            notification: self.notification.unwrap_or_default(),
            timestamp,
        })
    }
}

impl JobStatusEvent {
    /// Name shown to users: the job name, else the job id.
    pub fn display_name(&self) -> Option<String> {
        self.job_name
            .clone()
            .or_else(|| self.job_id.map(|id| id.to_string()))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Accept an id as a JSON number or a numeric string. Zero and anything
/// else is treated as absent.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let id = value.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });
    Ok(id.filter(|id| *id != 0))
}
