//! Job status event routing.
//!
//! [`StatusEventRouter`] turns each pushed [`JobStatusUpdate`] into at
//! most one user notice and one tree refresh, then announces the change
//! on the [`EventBus`]. Refreshes happen whether or not a notice is
//! shown.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use jobwatch_channel::sink::StatusSink;
use jobwatch_core::job_status::{JobStatusEvent, JobStatusUpdate};
use jobwatch_events::{EventBus, MonitorEvent};

use crate::host::{HostTree, Notifier, RefreshError, RefreshTarget};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A user-visible notice derived from a status event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Success(String),
    Error(String),
}

impl Notice {
    /// Notice for `event`, if one should be shown.
    ///
    /// Only events that name a job, allow browser notices, and report
    /// success or a terminal failure produce one.
    pub fn for_event(event: &JobStatusEvent) -> Option<Self> {
        event.job_id?;
        if !event.notification.browser {
            return None;
        }
        let name = event.display_name()?;

        if event.status.is_success() {
            let mut text = format!("Job {name} completed successfully");
            if let Some(description) = &event.description {
                text.push_str(": ");
                text.push_str(description);
            }
            Some(Self::Success(text))
        } else if event.status.is_terminal_failure() {
            let detail: Vec<&str> = [event.custom_text.as_deref(), event.description.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            let mut text = format!("Job {name} failed");
            if !detail.is_empty() {
                text.push_str(": ");
                text.push_str(&detail.join(" "));
            }
            Some(Self::Error(text))
        } else {
            None
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Success(text) | Self::Error(text) => text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(RefreshTarget),
    /// The refresh failed and the node was unloaded and reloaded.
    Reloaded(RefreshTarget),
    /// Neither the job nor its collection is loaded.
    Skipped,
    /// Refresh and reload both failed.
    Failed(RefreshTarget),
}

/// What the router did with one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub event: JobStatusEvent,
    pub notice: Option<Notice>,
    pub refresh: RefreshOutcome,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct StatusEventRouter {
    host: Arc<dyn HostTree>,
    notifier: Arc<dyn Notifier>,
    bus: Arc<EventBus>,
}

impl StatusEventRouter {
    pub fn new(host: Arc<dyn HostTree>, notifier: Arc<dyn Notifier>, bus: Arc<EventBus>) -> Self {
        Self {
            host,
            notifier,
            bus,
        }
    }

    /// Route one raw update.
    ///
    /// Returns `None` when the update was discarded. Never panics: a
    /// panic inside a collaborator is caught and logged.
    pub async fn on_event(&self, update: JobStatusUpdate) -> Option<Routed> {
        match AssertUnwindSafe(self.route(update)).catch_unwind().await {
            Ok(routed) => routed,
            Err(panic) => {
                tracing::error!(panic = %panic_message(&*panic), "Panic while routing job status update");
                None
            }
        }
    }

    async fn route(&self, update: JobStatusUpdate) -> Option<Routed> {
        let event = match update.into_event() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding job status update");
                return None;
            }
        };

        tracing::debug!(
            server_id = event.server_id,
            job_id = ?event.job_id,
            status = %event.status,
            "Routing job status update",
        );

        let notice = Notice::for_event(&event);
        match &notice {
            Some(Notice::Success(text)) => self.notifier.notify_success(text),
            Some(Notice::Error(text)) => self.notifier.notify_error(text),
            None => {}
        }

        let refresh = self.refresh_for(&event).await;
        self.bus.publish(MonitorEvent::job_status_changed(&event));

        Some(Routed {
            event,
            notice,
            refresh,
        })
    }

    async fn refresh_for(&self, event: &JobStatusEvent) -> RefreshOutcome {
        let wanted = match event.job_id {
            Some(job_id) => RefreshTarget::Job {
                server_id: event.server_id,
                job_id,
            },
            None => RefreshTarget::JobCollection {
                server_id: event.server_id,
            },
        };

        let (target, node) = match self.host.locate(&wanted).await {
            Some(node) => (wanted, node),
            None => {
                let collection = wanted.collection();
                let fallback = if collection == wanted {
                    None
                } else {
                    self.host.locate(&collection).await
                };
                match fallback {
                    Some(node) => {
                        tracing::debug!(refresh_target = %wanted, "Job node not loaded, refreshing its collection");
                        (collection, node)
                    }
                    None => {
                        let skipped = RefreshError::NotFound(wanted);
                        tracing::info!(error = %skipped, "Skipping tree refresh");
                        return RefreshOutcome::Skipped;
                    }
                }
            }
        };

        match self.host.refresh(&node).await {
            Ok(()) => RefreshOutcome::Refreshed(target),
            Err(e) => {
                tracing::warn!(refresh_target = %target, error = %e, "Refresh failed, reloading node");
                if let Err(e) = self.host.unload(&node).await {
                    tracing::warn!(refresh_target = %target, error = %e, "Unload failed");
                }
                match self.host.reload(&node).await {
                    Ok(()) => RefreshOutcome::Reloaded(target),
                    Err(e) => {
                        tracing::error!(refresh_target = %target, error = %e, "Reload failed");
                        RefreshOutcome::Failed(target)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl StatusSink for StatusEventRouter {
    async fn deliver(&self, update: JobStatusUpdate) {
        self.on_event(update).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_core::job_status::NotificationPolicy;
    use jobwatch_core::status::JobStatus;

    fn event(status: JobStatus) -> JobStatusEvent {
        JobStatusEvent {
            server_id: 1,
            job_id: Some(42),
            job_name: Some("nightly".into()),
            status,
            description: None,
            custom_text: None,
            notification: NotificationPolicy::default(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn success_notice() {
        let mut ev = event(JobStatus::Success);
        assert_eq!(
            Notice::for_event(&ev),
            Some(Notice::Success("Job nightly completed successfully".into()))
        );
        ev.description = Some("3 steps".into());
        assert_eq!(Notice::for_event(&ev).unwrap().text(), "Job nightly completed successfully: 3 steps");
    }

    #[test]
    fn failure_notice_appends_custom_text() {
        let mut ev = event(JobStatus::Failed);
        assert_eq!(Notice::for_event(&ev), Some(Notice::Error("Job nightly failed".into())));

        ev.custom_text = Some("Step 2 exited 1".into());
        ev.description = Some("see log".into());
        assert_eq!(
            Notice::for_event(&ev),
            Some(Notice::Error("Job nightly failed: Step 2 exited 1 see log".into()))
        );
    }

    #[test]
    fn terminal_failures_notify_as_errors() {
        for status in [JobStatus::InternalError, JobStatus::Aborted, JobStatus::DependencyFailure] {
            assert!(matches!(Notice::for_event(&event(status)), Some(Notice::Error(_))));
        }
    }

    #[test]
    fn falls_back_to_job_id_for_name() {
        let mut ev = event(JobStatus::Success);
        ev.job_name = None;
        assert_eq!(Notice::for_event(&ev).unwrap().text(), "Job 42 completed successfully");
    }

    #[test]
    fn no_notice_for_running_disabled_or_suppressed() {
        assert_eq!(Notice::for_event(&event(JobStatus::Running)), None);
        assert_eq!(Notice::for_event(&event(JobStatus::Disabled)), None);

        let mut ev = event(JobStatus::Success);
        ev.notification.browser = false;
        assert_eq!(Notice::for_event(&ev), None);
    }

    #[test]
    fn no_notice_without_job_id() {
        let mut ev = event(JobStatus::Failed);
        ev.job_id = None;
        assert_eq!(Notice::for_event(&ev), None);
    }

    #[test]
    fn panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*boxed), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }
}
