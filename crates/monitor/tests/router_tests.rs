//! Integration tests for status event routing against recording doubles.

mod common;

use std::sync::Arc;

use common::{HostCall, Notified, RecordingHost, RecordingNotifier};
use jobwatch_core::job_status::JobStatusUpdate;
use jobwatch_core::status::JobStatus;
use jobwatch_events::{EventBus, MonitorEvent};
use jobwatch_monitor::host::RefreshTarget;
use jobwatch_monitor::router::{Notice, RefreshOutcome, StatusEventRouter};
use serde_json::json;

const JOB_42: RefreshTarget = RefreshTarget::Job {
    server_id: 1,
    job_id: 42,
};
const JOBS_1: RefreshTarget = RefreshTarget::JobCollection { server_id: 1 };

fn update(value: serde_json::Value) -> JobStatusUpdate {
    serde_json::from_value(value).unwrap()
}

fn router(host: RecordingHost) -> (StatusEventRouter, Arc<RecordingHost>, Arc<RecordingNotifier>, Arc<EventBus>) {
    let host = Arc::new(host);
    let notifier = Arc::new(RecordingNotifier::default());
    let bus = Arc::new(EventBus::default());
    let router = StatusEventRouter::new(host.clone(), notifier.clone(), Arc::clone(&bus));
    (router, host, notifier, bus)
}

// ---------------------------------------------------------------------------
// Targeting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_for_job_refreshes_job_and_notifies() {
    let (router, host, notifier, _) = router(RecordingHost::with_loaded(&[JOB_42, JOBS_1]));

    let routed = router
        .on_event(update(json!({"sid": 1, "job_id": 42, "status": "s"})))
        .await
        .unwrap();

    assert_eq!(routed.refresh, RefreshOutcome::Refreshed(JOB_42));
    assert_eq!(
        routed.notice,
        Some(Notice::Success("Job 42 completed successfully".into()))
    );
    assert_eq!(host.calls(), vec![HostCall::Refresh(JOB_42.to_string())]);
    assert_eq!(
        notifier.notices(),
        vec![Notified::Success("Job 42 completed successfully".into())]
    );
}

#[tokio::test]
async fn failure_without_job_refreshes_collection_silently() {
    let (router, host, notifier, _) = router(RecordingHost::with_loaded(&[JOBS_1]));

    let routed = router
        .on_event(update(json!({"sid": 1, "status": "f", "job_id": null})))
        .await
        .unwrap();

    assert_eq!(routed.refresh, RefreshOutcome::Refreshed(JOBS_1));
    assert_eq!(routed.notice, None);
    assert_eq!(host.calls(), vec![HostCall::Refresh(JOBS_1.to_string())]);
    assert!(notifier.notices().is_empty());
}

#[tokio::test]
async fn unloaded_job_falls_back_to_collection() {
    let (router, host, _, _) = router(RecordingHost::with_loaded(&[JOBS_1]));

    let routed = router
        .on_event(update(json!({"sid": "1", "job_id": "42", "status": "r"})))
        .await
        .unwrap();

    assert_eq!(routed.refresh, RefreshOutcome::Refreshed(JOBS_1));
    assert_eq!(host.calls(), vec![HostCall::Refresh(JOBS_1.to_string())]);
}

#[tokio::test]
async fn nothing_loaded_skips_refresh_but_still_notifies() {
    let (router, host, notifier, _) = router(RecordingHost::default());

    let routed = router
        .on_event(update(json!({
            "sid": 1, "job_id": 42, "job_name": "backup", "status": "f",
            "custom_text": "Step vacuum failed", "description": "exit code 1"
        })))
        .await
        .unwrap();

    assert_eq!(routed.refresh, RefreshOutcome::Skipped);
    assert!(host.calls().is_empty());
    assert_eq!(
        notifier.notices(),
        vec![Notified::Error("Job backup failed: Step vacuum failed exit code 1".into())]
    );
}

#[tokio::test]
async fn failed_refresh_unloads_and_reloads() {
    let host = RecordingHost::with_loaded(&[JOB_42]);
    host.fail_refresh(true);
    let (router, host, _, _) = router(host);

    let routed = router
        .on_event(update(json!({"sid": 1, "job_id": 42, "status": "r"})))
        .await
        .unwrap();

    let node = JOB_42.to_string();
    assert_eq!(routed.refresh, RefreshOutcome::Reloaded(JOB_42));
    assert_eq!(
        host.calls(),
        vec![
            HostCall::Refresh(node.clone()),
            HostCall::Unload(node.clone()),
            HostCall::Reload(node),
        ]
    );
}

// ---------------------------------------------------------------------------
// Notification policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn browser_notices_can_be_suppressed() {
    let (router, host, notifier, _) = router(RecordingHost::with_loaded(&[JOB_42]));

    let routed = router
        .on_event(update(json!({
            "sid": 1, "job_id": 42, "status": "s", "notification": {"browser": false}
        })))
        .await
        .unwrap();

    assert_eq!(routed.notice, None);
    assert!(notifier.notices().is_empty());
    assert_eq!(host.calls().len(), 1);
}

#[tokio::test]
async fn word_statuses_are_normalized() {
    let (router, _, notifier, _) = router(RecordingHost::default());

    let routed = router
        .on_event(update(json!({"sid": 1, "job_id": 5, "status": "Aborted"})))
        .await
        .unwrap();

    assert_eq!(routed.event.status, JobStatus::Aborted);
    assert_eq!(notifier.notices(), vec![Notified::Error("Job 5 failed".into())]);
}

// ---------------------------------------------------------------------------
// Validation and isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_updates_are_discarded() {
    let (router, host, notifier, bus) = router(RecordingHost::with_loaded(&[JOBS_1]));
    let mut events = bus.subscribe();

    assert!(router.on_event(update(json!({"sid": 1, "job_id": 42}))).await.is_none());
    assert!(router.on_event(update(json!({"sid": 1, "status": "  "}))).await.is_none());
    assert!(router.on_event(update(json!({"job_id": 42, "status": "s"}))).await.is_none());

    assert!(host.calls().is_empty());
    assert!(notifier.notices().is_empty());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn panicking_host_does_not_stop_later_events() {
    let (router, host, _, _) = router(RecordingHost::with_loaded(&[JOBS_1]));

    host.panic_on_locate(true);
    assert!(router
        .on_event(update(json!({"sid": 1, "status": "r"})))
        .await
        .is_none());

    host.panic_on_locate(false);
    let routed = router
        .on_event(update(json!({"sid": 1, "status": "r"})))
        .await
        .unwrap();
    assert_eq!(routed.refresh, RefreshOutcome::Refreshed(JOBS_1));
}

#[tokio::test]
async fn accepted_events_are_published() {
    let (router, _, _, bus) = router(RecordingHost::default());
    let mut events = bus.subscribe();

    router
        .on_event(update(json!({"sid": 3, "job_id": 9, "status": "d"})))
        .await
        .unwrap();

    match events.try_recv().unwrap() {
        MonitorEvent::JobStatusChanged {
            server_id,
            job_id,
            status,
            ..
        } => {
            assert_eq!(server_id, 3);
            assert_eq!(job_id, Some(9));
            assert_eq!(status, JobStatus::Disabled);
        }
        other => panic!("Expected JobStatusChanged, got {other:?}"),
    }
}
