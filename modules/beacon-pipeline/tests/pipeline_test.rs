//! End-to-end tests for the SOS pipeline: trigger to terminal status against
//! in-memory collaborators. No device, no backend, no network.

use std::sync::Arc;
use std::time::Duration;

use beacon_common::{PipelineConfig, RecordingStatus, SessionStatus, TriggerSource};
use beacon_pipeline::store::collections;
use beacon_pipeline::testing::{
    contact_link_doc, profile_doc, station_doc, MemoryDocumentStore, MockLocationProvider,
    RecordingSmsSender, ScriptedCapture, StaticConnectivity,
};
use beacon_pipeline::{BeaconError, EscalationOutcome, SosPipeline};

const OWNER: &str = "owner-1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        trigger_cooldown: Duration::from_secs(15),
        fresh_fix_timeout: Duration::from_millis(50),
        last_known_fix_timeout: Duration::from_millis(50),
        store_call_timeout: Duration::from_secs(1),
        max_capture_duration: Duration::from_millis(500),
        session_linger: Duration::from_millis(200),
        live_location_interval: Duration::from_millis(10),
        sms_send_timeout: Duration::from_secs(1),
        default_emergency_number: "112".to_string(),
    }
}

struct Harness {
    pipeline: SosPipeline,
    backend: Arc<MemoryDocumentStore>,
    capture: Arc<ScriptedCapture>,
    sms: Arc<RecordingSmsSender>,
}

fn harness(
    online: bool,
    location: MockLocationProvider,
    capture: ScriptedCapture,
    sms: RecordingSmsSender,
) -> Harness {
    init_tracing();
    let backend = Arc::new(MemoryDocumentStore::new());
    let capture = Arc::new(capture);
    let sms = Arc::new(sms);
    let pipeline = SosPipeline::new(
        backend.clone(),
        Arc::new(location),
        capture.clone(),
        Arc::new(StaticConnectivity(online)),
        sms.clone(),
        fast_config(),
    );
    Harness {
        pipeline,
        backend,
        capture,
        sms,
    }
}

fn seed_owner_with_contacts(backend: &MemoryDocumentStore) {
    backend.seed(
        collections::USERS,
        OWNER,
        profile_doc("Asha", "+91 99999 11111"),
    );
    backend.seed(
        collections::CONTACT_LINKS,
        "link-1",
        contact_link_doc(OWNER, "friend-1", "sister", Some("+91-555 0101")),
    );
    backend.seed(
        collections::CONTACT_LINKS,
        "link-2",
        contact_link_doc(OWNER, "friend-2", "neighbour", None),
    );
}

// =========================================================================
// Happy path
// =========================================================================

#[tokio::test]
async fn online_trigger_creates_matches_and_fans_out() {
    let h = harness(
        true,
        MockLocationProvider::with_fresh_fix(beacon_common::GeoPoint::new(12.97, 77.59)),
        ScriptedCapture::clean("/evidence/sos.mp4"),
        RecordingSmsSender::new(),
    );
    seed_owner_with_contacts(&h.backend);
    h.backend.seed(
        collections::STATIONS,
        "station-central",
        station_doc(12.96, 77.58, Some(10.0), Some("+91 100")),
    );
    h.backend.seed(
        collections::STATIONS,
        "station-far",
        station_doc(28.61, 77.20, Some(10.0), Some("+91 200")),
    );

    let outcome = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::Ui)
        .await
        .unwrap();
    assert!(!outcome.reentry);
    assert_eq!(outcome.dispatched, Some(2));
    assert_eq!(outcome.escalation, Some(EscalationOutcome::Online));
    assert!(h.sms.attempts().is_empty());
    assert_eq!(h.backend.count(collections::INBOX), 2);

    h.pipeline.join_capture(outcome.session_id).await;
    let session = h
        .pipeline
        .store()
        .get_session(outcome.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Finished);
    assert_eq!(session.assigned_station_id.as_deref(), Some("station-central"));
    assert!(session.location.is_some());
    assert_eq!(session.local_media_path.as_deref(), Some("/evidence/sos.mp4"));
}

// =========================================================================
// Degraded paths
// =========================================================================

#[tokio::test]
async fn offline_without_location_or_contacts_still_terminates_and_escalates() {
    let h = harness(
        false,
        MockLocationProvider::unavailable(),
        ScriptedCapture::failing("camera permission denied"),
        RecordingSmsSender::new(),
    );

    let outcome = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::VolumeComboAccessibility)
        .await
        .unwrap();
    assert_eq!(outcome.dispatched, Some(0));
    assert_eq!(outcome.escalation, Some(EscalationOutcome::Attempted(1)));
    // No station, no contacts: exactly the default emergency number.
    assert_eq!(h.sms.recipients(), vec!["112"]);

    h.pipeline.join_capture(outcome.session_id).await;
    let session = h
        .pipeline
        .store()
        .get_session(outcome.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.location.is_none());
    assert_eq!(
        session.recording_failure_reason.as_deref(),
        Some("camera permission denied")
    );
}

#[tokio::test]
async fn offline_fallback_prefers_station_then_contacts() {
    let h = harness(
        false,
        MockLocationProvider::with_last_known_only(beacon_common::GeoPoint::new(12.97, 77.59)),
        ScriptedCapture::clean("/evidence/sos.mp4"),
        RecordingSmsSender::new(),
    );
    seed_owner_with_contacts(&h.backend);
    h.backend.seed(
        collections::STATIONS,
        "station-central",
        station_doc(12.96, 77.58, Some(10.0), Some("+91 100")),
    );

    let outcome = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::Ui)
        .await
        .unwrap();
    assert_eq!(outcome.escalation, Some(EscalationOutcome::Attempted(2)));
    // Station contact first, then the one linked number; no default "112".
    assert_eq!(h.sms.recipients(), vec!["+91100", "+915550101"]);
    // Fan-out still ran independently of fallback.
    assert_eq!(outcome.dispatched, Some(2));
}

#[tokio::test]
async fn failed_capture_launch_makes_the_session_terminal_at_birth() {
    let h = harness(
        true,
        MockLocationProvider::unavailable(),
        ScriptedCapture::refusing_launch("activity start rejected"),
        RecordingSmsSender::new(),
    );
    seed_owner_with_contacts(&h.backend);

    let outcome = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::Ui)
        .await
        .unwrap();
    // Alert creation and fan-out still happen; only evidence is lost.
    assert_eq!(outcome.dispatched, Some(2));

    // No watcher exists to advance this session, so it must already be
    // terminal, not waiting on a capture that never started.
    let session = h
        .pipeline
        .store()
        .get_session(outcome.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.recording_status, RecordingStatus::Failed);
    assert_eq!(
        session.recording_failure_reason.as_deref(),
        Some("capture activity could not be launched")
    );
}

#[tokio::test]
async fn missing_sms_capability_is_absorbed() {
    let h = harness(
        false,
        MockLocationProvider::unavailable(),
        ScriptedCapture::clean("/evidence/sos.mp4"),
        RecordingSmsSender::unavailable(),
    );

    let outcome = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::Ui)
        .await
        .unwrap();
    assert_eq!(outcome.escalation, Some(EscalationOutcome::NoCapability));
    assert!(h.sms.attempts().is_empty());
}

// =========================================================================
// Deduplication and authentication
// =========================================================================

#[tokio::test]
async fn second_trigger_attaches_to_in_flight_session() {
    let h = harness(
        true,
        MockLocationProvider::unavailable(),
        ScriptedCapture::stalled_after_start("/evidence/partial.mp4"),
        RecordingSmsSender::new(),
    );

    let first = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::VolumeComboForeground)
        .await
        .unwrap();
    let second = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::VolumeComboForeground)
        .await
        .unwrap();

    assert_eq!(first.session_id, second.session_id);
    assert!(!first.reentry);
    assert!(second.reentry);
    // The watcher was still alive, so capture was not relaunched.
    assert_eq!(h.capture.launch_count(), 1);
    // Exactly one alert record exists.
    assert_eq!(h.backend.count(collections::ALERTS), 1);
}

#[tokio::test]
async fn reentry_relaunch_outlives_the_pending_teardown_timer() {
    // A capture that never reports: the watcher only finishes at the
    // duration cap (500ms), which arms the 200ms teardown grace timer.
    let h = harness(
        true,
        MockLocationProvider::unavailable(),
        ScriptedCapture::new(Vec::new()),
        RecordingSmsSender::new(),
    );

    let first = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::Ui)
        .await
        .unwrap();

    // Past the cap, inside the grace window: re-entry must relaunch.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let second = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::Ui)
        .await
        .unwrap();
    assert!(second.reentry);
    assert_eq!(h.capture.launch_count(), 2);

    // Past the moment the original grace timer would have fired. The session
    // must still be in flight for the relaunched capture.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let third = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::Ui)
        .await
        .unwrap();
    assert!(third.reentry, "third trigger opened a second session");
    assert_eq!(third.session_id, first.session_id);
    assert_eq!(h.backend.count(collections::ALERTS), 1);
}

#[tokio::test]
async fn unauthenticated_trigger_creates_nothing() {
    let h = harness(
        true,
        MockLocationProvider::unavailable(),
        ScriptedCapture::clean("/evidence/sos.mp4"),
        RecordingSmsSender::new(),
    );

    let err = h.pipeline.trigger(None, TriggerSource::Ui).await.unwrap_err();
    assert!(matches!(err, BeaconError::Unauthenticated));
    assert_eq!(h.backend.count(collections::ALERTS), 0);
    assert_eq!(h.capture.launch_count(), 0);
}

// =========================================================================
// Failure propagation
// =========================================================================

#[tokio::test]
async fn failed_initial_write_surfaces_and_clears_the_gate() {
    let h = harness(
        true,
        MockLocationProvider::unavailable(),
        ScriptedCapture::clean("/evidence/sos.mp4"),
        RecordingSmsSender::new(),
    );
    h.backend.fail_creates(true);

    let err = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::Ui)
        .await
        .unwrap_err();
    assert!(matches!(err, BeaconError::StoreWrite(_)));
    assert_eq!(h.backend.count(collections::ALERTS), 0);

    // The launched capture was not leaked.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.capture.launch_count(), 1);

    // The submission was rolled back in full: an immediate retry from the
    // same input pattern is not throttled by the cooldown.
    h.backend.fail_creates(false);
    let outcome = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::Ui)
        .await
        .unwrap();
    assert!(!outcome.reentry);
}

#[tokio::test]
async fn fanout_batch_failure_is_all_or_nothing() {
    let h = harness(
        true,
        MockLocationProvider::unavailable(),
        ScriptedCapture::clean("/evidence/sos.mp4"),
        RecordingSmsSender::new(),
    );
    seed_owner_with_contacts(&h.backend);
    h.backend.fail_batches(true);

    let outcome = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::Ui)
        .await
        .unwrap();
    // Dispatch failed as a unit; the session itself survives.
    assert_eq!(outcome.dispatched, None);
    assert_eq!(h.backend.count(collections::INBOX), 0);
    assert_eq!(h.backend.count(collections::ALERTS), 1);
}

// =========================================================================
// Cancellation
// =========================================================================

#[tokio::test]
async fn cancel_before_terminal_sticks_and_outlives_capture() {
    let h = harness(
        true,
        MockLocationProvider::unavailable(),
        ScriptedCapture::stalled_after_start("/evidence/partial.mp4"),
        RecordingSmsSender::new(),
    );

    let outcome = h
        .pipeline
        .trigger(Some(OWNER), TriggerSource::Ui)
        .await
        .unwrap();
    h.pipeline.cancel(outcome.session_id).await.unwrap();

    let session = h
        .pipeline
        .store()
        .get_session(outcome.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert!(session.cancelled_at.is_some());
    assert!(h.capture.force_stopped(outcome.session_id));

    // Terminal states do not revert; a second cancel is rejected.
    let err = h.pipeline.cancel(outcome.session_id).await.unwrap_err();
    assert!(matches!(err, BeaconError::SessionTerminal(_)));
}
