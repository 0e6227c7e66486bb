//! Best-effort evidence and location acquisition. Nothing here may block
//! alert creation or notification: every attempt is bounded, and a missing
//! fix or a dead capture degrades the session instead of failing it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use beacon_common::{
    BeaconError, GeoPoint, PipelineConfig, RecordingStatus, SessionPatch, SessionStatus,
};

use crate::store::AlertStore;
use crate::traits::{AccuracyTier, CaptureActivity, CaptureEvent, LocationProvider};

pub struct AcquisitionCoordinator {
    location: Arc<dyn LocationProvider>,
    capture: Arc<dyn CaptureActivity>,
    store: AlertStore,
    fresh_fix_timeout: Duration,
    last_known_fix_timeout: Duration,
    max_capture_duration: Duration,
    live_location_interval: Duration,
}

impl AcquisitionCoordinator {
    pub fn new(
        location: Arc<dyn LocationProvider>,
        capture: Arc<dyn CaptureActivity>,
        store: AlertStore,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            location,
            capture,
            store,
            fresh_fix_timeout: config.fresh_fix_timeout,
            last_known_fix_timeout: config.last_known_fix_timeout,
            max_capture_duration: config.max_capture_duration,
            live_location_interval: config.live_location_interval,
        }
    }

    /// Bounded two-stage fix: fresh high-accuracy first, last-known as the
    /// fallback. `None` when both fail — never an error.
    pub async fn resolve_location(&self) -> Option<GeoPoint> {
        let fresh = self.location.get_fix(AccuracyTier::HighAccuracy);
        match timeout(self.fresh_fix_timeout, fresh).await {
            Ok(Ok(Some(point))) => return Some(point),
            Ok(Ok(None)) => info!("no fresh fix available, trying last known"),
            Ok(Err(err)) => warn!(error = %err, "fresh fix failed, trying last known"),
            Err(_) => warn!("fresh fix timed out, trying last known"),
        }

        let last_known = self.location.get_fix(AccuracyTier::LastKnown);
        match timeout(self.last_known_fix_timeout, last_known).await {
            Ok(Ok(point)) => point,
            Ok(Err(err)) => {
                warn!(error = %err, "last-known fix failed; proceeding without location");
                None
            }
            Err(_) => {
                warn!("last-known fix timed out; proceeding without location");
                None
            }
        }
    }

    /// Launch the external capture activity. The caller decides when to start
    /// consuming the event channel (after the session record exists).
    pub async fn launch_capture(
        &self,
        session_id: Uuid,
    ) -> anyhow::Result<mpsc::Receiver<CaptureEvent>> {
        self.capture.launch(session_id).await
    }

    /// Best-effort stop for a capture whose session never materialized.
    pub async fn abort_capture(&self, session_id: Uuid) {
        self.capture.force_stop(session_id).await;
    }

    /// Consume capture events for one session, mirroring them into the alert
    /// record, and enforce the maximum capture duration. On expiry the
    /// capture is force-stopped and reported as finished when output was
    /// produced, failed otherwise. Returns the terminal recording status.
    pub async fn watch_capture(
        &self,
        session_id: Uuid,
        mut events: mpsc::Receiver<CaptureEvent>,
    ) -> RecordingStatus {
        let deadline = tokio::time::sleep(self.max_capture_duration);
        tokio::pin!(deadline);
        let mut started_path: Option<String> = None;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(CaptureEvent::Started { path }) => {
                        started_path = Some(path.clone());
                        let patch = SessionPatch::builder()
                            .status(SessionStatus::Recording)
                            .recording_status(RecordingStatus::Recording)
                            .local_media_path(path)
                            .build();
                        self.merge_capture_patch(session_id, patch).await;
                    }
                    Some(CaptureEvent::Finished { path }) => {
                        let patch = SessionPatch::builder()
                            .status(SessionStatus::Finished)
                            .recording_status(RecordingStatus::Finished)
                            .local_media_path(path)
                            .build();
                        self.merge_capture_patch(session_id, patch).await;
                        return RecordingStatus::Finished;
                    }
                    Some(CaptureEvent::Failed { reason }) => {
                        warn!(%session_id, %reason, "evidence capture failed");
                        let patch = SessionPatch::builder()
                            .status(SessionStatus::Failed)
                            .recording_status(RecordingStatus::Failed)
                            .recording_failure_reason(reason)
                            .build();
                        self.merge_capture_patch(session_id, patch).await;
                        return RecordingStatus::Failed;
                    }
                    None => {
                        warn!(%session_id, "capture channel closed without a terminal event");
                        let patch = SessionPatch::builder()
                            .status(SessionStatus::Failed)
                            .recording_status(RecordingStatus::Failed)
                            .recording_failure_reason("capture ended without reporting an outcome")
                            .build();
                        self.merge_capture_patch(session_id, patch).await;
                        return RecordingStatus::Failed;
                    }
                },
                _ = &mut deadline => {
                    info!(%session_id, "capture duration cap reached, force-stopping");
                    self.capture.force_stop(session_id).await;
                    let patch = match &started_path {
                        Some(path) => SessionPatch::builder()
                            .status(SessionStatus::Finished)
                            .recording_status(RecordingStatus::Finished)
                            .local_media_path(path.clone())
                            .build(),
                        None => SessionPatch::builder()
                            .status(SessionStatus::Failed)
                            .recording_status(RecordingStatus::Failed)
                            .recording_failure_reason(
                                "capture force-stopped at duration cap before producing output",
                            )
                            .build(),
                    };
                    self.merge_capture_patch(session_id, patch).await;
                    return match started_path {
                        Some(_) => RecordingStatus::Finished,
                        None => RecordingStatus::Failed,
                    };
                }
            }
        }
    }

    /// Merge a capture-outcome patch. A session that went terminal under us
    /// (explicit cancel) keeps its status; only the append-only evidence
    /// fields are retried.
    async fn merge_capture_patch(&self, session_id: Uuid, patch: SessionPatch) {
        let retry = SessionPatch {
            recording_failure_reason: patch.recording_failure_reason.clone(),
            local_media_path: patch.local_media_path.clone(),
            ..SessionPatch::default()
        };
        match self.store.merge(session_id, patch).await {
            Ok(()) => {}
            Err(BeaconError::SessionTerminal(_)) => {
                if let Err(err) = self.store.merge(session_id, retry).await {
                    warn!(%session_id, error = %err, "append-only capture merge failed");
                }
            }
            Err(err) => {
                warn!(%session_id, error = %err, "capture metadata merge failed");
            }
        }
    }

    /// Start the live-location merge stream for a session. Runs until the
    /// session goes terminal or the handle is stopped.
    pub async fn start_live_location(&self, session_id: Uuid) -> LiveLocationHandle {
        let provider = self.location.clone();
        let store = self.store.clone();
        let interval = self.live_location_interval;

        let task = tokio::spawn(async move {
            let mut fixes = match provider.watch(interval).await {
                Ok(rx) => rx,
                Err(err) => {
                    warn!(%session_id, error = %err, "live location stream unavailable");
                    return;
                }
            };
            while let Some(fix) = fixes.recv().await {
                let patch = SessionPatch::builder()
                    .location(fix)
                    .last_location_update_at(Utc::now())
                    .build();
                match store.merge(session_id, patch).await {
                    Ok(()) => {}
                    Err(BeaconError::SessionTerminal(_)) => break,
                    Err(err) => {
                        warn!(%session_id, error = %err, "live location merge failed");
                    }
                }
            }
        });

        LiveLocationHandle { task }
    }
}

/// Handle to a running live-location stream. `stop` is idempotent and safe
/// after the task already finished.
pub struct LiveLocationHandle {
    task: JoinHandle<()>,
}

impl LiveLocationHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}
