//! The SOS pipeline orchestrator: one trigger in, a durable alert record,
//! best-effort evidence/location, a matched responder, fan-out, and the
//! offline fallback out — surviving partial failure at every step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use beacon_common::{
    AlertSession, BeaconError, PipelineConfig, RecordingStatus, SessionPatch, SessionStatus,
    TriggerSource,
};

use crate::acquisition::{AcquisitionCoordinator, LiveLocationHandle};
use crate::fallback::{EscalationOutcome, FallbackEscalator};
use crate::fanout::NotificationFanout;
use crate::gate::{Submission, TriggerGate};
use crate::geo::nearest_station;
use crate::store::{AlertStore, ContactDirectory, StationRegistry};
use crate::traits::{
    CaptureActivity, CaptureEvent, ConnectivityProbe, DocumentStore, LocationProvider, SmsSender,
};

/// What one trigger call produced.
#[derive(Debug)]
pub struct TriggerOutcome {
    pub session_id: Uuid,
    /// The trigger attached to an already in-flight session.
    pub reentry: bool,
    /// Contacts notified by fan-out. `None` when the batch failed (logged,
    /// retriable by the caller).
    pub dispatched: Option<usize>,
    /// Fallback decision for this dispatch. `None` on re-entry.
    pub escalation: Option<EscalationOutcome>,
}

/// Per-session background work, torn down idempotently.
struct SessionRuntime {
    owner_id: String,
    watcher: Option<JoinHandle<()>>,
    live_location: Option<LiveLocationHandle>,
    linger: Option<JoinHandle<()>>,
}

struct PipelineInner {
    config: PipelineConfig,
    gate: TriggerGate,
    store: AlertStore,
    stations: StationRegistry,
    directory: ContactDirectory,
    acquisition: AcquisitionCoordinator,
    fanout: NotificationFanout,
    fallback: FallbackEscalator,
    sessions: Mutex<HashMap<Uuid, SessionRuntime>>,
}

/// Cheaply cloneable pipeline handle; clones share all session state.
#[derive(Clone)]
pub struct SosPipeline {
    inner: Arc<PipelineInner>,
}

impl SosPipeline {
    pub fn new(
        backend: Arc<dyn DocumentStore>,
        location: Arc<dyn LocationProvider>,
        capture: Arc<dyn CaptureActivity>,
        connectivity: Arc<dyn ConnectivityProbe>,
        sms: Arc<dyn SmsSender>,
        config: PipelineConfig,
    ) -> Self {
        let store = AlertStore::new(backend.clone(), config.store_call_timeout);
        Self {
            inner: Arc::new(PipelineInner {
                gate: TriggerGate::new(config.trigger_cooldown),
                stations: StationRegistry::new(backend.clone(), config.store_call_timeout),
                directory: ContactDirectory::new(backend.clone(), config.store_call_timeout),
                acquisition: AcquisitionCoordinator::new(location, capture, store.clone(), &config),
                fanout: NotificationFanout::new(backend, config.store_call_timeout),
                fallback: FallbackEscalator::new(
                    connectivity,
                    sms,
                    config.default_emergency_number.clone(),
                    config.sms_send_timeout,
                ),
                store,
                config,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Handle one trigger signal end to end.
    ///
    /// Mandatory steps (authentication, initial record creation) propagate
    /// errors; optional enrichment (location, evidence, fallback) degrades
    /// the session instead. Returns once dispatch is decided; capture and
    /// live location continue in the background.
    pub async fn trigger(
        &self,
        principal: Option<&str>,
        source: TriggerSource,
    ) -> Result<TriggerOutcome, BeaconError> {
        let submission = self.inner.gate.submit(principal, source, Utc::now())?;
        let owner_id = principal.unwrap_or_default().trim().to_string();

        match submission {
            Submission::Reentry(session_id) => {
                self.reenter(session_id).await;
                Ok(TriggerOutcome {
                    session_id,
                    reentry: true,
                    dispatched: None,
                    escalation: None,
                })
            }
            Submission::New(session_id) => self.open_session(session_id, owner_id, source).await,
        }
    }

    /// Re-entry while capture is in flight: relaunch the visible capture
    /// activity against the same session. The platform requires capture to
    /// run in a visible surface, so a second trigger reopens it.
    async fn reenter(&self, session_id: Uuid) {
        let watcher_alive = {
            let sessions = self.inner.sessions.lock().expect("session registry poisoned");
            sessions
                .get(&session_id)
                .and_then(|rt| rt.watcher.as_ref())
                .is_some_and(|w| !w.is_finished())
        };
        if watcher_alive {
            info!(%session_id, "re-entry: capture already active, nothing to relaunch");
            return;
        }
        match self.inner.acquisition.launch_capture(session_id).await {
            Ok(events) => {
                // The previous watcher finished, so a teardown timer is
                // pending; the revived capture must outlive it.
                self.disarm_linger(session_id);
                self.spawn_capture_watcher(session_id, events);
            }
            Err(err) => warn!(%session_id, error = %err, "re-entry capture relaunch failed"),
        }
    }

    /// Cancel a pending teardown timer for a session revived by re-entry.
    fn disarm_linger(&self, session_id: Uuid) {
        let mut sessions = self.inner.sessions.lock().expect("session registry poisoned");
        if let Some(runtime) = sessions.get_mut(&session_id) {
            if let Some(linger) = runtime.linger.take() {
                linger.abort();
            }
        }
    }

    async fn open_session(
        &self,
        session_id: Uuid,
        owner_id: String,
        source: TriggerSource,
    ) -> Result<TriggerOutcome, BeaconError> {
        let inner = &self.inner;

        // Capture is launched before anything else and never waits on the
        // store or the location fix.
        let capture_events = match inner.acquisition.launch_capture(session_id).await {
            Ok(events) => Some(events),
            Err(err) => {
                warn!(%session_id, error = %err, "capture activity could not be launched");
                None
            }
        };

        let location = inner.acquisition.resolve_location().await;
        let stations = match inner.stations.all().await {
            Ok(stations) => stations,
            Err(err) => {
                warn!(%session_id, error = %err, "station registry unavailable");
                Vec::new()
            }
        };
        let station = location.and_then(|point| nearest_station(point, &stations));

        let mut session = AlertSession::open(session_id, owner_id.clone(), source);
        session.location = location;
        session.assigned_station_id = station.as_ref().map(|m| m.station_id.clone());
        if capture_events.is_none() {
            // No watcher will ever run for this session, so nothing else can
            // advance it; mark it terminal at birth.
            session.status = SessionStatus::Failed;
            session.recording_status = RecordingStatus::Failed;
            session.recording_failure_reason =
                Some("capture activity could not be launched".to_string());
        }

        // Initial record creation is the one mandatory write.
        let created = match inner.store.create_session(&session).await {
            Ok(created) => created,
            Err(err) => {
                error!(%session_id, error = %err, "initial alert write failed");
                drop(capture_events);
                inner.acquisition.abort_capture(session_id).await;
                inner.gate.rescind(&owner_id, source);
                return Err(err);
            }
        };
        info!(%session_id, %source, station = ?created.assigned_station_id, "alert session created");

        inner
            .sessions
            .lock()
            .expect("session registry poisoned")
            .insert(
                session_id,
                SessionRuntime {
                    owner_id: owner_id.clone(),
                    watcher: None,
                    live_location: None,
                    linger: None,
                },
            );

        // Only now may capture outcomes merge: create happens-before merge.
        match capture_events {
            Some(events) => self.spawn_capture_watcher(session_id, events),
            None => self.schedule_linger(session_id),
        }

        // Fan-out and fallback are independent of each other; neither may
        // stall the other.
        let profile = match inner.directory.profile_of(&owner_id).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(%session_id, error = %err, "owner profile unavailable");
                Default::default()
            }
        };
        let links = match inner.directory.links_for(&owner_id).await {
            Ok(links) => links,
            Err(err) => {
                warn!(%session_id, error = %err, "contact links unavailable");
                Vec::new()
            }
        };
        let contact_numbers: Vec<String> =
            links.iter().filter_map(|link| link.phone.clone()).collect();
        let station_contact = station.as_ref().and_then(|m| m.contact_channel.as_deref());

        let (dispatch, escalation) = tokio::join!(
            inner.fanout.dispatch(&created, &profile, &links),
            inner.fallback.escalate_if_offline(
                &profile.name,
                location,
                station_contact,
                &contact_numbers,
            ),
        );
        let dispatched = match dispatch {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(%session_id, error = %err, "fan-out failed; whole batch retriable");
                None
            }
        };

        let live = inner.acquisition.start_live_location(session_id).await;
        let mut sessions = inner.sessions.lock().expect("session registry poisoned");
        match sessions.get_mut(&session_id) {
            Some(runtime) => runtime.live_location = Some(live),
            // Session already torn down (fast capture failure); don't leak.
            None => live.stop(),
        }
        drop(sessions);

        Ok(TriggerOutcome {
            session_id,
            reentry: false,
            dispatched,
            escalation: Some(escalation),
        })
    }

    /// Explicit cancel before a terminal acquisition state. Rejected once the
    /// session is terminal (terminal states do not revert).
    pub async fn cancel(&self, session_id: Uuid) -> Result<(), BeaconError> {
        self.inner
            .store
            .merge(
                session_id,
                SessionPatch::builder()
                    .status(SessionStatus::Cancelled)
                    .cancelled_at(Utc::now())
                    .build(),
            )
            .await?;
        info!(%session_id, "alert session cancelled");
        self.inner.acquisition.abort_capture(session_id).await;
        self.teardown(session_id);
        Ok(())
    }

    /// Typed access to the alert records, mainly for callers rendering state.
    pub fn store(&self) -> &AlertStore {
        &self.inner.store
    }

    /// Await the capture watcher for a session, if one is running. Used by
    /// shutdown paths and tests to observe the terminal transition.
    pub async fn join_capture(&self, session_id: Uuid) {
        let watcher = {
            let mut sessions = self.inner.sessions.lock().expect("session registry poisoned");
            sessions
                .get_mut(&session_id)
                .and_then(|rt| rt.watcher.take())
        };
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
    }

    fn spawn_capture_watcher(
        &self,
        session_id: Uuid,
        events: tokio::sync::mpsc::Receiver<CaptureEvent>,
    ) {
        let pipeline = self.clone();
        let watcher = tokio::spawn(async move {
            let terminal = pipeline
                .inner
                .acquisition
                .watch_capture(session_id, events)
                .await;
            info!(%session_id, ?terminal, "capture reached a terminal state");
            pipeline.schedule_linger(session_id);
        });
        let mut sessions = self.inner.sessions.lock().expect("session registry poisoned");
        if let Some(runtime) = sessions.get_mut(&session_id) {
            runtime.watcher = Some(watcher);
        }
    }

    /// (Re)arm the post-terminal grace timer. Trailing writes get
    /// `session_linger` to land before the session context is torn down.
    fn schedule_linger(&self, session_id: Uuid) {
        let pipeline = self.clone();
        let delay = self.inner.config.session_linger;
        let linger = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pipeline.teardown(session_id);
        });
        let mut sessions = self.inner.sessions.lock().expect("session registry poisoned");
        match sessions.get_mut(&session_id) {
            Some(runtime) => {
                if let Some(previous) = runtime.linger.replace(linger) {
                    previous.abort();
                }
            }
            None => linger.abort(),
        }
    }

    /// Stop every background task for a session and clear the in-flight
    /// flag. Idempotent; safe after the session already terminated.
    fn teardown(&self, session_id: Uuid) {
        let runtime = self
            .inner
            .sessions
            .lock()
            .expect("session registry poisoned")
            .remove(&session_id);
        let Some(runtime) = runtime else {
            return;
        };
        if let Some(live) = runtime.live_location {
            live.stop();
        }
        if let Some(watcher) = runtime.watcher {
            watcher.abort();
        }
        if let Some(linger) = runtime.linger {
            linger.abort();
        }
        self.inner.gate.complete(&runtime.owner_id);
        info!(%session_id, "session context torn down");
    }
}
