// Test mocks for the SOS pipeline.
//
// Five mocks matching the five trait boundaries:
// - MemoryDocumentStore (DocumentStore) — in-memory collections with
//   shallow-merge and atomic-batch semantics, plus failure injection
// - MockLocationProvider (LocationProvider) — per-tier scripted fixes
// - ScriptedCapture (CaptureActivity) — replays a fixed event sequence
// - StaticConnectivity (ConnectivityProbe) — fixed online/offline answer
// - RecordingSmsSender (SmsSender) — records sends, scripted failures
//
// Plus helpers for constructing stations, contact links, and profiles.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use beacon_common::{ContactLink, GeoPoint, StationRecord};

use crate::traits::{
    AccuracyTier, BatchWrite, CaptureActivity, CaptureEvent, ConnectivityProbe, Document,
    DocumentStore, LocationProvider, SmsSender, StoreError,
};

// ---------------------------------------------------------------------------
// MemoryDocumentStore
// ---------------------------------------------------------------------------

/// In-memory document store with the collaborator contract: create fails on
/// collision, merge_update is a shallow upsert-merge, commit_batch applies
/// all writes or none.
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    fail_creates: AtomicBool,
    fail_batches: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            fail_creates: AtomicBool::new(false),
            fail_batches: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `create` fail, simulating a dead backend.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `commit_batch` fail atomically.
    pub fn fail_batches(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }

    /// Seed a document directly, bypassing the create-collision check.
    pub fn seed(&self, collection: &str, id: &str, doc: Value) {
        let mut collections = self.collections.lock().unwrap();
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
    }

    pub fn count(&self, collection: &str) -> usize {
        let collections = self.collections.lock().unwrap();
        collections.get(collection).map_or(0, BTreeMap::len)
    }

    pub fn raw(&self, collection: &str, id: &str) -> Option<Value> {
        let collections = self.collections.lock().unwrap();
        collections.get(collection)?.get(id).cloned()
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn shallow_merge(existing: &mut Value, partial: Value) {
    match (existing.as_object_mut(), partial) {
        (Some(target), Value::Object(updates)) => {
            for (key, value) in updates {
                target.insert(key, value);
            }
        }
        (_, partial) => *existing = partial,
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("backend unavailable".to_string()));
        }
        let mut collections = self.collections.lock().unwrap();
        let bucket = collections.entry(collection.to_string()).or_default();
        if bucket.contains_key(id) {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        bucket.insert(id.to_string(), doc);
        Ok(())
    }

    async fn merge_update(
        &self,
        collection: &str,
        id: &str,
        partial: Value,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().unwrap();
        let bucket = collections.entry(collection.to_string()).or_default();
        match bucket.get_mut(id) {
            Some(existing) => shallow_merge(existing, partial),
            None => {
                bucket.insert(id.to_string(), partial);
            }
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(collection)
            .and_then(|bucket| bucket.get(id))
            .cloned())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(collection)
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|(id, body)| Document {
                        id: id.clone(),
                        body: body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Document>, StoreError> {
        let docs = self.list(collection).await?;
        Ok(docs
            .into_iter()
            .filter(|doc| doc.body.get(field).and_then(Value::as_str) == Some(value))
            .collect())
    }

    async fn commit_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("batch commit refused".to_string()));
        }
        // All validation happens before any write lands, so a failure leaves
        // nothing behind.
        let mut collections = self.collections.lock().unwrap();
        for write in writes {
            let bucket = collections.entry(write.collection).or_default();
            match bucket.get_mut(&write.id) {
                Some(existing) => shallow_merge(existing, write.doc),
                None => {
                    bucket.insert(write.id, write.doc);
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockLocationProvider
// ---------------------------------------------------------------------------

/// Scripted location provider. Unset tiers return `Ok(None)`; a delay above
/// the pipeline's bound simulates a hung fix.
pub struct MockLocationProvider {
    fresh: Option<GeoPoint>,
    last_known: Option<GeoPoint>,
    fix_delay: Duration,
    watch_fixes: Vec<GeoPoint>,
}

impl MockLocationProvider {
    pub fn unavailable() -> Self {
        Self {
            fresh: None,
            last_known: None,
            fix_delay: Duration::ZERO,
            watch_fixes: Vec::new(),
        }
    }

    pub fn with_fresh_fix(point: GeoPoint) -> Self {
        Self {
            fresh: Some(point),
            ..Self::unavailable()
        }
    }

    pub fn with_last_known_only(point: GeoPoint) -> Self {
        Self {
            last_known: Some(point),
            ..Self::unavailable()
        }
    }

    pub fn delayed_by(mut self, delay: Duration) -> Self {
        self.fix_delay = delay;
        self
    }

    pub fn streaming(mut self, fixes: Vec<GeoPoint>) -> Self {
        self.watch_fixes = fixes;
        self
    }
}

#[async_trait]
impl LocationProvider for MockLocationProvider {
    async fn get_fix(&self, tier: AccuracyTier) -> anyhow::Result<Option<GeoPoint>> {
        if !self.fix_delay.is_zero() {
            tokio::time::sleep(self.fix_delay).await;
        }
        Ok(match tier {
            AccuracyTier::HighAccuracy => self.fresh,
            AccuracyTier::LastKnown => self.last_known,
        })
    }

    async fn watch(&self, _interval: Duration) -> anyhow::Result<mpsc::Receiver<GeoPoint>> {
        let (tx, rx) = mpsc::channel(8);
        let fixes = self.watch_fixes.clone();
        tokio::spawn(async move {
            for fix in fixes {
                if tx.send(fix).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// ScriptedCapture
// ---------------------------------------------------------------------------

/// Replays a fixed capture-event sequence on every launch. Records launches
/// and force-stops. An empty script hangs the channel open, which is how a
/// capture that never reports is simulated.
pub struct ScriptedCapture {
    script: Vec<CaptureEvent>,
    event_delay: Duration,
    launch_error: Option<String>,
    launches: Mutex<Vec<Uuid>>,
    force_stops: Mutex<Vec<Uuid>>,
}

impl ScriptedCapture {
    pub fn new(script: Vec<CaptureEvent>) -> Self {
        Self {
            script,
            event_delay: Duration::ZERO,
            launch_error: None,
            launches: Mutex::new(Vec::new()),
            force_stops: Mutex::new(Vec::new()),
        }
    }

    /// A capture whose launch itself errors (activity start rejected).
    pub fn refusing_launch(reason: &str) -> Self {
        Self {
            launch_error: Some(reason.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// A capture that starts and finishes cleanly.
    pub fn clean(path: &str) -> Self {
        Self::new(vec![
            CaptureEvent::Started {
                path: path.to_string(),
            },
            CaptureEvent::Finished {
                path: path.to_string(),
            },
        ])
    }

    /// A capture that fails before producing output.
    pub fn failing(reason: &str) -> Self {
        Self::new(vec![CaptureEvent::Failed {
            reason: reason.to_string(),
        }])
    }

    /// A capture that starts but never reports a terminal event.
    pub fn stalled_after_start(path: &str) -> Self {
        Self::new(vec![CaptureEvent::Started {
            path: path.to_string(),
        }])
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    pub fn force_stopped(&self, session_id: Uuid) -> bool {
        self.force_stops.lock().unwrap().contains(&session_id)
    }
}

#[async_trait]
impl CaptureActivity for ScriptedCapture {
    async fn launch(&self, session_id: Uuid) -> anyhow::Result<mpsc::Receiver<CaptureEvent>> {
        self.launches.lock().unwrap().push(session_id);
        if let Some(reason) = &self.launch_error {
            anyhow::bail!("{reason}");
        }
        let (tx, rx) = mpsc::channel(4);
        let script = self.script.clone();
        let delay = self.event_delay;
        tokio::spawn(async move {
            for event in script {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            // Keep the channel open past the script so a missing terminal
            // event looks like a stalled capture, not a closed channel.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(tx);
        });
        Ok(rx)
    }

    async fn force_stop(&self, session_id: Uuid) {
        self.force_stops.lock().unwrap().push(session_id);
    }
}

// ---------------------------------------------------------------------------
// StaticConnectivity
// ---------------------------------------------------------------------------

pub struct StaticConnectivity(pub bool);

#[async_trait]
impl ConnectivityProbe for StaticConnectivity {
    async fn is_online(&self) -> bool {
        self.0
    }
}

// ---------------------------------------------------------------------------
// RecordingSmsSender
// ---------------------------------------------------------------------------

/// Records every attempted send; recipients in `failing` error out.
pub struct RecordingSmsSender {
    available: bool,
    failing: HashSet<String>,
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSmsSender {
    pub fn new() -> Self {
        Self {
            available: true,
            failing: HashSet::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn failing_for(mut self, recipient: &str) -> Self {
        self.failing.insert(recipient.to_string());
        self
    }

    /// (recipient, body) pairs, in attempt order.
    pub fn attempts(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.attempts().into_iter().map(|(r, _)| r).collect()
    }
}

impl Default for RecordingSmsSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmsSender for RecordingSmsSender {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn send(&self, recipient: &str, body: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), body.to_string()));
        if self.failing.contains(recipient) {
            anyhow::bail!("carrier rejected message to {recipient}");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixture helpers
// ---------------------------------------------------------------------------

pub fn station_doc(lat: f64, lon: f64, radius_km: Option<f64>, contact: Option<&str>) -> Value {
    let mut doc = json!({
        "location": { "lat": lat, "lon": lon },
    });
    if let Some(radius) = radius_km {
        doc["jurisdiction_radius_km"] = json!(radius);
    }
    if let Some(contact) = contact {
        doc["contact_channel"] = json!(contact);
    }
    doc
}

pub fn contact_link_doc(owner_id: &str, contact_user_id: &str, relation: &str, phone: Option<&str>) -> Value {
    let mut doc = json!({
        "owner_id": owner_id,
        "contact_user_id": contact_user_id,
        "relation": relation,
    });
    if let Some(phone) = phone {
        doc["phone"] = json!(phone);
    }
    doc
}

pub fn profile_doc(name: &str, phone: &str) -> Value {
    json!({ "name": name, "phone": phone })
}

pub fn station_record(id: &str, lat: f64, lon: f64, radius_km: Option<f64>) -> StationRecord {
    StationRecord {
        id: id.to_string(),
        location: Some(GeoPoint::new(lat, lon)),
        jurisdiction_radius_km: radius_km,
        contact_channel: None,
    }
}

pub fn contact_link(owner_id: &str, contact_user_id: &str, phone: Option<&str>) -> ContactLink {
    ContactLink {
        id: format!("link-{contact_user_id}"),
        owner_id: owner_id.to_string(),
        contact_user_id: contact_user_id.to_string(),
        relation: "friend".to_string(),
        phone: phone.map(str::to_string),
    }
}
