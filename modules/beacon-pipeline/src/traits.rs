// Trait seams for the pipeline's external collaborators.
//
// DocumentStore — the durable document backend (sessions, registries, inboxes).
// LocationProvider / CaptureActivity / ConnectivityProbe / SmsSender — the
//   platform capabilities the pipeline orchestrates but does not own.
//
// These enable deterministic testing with the mocks in `testing`: no device,
// no backend, no network.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use beacon_common::GeoPoint;

// ---------------------------------------------------------------------------
// DocumentStore
// ---------------------------------------------------------------------------

/// A document read from the store, with its id.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

/// One write inside an atomic batch. Upsert-with-merge semantics.
#[derive(Debug, Clone)]
pub struct BatchWrite {
    pub collection: String,
    pub id: String,
    pub doc: Value,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("document {collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Durable document store. Collection/id addressed, JSON documents.
///
/// `merge_update` is a shallow merge: top-level keys present in the partial
/// overwrite, everything else is untouched. `commit_batch` is all-or-nothing.
/// Callers bound every method with their own timeout.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError>;

    async fn merge_update(&self, collection: &str, id: &str, partial: Value)
        -> Result<(), StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// All documents in a collection. Registries are small; no paging.
    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError>;

    /// Documents whose top-level `field` equals `value`.
    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Document>, StoreError>;

    /// Commit every write or none of them.
    async fn commit_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// LocationProvider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccuracyTier {
    /// Fresh high-accuracy fix.
    HighAccuracy,
    /// Cached last-known fix.
    LastKnown,
}

/// Platform location capability. `get_fix` may legitimately return `Ok(None)`
/// (no permission, no satellites); the pipeline treats both `None` and errors
/// as a missing fix, never as fatal.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn get_fix(&self, tier: AccuracyTier) -> anyhow::Result<Option<GeoPoint>>;

    /// Periodic fixes for the lifetime of a session. The receiver closing is
    /// the stop signal for the producer.
    async fn watch(&self, interval: Duration) -> anyhow::Result<mpsc::Receiver<GeoPoint>>;
}

// ---------------------------------------------------------------------------
// CaptureActivity
// ---------------------------------------------------------------------------

/// Events reported back from the out-of-process evidence capture.
/// Zero or one `Started`, then exactly one terminal event per launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Started { path: String },
    Finished { path: String },
    Failed { reason: String },
}

/// The external, UI-visible evidence capture flow. The platform forbids
/// headless capture, so the pipeline only launches it and listens.
#[async_trait]
pub trait CaptureActivity: Send + Sync {
    async fn launch(&self, session_id: Uuid) -> anyhow::Result<mpsc::Receiver<CaptureEvent>>;

    /// Ask a running capture to stop. Best effort.
    async fn force_stop(&self, session_id: Uuid);
}

// ---------------------------------------------------------------------------
// ConnectivityProbe
// ---------------------------------------------------------------------------

/// Point-in-time network availability. Checked once per fallback decision,
/// never polled, to avoid flapping.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

// ---------------------------------------------------------------------------
// SmsSender
// ---------------------------------------------------------------------------

/// Degraded-channel sender. Per-recipient, independent sends; message
/// chunking is the sender's concern.
#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Whether the capability exists at all on this device/build.
    fn is_available(&self) -> bool;

    async fn send(&self, recipient: &str, body: &str) -> anyhow::Result<()>;
}
