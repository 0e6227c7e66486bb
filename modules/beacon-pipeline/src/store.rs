//! Typed access to the durable document store.
//!
//! `AlertStore` owns the one core-mutable document, the alert session.
//! Updates are shallow merges, never full overwrites, and concurrent writers
//! follow a disjoint-field-ownership convention (only the capture watcher
//! writes `recording_status`, only the live-location task writes `location`
//! after create, only cancel writes `cancelled_at`), so no cross-writer lock
//! exists. `StationRegistry` and `ContactDirectory` are read-only views over
//! registries owned by the external registration workflow.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use uuid::Uuid;

use beacon_common::{
    AlertSession, BeaconError, ContactLink, OwnerProfile, SessionPatch, StationRecord,
};

use crate::traits::{Document, DocumentStore, StoreError};

/// Collection names, the contract shared with the excluded subsystems.
pub mod collections {
    pub const ALERTS: &str = "alerts";
    pub const STATIONS: &str = "stations";
    pub const USERS: &str = "users";
    pub const CONTACT_LINKS: &str = "contact_links";
    pub const INBOX: &str = "inbox";
}

fn map_store_error(err: StoreError) -> BeaconError {
    match err {
        StoreError::AlreadyExists { collection, id } => {
            BeaconError::StoreWrite(format!("{collection}/{id} already exists"))
        }
        StoreError::Backend(msg) => BeaconError::StoreWrite(msg),
    }
}

// ---------------------------------------------------------------------------
// AlertStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AlertStore {
    store: Arc<dyn DocumentStore>,
    call_timeout: Duration,
}

impl AlertStore {
    pub fn new(store: Arc<dyn DocumentStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    /// Durable, idempotency-checked initial write. The store stamps
    /// `created_at`/`updated_at`; client-supplied timestamps are discarded.
    pub async fn create_session(&self, session: &AlertSession) -> Result<AlertSession, BeaconError> {
        let mut stamped = session.clone();
        let now = Utc::now();
        stamped.created_at = Some(now);
        stamped.updated_at = Some(now);

        let doc = serde_json::to_value(&stamped)
            .map_err(|e| BeaconError::StoreWrite(e.to_string()))?;
        let doc_id = stamped.id.to_string();
        let write = self.store.create(collections::ALERTS, &doc_id, doc);
        match timeout(self.call_timeout, write).await {
            Ok(Ok(())) => Ok(stamped),
            Ok(Err(StoreError::AlreadyExists { .. })) => {
                Err(BeaconError::AlreadyExists(stamped.id))
            }
            Ok(Err(StoreError::Backend(msg))) => Err(BeaconError::StoreWrite(msg)),
            Err(_) => Err(BeaconError::StoreTimeout(self.call_timeout)),
        }
    }

    /// Shallow merge of a partial update. Fields absent from the patch stay
    /// untouched. Once the session is terminal, only append-only fields may
    /// still land; anything else is rejected.
    ///
    /// The terminal check reads then writes without a transaction. Status is
    /// only ever advanced by the capture watcher and the cancel path, and the
    /// remaining writers own disjoint fields, so the race window is benign.
    pub async fn merge(&self, id: Uuid, patch: SessionPatch) -> Result<(), BeaconError> {
        let current = self
            .get_session(id)
            .await?
            .ok_or(BeaconError::SessionNotFound(id))?;

        let mut partial = serde_json::to_value(&patch)
            .map_err(|e| BeaconError::StoreWrite(e.to_string()))?;
        let fields = partial
            .as_object_mut()
            .expect("SessionPatch serializes to an object");

        if current.status.is_terminal() {
            let disallowed = fields
                .keys()
                .any(|k| !SessionPatch::APPEND_ONLY_FIELDS.contains(&k.as_str()));
            if disallowed {
                return Err(BeaconError::SessionTerminal(id));
            }
            if fields.is_empty() {
                return Ok(());
            }
        }

        let now = Utc::now();
        let updated_at = current.updated_at.map_or(now, |prev| prev.max(now));
        fields.insert(
            "updated_at".to_string(),
            serde_json::to_value(updated_at).map_err(|e| BeaconError::StoreWrite(e.to_string()))?,
        );

        let doc_id = id.to_string();
        let write = self
            .store
            .merge_update(collections::ALERTS, &doc_id, partial);
        match timeout(self.call_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(map_store_error(err)),
            Err(_) => Err(BeaconError::StoreTimeout(self.call_timeout)),
        }
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<AlertSession>, BeaconError> {
        let doc_id = id.to_string();
        let read = self.store.get(collections::ALERTS, &doc_id);
        let doc = match timeout(self.call_timeout, read).await {
            Ok(Ok(doc)) => doc,
            Ok(Err(err)) => return Err(map_store_error(err)),
            Err(_) => return Err(BeaconError::StoreTimeout(self.call_timeout)),
        };
        doc.map(|body| {
            serde_json::from_value(body).map_err(|e| BeaconError::StoreWrite(e.to_string()))
        })
        .transpose()
    }
}

// ---------------------------------------------------------------------------
// StationRegistry
// ---------------------------------------------------------------------------

/// Read-only view of the approved responder stations.
#[derive(Clone)]
pub struct StationRegistry {
    store: Arc<dyn DocumentStore>,
    call_timeout: Duration,
}

impl StationRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    pub async fn all(&self) -> Result<Vec<StationRecord>, BeaconError> {
        let read = self.store.list(collections::STATIONS);
        let docs = match timeout(self.call_timeout, read).await {
            Ok(Ok(docs)) => docs,
            Ok(Err(err)) => return Err(map_store_error(err)),
            Err(_) => return Err(BeaconError::StoreTimeout(self.call_timeout)),
        };
        Ok(docs
            .into_iter()
            .filter_map(|doc| deserialize_with_id::<StationRecord>(doc, |r, id| r.id = id))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ContactDirectory
// ---------------------------------------------------------------------------

/// Read-only view of owner profiles and contact links.
#[derive(Clone)]
pub struct ContactDirectory {
    store: Arc<dyn DocumentStore>,
    call_timeout: Duration,
}

impl ContactDirectory {
    pub fn new(store: Arc<dyn DocumentStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    pub async fn links_for(&self, owner_id: &str) -> Result<Vec<ContactLink>, BeaconError> {
        let read = self
            .store
            .query(collections::CONTACT_LINKS, "owner_id", owner_id);
        let docs = match timeout(self.call_timeout, read).await {
            Ok(Ok(docs)) => docs,
            Ok(Err(err)) => return Err(map_store_error(err)),
            Err(_) => return Err(BeaconError::StoreTimeout(self.call_timeout)),
        };
        Ok(docs
            .into_iter()
            .filter_map(|doc| deserialize_with_id::<ContactLink>(doc, |l, id| l.id = id))
            .collect())
    }

    /// Phone numbers of every linked contact, in link order. Links without
    /// a number are skipped.
    pub async fn phone_numbers_for(&self, owner_id: &str) -> Result<Vec<String>, BeaconError> {
        Ok(self
            .links_for(owner_id)
            .await?
            .into_iter()
            .filter_map(|link| link.phone)
            .collect())
    }

    /// Missing or malformed profiles degrade to the default profile; fan-out
    /// should not fail because a display name is absent.
    pub async fn profile_of(&self, owner_id: &str) -> Result<OwnerProfile, BeaconError> {
        let read = self.store.get(collections::USERS, owner_id);
        let doc = match timeout(self.call_timeout, read).await {
            Ok(Ok(doc)) => doc,
            Ok(Err(err)) => return Err(map_store_error(err)),
            Err(_) => return Err(BeaconError::StoreTimeout(self.call_timeout)),
        };
        Ok(doc
            .and_then(|body| serde_json::from_value(body).ok())
            .unwrap_or_default())
    }
}

fn deserialize_with_id<T: serde::de::DeserializeOwned>(
    doc: Document,
    set_id: impl FnOnce(&mut T, String),
) -> Option<T> {
    match serde_json::from_value::<T>(doc.body) {
        Ok(mut parsed) => {
            set_id(&mut parsed, doc.id);
            Some(parsed)
        }
        Err(err) => {
            tracing::warn!(id = %doc.id, error = %err, "skipping malformed registry document");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDocumentStore;
    use beacon_common::{GeoPoint, SessionStatus, TriggerSource};

    fn alert_store(backend: &Arc<MemoryDocumentStore>) -> AlertStore {
        AlertStore::new(backend.clone() as Arc<dyn DocumentStore>, Duration::from_secs(5))
    }

    fn open_session() -> AlertSession {
        AlertSession::open(Uuid::new_v4(), "owner-1", TriggerSource::Ui)
    }

    #[tokio::test]
    async fn create_stamps_timestamps() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let store = alert_store(&backend);

        let created = store.create_session(&open_session()).await.unwrap();
        assert!(created.created_at.is_some());
        assert_eq!(created.created_at, created.updated_at);

        let read = store.get_session(created.id).await.unwrap().unwrap();
        assert_eq!(read.status, SessionStatus::Active);
        assert_eq!(read.created_at, created.created_at);
    }

    #[tokio::test]
    async fn duplicate_create_fails_with_already_exists() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let store = alert_store(&backend);

        let session = open_session();
        store.create_session(&session).await.unwrap();
        let err = store.create_session(&session).await.unwrap_err();
        assert!(matches!(err, BeaconError::AlreadyExists(id) if id == session.id));
    }

    #[tokio::test]
    async fn merge_is_order_independent_across_disjoint_fields() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let store = alert_store(&backend);

        let a = store.create_session(&open_session()).await.unwrap();
        let b = store.create_session(&open_session()).await.unwrap();

        let recording = || {
            SessionPatch::builder()
                .recording_status(beacon_common::RecordingStatus::Recording)
                .build()
        };
        let located = || SessionPatch::builder().location(GeoPoint::new(1.0, 2.0)).build();

        store.merge(a.id, recording()).await.unwrap();
        store.merge(a.id, located()).await.unwrap();

        store.merge(b.id, located()).await.unwrap();
        store.merge(b.id, recording()).await.unwrap();

        let a = store.get_session(a.id).await.unwrap().unwrap();
        let b = store.get_session(b.id).await.unwrap().unwrap();
        assert_eq!(a.recording_status, b.recording_status);
        assert_eq!(a.location, b.location);
        assert_eq!(a.location, Some(GeoPoint::new(1.0, 2.0)));
    }

    #[tokio::test]
    async fn merge_leaves_absent_fields_untouched() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let store = alert_store(&backend);

        let session = store.create_session(&open_session()).await.unwrap();
        store
            .merge(
                session.id,
                SessionPatch::builder().location(GeoPoint::new(9.0, 9.0)).build(),
            )
            .await
            .unwrap();

        let read = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(read.owner_id, "owner-1");
        assert_eq!(read.status, SessionStatus::Active);
        assert_eq!(read.location, Some(GeoPoint::new(9.0, 9.0)));
    }

    #[tokio::test]
    async fn terminal_session_rejects_non_append_only_merges() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let store = alert_store(&backend);

        let session = store.create_session(&open_session()).await.unwrap();
        store
            .merge(
                session.id,
                SessionPatch::builder().status(SessionStatus::Finished).build(),
            )
            .await
            .unwrap();

        let err = store
            .merge(
                session.id,
                SessionPatch::builder().status(SessionStatus::Active).build(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BeaconError::SessionTerminal(_)));

        // Append-only fields still land after the terminal transition.
        store
            .merge(
                session.id,
                SessionPatch::builder()
                    .recording_failure_reason("encoder died during flush")
                    .build(),
            )
            .await
            .unwrap();
        let read = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(read.status, SessionStatus::Finished);
        assert_eq!(
            read.recording_failure_reason.as_deref(),
            Some("encoder died during flush")
        );
    }

    #[tokio::test]
    async fn merge_of_unknown_session_fails() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let store = alert_store(&backend);
        let err = store
            .merge(Uuid::new_v4(), SessionPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BeaconError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn phone_numbers_skip_links_without_one() {
        let backend = Arc::new(MemoryDocumentStore::new());
        backend.seed(
            collections::CONTACT_LINKS,
            "link-1",
            crate::testing::contact_link_doc("owner-1", "friend-1", "sister", Some("+91 5")),
        );
        backend.seed(
            collections::CONTACT_LINKS,
            "link-2",
            crate::testing::contact_link_doc("owner-1", "friend-2", "neighbour", None),
        );

        let directory = ContactDirectory::new(
            backend.clone() as Arc<dyn DocumentStore>,
            Duration::from_secs(5),
        );
        let numbers = directory.phone_numbers_for("owner-1").await.unwrap();
        assert_eq!(numbers, vec!["+91 5"]);
    }

    #[tokio::test]
    async fn updated_at_never_decreases() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let store = alert_store(&backend);

        let session = store.create_session(&open_session()).await.unwrap();
        store
            .merge(
                session.id,
                SessionPatch::builder().location(GeoPoint::new(0.0, 0.0)).build(),
            )
            .await
            .unwrap();
        let read = store.get_session(session.id).await.unwrap().unwrap();
        assert!(read.updated_at >= read.created_at);
    }
}
