//! Transactional fan-out of one alert to every linked contact's inbox.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::info;

use beacon_common::{AlertSession, BeaconError, ContactLink, NotificationRecord, OwnerProfile};

use crate::store::collections;
use crate::traits::{BatchWrite, DocumentStore};

pub struct NotificationFanout {
    store: Arc<dyn DocumentStore>,
    call_timeout: Duration,
}

impl NotificationFanout {
    pub fn new(store: Arc<dyn DocumentStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    /// Write one notification record per eligible contact link, atomically.
    ///
    /// Eligible means the target id is non-empty and not the owner. All
    /// per-target writes commit as a single batch: N records land or zero.
    /// A partial batch is never visible, so a failed dispatch is safe for the
    /// caller to retry wholesale. Returns the number of records written.
    pub async fn dispatch(
        &self,
        session: &AlertSession,
        owner: &OwnerProfile,
        links: &[ContactLink],
    ) -> Result<usize, BeaconError> {
        let source_name = if owner.name.trim().is_empty() {
            "Emergency contact".to_string()
        } else {
            owner.name.trim().to_string()
        };
        let sent_at = Utc::now();

        let mut writes = Vec::new();
        for link in links {
            let target = link.contact_user_id.trim();
            if target.is_empty() || target == session.owner_id {
                continue;
            }

            let record = NotificationRecord {
                session_id: session.id,
                source_user_id: session.owner_id.clone(),
                source_link_id: link.id.clone(),
                source_name: source_name.clone(),
                source_phone: owner.phone.trim().to_string(),
                relation: link.relation.trim().to_string(),
                status: session.status,
                location: session.location,
                assigned_station_id: session.assigned_station_id.clone(),
                is_read: false,
                sent_at,
            };
            let doc = serde_json::to_value(&record)
                .map_err(|e| BeaconError::FanoutFailed(e.to_string()))?;
            writes.push(BatchWrite {
                collection: collections::INBOX.to_string(),
                id: format!("{target}:{}", session.id),
                doc,
            });
        }

        if writes.is_empty() {
            info!(session_id = %session.id, "fan-out skipped, no eligible contacts");
            return Ok(0);
        }

        let count = writes.len();
        let commit = self.store.commit_batch(writes);
        match timeout(self.call_timeout, commit).await {
            Ok(Ok(())) => {
                info!(session_id = %session.id, count, "incoming alerts dispatched");
                Ok(count)
            }
            Ok(Err(err)) => Err(BeaconError::FanoutFailed(err.to_string())),
            Err(_) => Err(BeaconError::FanoutFailed(format!(
                "batch commit timed out after {:?}",
                self.call_timeout
            ))),
        }
    }
}
