//! Offline fallback: when the primary channel has no network at decision
//! time, push a degraded-channel text to the matched station, the default
//! emergency number, and the owner's contacts.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::timeout;
use tracing::{info, warn};

use beacon_common::GeoPoint;

use crate::traits::{ConnectivityProbe, SmsSender};

static PHONE_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s-]+").expect("static regex"));

/// Strip whitespace and hyphens. `None` when nothing is left.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let normalized = PHONE_SEPARATORS.replace_all(raw.trim(), "").to_string();
    (!normalized.is_empty()).then_some(normalized)
}

/// What the escalator did for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// Primary channel available; no fallback needed.
    Online,
    /// Device lacks the degraded-channel capability. Not a failure.
    NoCapability,
    /// Number of independent sends attempted.
    Attempted(usize),
}

pub struct FallbackEscalator {
    connectivity: Arc<dyn ConnectivityProbe>,
    sms: Arc<dyn SmsSender>,
    default_emergency_number: String,
    send_timeout: Duration,
}

impl FallbackEscalator {
    pub fn new(
        connectivity: Arc<dyn ConnectivityProbe>,
        sms: Arc<dyn SmsSender>,
        default_emergency_number: impl Into<String>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            connectivity,
            sms,
            default_emergency_number: default_emergency_number.into(),
            send_timeout,
        }
    }

    /// One point-in-time connectivity check, then best-effort sends.
    ///
    /// Recipients in priority order: station contact channel, the default
    /// emergency number when no station contact exists, then every linked
    /// contact number. Numbers are normalized and deduplicated before send.
    /// Each send is independent; failures are logged, never retried, and
    /// never escalate further.
    pub async fn escalate_if_offline(
        &self,
        owner_name: &str,
        location: Option<GeoPoint>,
        station_contact: Option<&str>,
        contact_numbers: &[String],
    ) -> EscalationOutcome {
        if self.connectivity.is_online().await {
            return EscalationOutcome::Online;
        }
        if !self.sms.is_available() {
            warn!("degraded channel unavailable on this device; skipping fallback");
            return EscalationOutcome::NoCapability;
        }

        let recipients = self.recipient_set(station_contact, contact_numbers);
        let message = build_alert_text(owner_name, location);

        let mut attempts = 0usize;
        for recipient in &recipients {
            attempts += 1;
            match timeout(self.send_timeout, self.sms.send(recipient, &message)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(%recipient, error = %err, "fallback send failed");
                }
                Err(_) => {
                    warn!(%recipient, "fallback send timed out");
                }
            }
        }
        info!(attempts, "fallback escalation complete");
        EscalationOutcome::Attempted(attempts)
    }

    fn recipient_set(&self, station_contact: Option<&str>, contact_numbers: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut recipients = Vec::new();
        let push = |number: String, seen: &mut HashSet<String>, out: &mut Vec<String>| {
            if seen.insert(number.clone()) {
                out.push(number);
            }
        };

        if let Some(station) = station_contact.and_then(normalize_phone) {
            push(station, &mut seen, &mut recipients);
        }
        if recipients.is_empty() {
            push(
                self.default_emergency_number.clone(),
                &mut seen,
                &mut recipients,
            );
        }
        for number in contact_numbers {
            if let Some(normalized) = normalize_phone(number) {
                push(normalized, &mut seen, &mut recipients);
            }
        }
        recipients
    }
}

fn build_alert_text(owner_name: &str, location: Option<GeoPoint>) -> String {
    let name = if owner_name.trim().is_empty() {
        "Beacon user"
    } else {
        owner_name.trim()
    };
    let (lat_text, lon_text) = match location {
        Some(point) => (format!("{:.6}", point.lat), format!("{:.6}", point.lon)),
        None => ("unknown".to_string(), "unknown".to_string()),
    };
    let map_link = match location {
        Some(_) => format!("https://maps.google.com/?q={lat_text},{lon_text}"),
        None => "unavailable".to_string(),
    };
    format!("SOS ALERT from {name}. Lat:{lat_text} Lon:{lon_text} Map:{map_link}")
}
