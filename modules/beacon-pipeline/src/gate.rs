//! Trigger deduplication. Collapses concurrent/repeated trigger signals into
//! a single active session per principal.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use beacon_common::{BeaconError, TriggerSource};

/// Outcome of a trigger submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A new session was opened.
    New(Uuid),
    /// A session was already in flight for this principal; same id returned.
    Reentry(Uuid),
}

impl Submission {
    pub fn session_id(&self) -> Uuid {
        match self {
            Submission::New(id) | Submission::Reentry(id) => *id,
        }
    }
}

#[derive(Default)]
struct GateState {
    /// principal -> active session id.
    in_flight: HashMap<String, Uuid>,
    /// (principal, source) -> last accepted fire.
    last_fire: HashMap<(String, TriggerSource), DateTime<Utc>>,
}

/// Lifecycle-scoped in-flight registry. One gate per pipeline instance, so
/// multiple concurrent principals stay independent and testable.
pub struct TriggerGate {
    cooldown: Duration,
    state: Mutex<GateState>,
}

impl TriggerGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Submit a trigger signal.
    ///
    /// Re-entry into an in-flight session always wins, even inside the
    /// cooldown window — a second combo press while evidence capture runs is
    /// legitimate. Without an in-flight session, a repeat fire of the same
    /// input pattern within the cooldown is an accidental double-fire and is
    /// rejected.
    pub fn submit(
        &self,
        principal: Option<&str>,
        source: TriggerSource,
        now: DateTime<Utc>,
    ) -> Result<Submission, BeaconError> {
        let principal = match principal {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => return Err(BeaconError::Unauthenticated),
        };

        let mut state = self.state.lock().expect("gate state poisoned");

        if let Some(&active) = state.in_flight.get(&principal) {
            state.last_fire.insert((principal.clone(), source), now);
            info!(session_id = %active, %source, "trigger attached to in-flight session");
            return Ok(Submission::Reentry(active));
        }

        let key = (principal.clone(), source);
        if let Some(&last) = state.last_fire.get(&key) {
            let elapsed = now.signed_duration_since(last);
            if elapsed >= chrono::Duration::zero()
                && elapsed.to_std().unwrap_or_default() < self.cooldown
            {
                info!(%source, "trigger ignored during cooldown");
                return Err(BeaconError::CooldownActive(source));
            }
        }

        let id = Uuid::new_v4();
        state.in_flight.insert(principal.clone(), id);
        state.last_fire.insert(key, now);
        info!(session_id = %id, %source, "trigger accepted, new session opened");
        Ok(Submission::New(id))
    }

    /// Clear the in-flight flag for a principal. Idempotent.
    pub fn complete(&self, principal: &str) {
        let mut state = self.state.lock().expect("gate state poisoned");
        state.in_flight.remove(principal);
    }

    /// Roll back a submission that never became a session. Clears both the
    /// in-flight flag and the cooldown stamp, so an immediate same-source
    /// retry is accepted.
    pub fn rescind(&self, principal: &str, source: TriggerSource) {
        let mut state = self.state.lock().expect("gate state poisoned");
        state.in_flight.remove(principal);
        state.last_fire.remove(&(principal.to_string(), source));
    }
}
