use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::types::TriggerSource;

#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("Authentication required: trigger has no owner identity")]
    Unauthenticated,

    #[error("Trigger ignored: cooldown active for source {0}")]
    CooldownActive(TriggerSource),

    #[error("Alert session {0} already exists")]
    AlreadyExists(Uuid),

    #[error("Store write failed: {0}")]
    StoreWrite(String),

    #[error("Store call timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Session {0} is terminal; mutation rejected")]
    SessionTerminal(Uuid),

    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Fan-out batch failed: {0}")]
    FanoutFailed(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
