//! SOS alert orchestration: trigger dedup, bounded evidence/location
//! acquisition, nearest-station matching, transactional fan-out, and
//! offline fallback escalation.

pub mod acquisition;
pub mod fallback;
pub mod fanout;
pub mod gate;
pub mod geo;
pub mod pipeline;
pub mod store;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use beacon_common::BeaconError;

pub use acquisition::{AcquisitionCoordinator, LiveLocationHandle};
pub use fallback::{normalize_phone, EscalationOutcome, FallbackEscalator};
pub use fanout::NotificationFanout;
pub use gate::{Submission, TriggerGate};
pub use geo::nearest_station;
pub use pipeline::{SosPipeline, TriggerOutcome};
pub use store::{AlertStore, ContactDirectory, StationRegistry};
pub use traits::{
    AccuracyTier, BatchWrite, CaptureActivity, CaptureEvent, ConnectivityProbe, DocumentStore,
    LocationProvider, SmsSender, StoreError,
};
