use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

// --- Geo Types ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Haversine great-circle distance between two points in kilometers.
pub fn haversine_km(from: GeoPoint, to: GeoPoint) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lon = (to.lon - from.lon).to_radians();
    let from_lat = from.lat.to_radians();
    let to_lat = to.lat.to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + from_lat.cos() * to_lat.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

// --- Enums ---

/// Where the trigger signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Ui,
    VolumeComboForeground,
    VolumeComboAccessibility,
    Unknown,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Ui => write!(f, "ui"),
            TriggerSource::VolumeComboForeground => write!(f, "volume_combo_foreground"),
            TriggerSource::VolumeComboAccessibility => write!(f, "volume_combo_accessibility"),
            TriggerSource::Unknown => write!(f, "unknown"),
        }
    }
}

/// Lifecycle state of one alert session. Terminal states never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Recording,
    Finished,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Finished | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// Mirror of the evidence-capture activity's lifecycle as seen by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    /// Capture activity was launched; no event received yet.
    Launched,
    Recording,
    Finished,
    Failed,
}

// --- Alert Session ---

/// One emergency-alert lifecycle, trigger to terminal status.
/// `created_at`/`updated_at` are assigned by the store, never the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSession {
    pub id: Uuid,
    pub owner_id: String,
    pub trigger_source: TriggerSource,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_station_id: Option<String>,
    pub recording_status: RecordingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_media_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location_update_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AlertSession {
    /// A freshly triggered session, before the store has stamped it.
    pub fn open(id: Uuid, owner_id: impl Into<String>, trigger_source: TriggerSource) -> Self {
        Self {
            id,
            owner_id: owner_id.into(),
            trigger_source,
            status: SessionStatus::Active,
            location: None,
            assigned_station_id: None,
            recording_status: RecordingStatus::Launched,
            recording_failure_reason: None,
            local_media_path: None,
            cancelled_at: None,
            last_location_update_at: None,
            created_at: None,
            updated_at: None,
        }
    }
}

/// Shallow partial update of an [`AlertSession`]. Absent fields are untouched
/// by the merge, so concurrent writers owning disjoint subsets never erase
/// each other.
#[derive(Debug, Clone, Default, Serialize, TypedBuilder)]
pub struct SessionPatch {
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_station_id: Option<String>,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_status: Option<RecordingStatus>,
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_failure_reason: Option<String>,
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_media_path: Option<String>,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location_update_at: Option<DateTime<Utc>>,
}

impl SessionPatch {
    /// Field names that may still be merged after the session went terminal.
    pub const APPEND_ONLY_FIELDS: [&'static str; 2] =
        ["recording_failure_reason", "local_media_path"];
}

// --- Registry Entities (read-only to the core) ---

/// Responder station, produced by the external registration workflow.
/// Immutable once approved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationRecord {
    /// Document id; filled from the registry key when read.
    #[serde(default)]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    /// Positive when configured. Absent means the station is always eligible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jurisdiction_radius_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_channel: Option<String>,
}

/// Output of nearest-station matching.
#[derive(Debug, Clone, PartialEq)]
pub struct StationMatch {
    pub station_id: String,
    pub contact_channel: Option<String>,
    pub distance_km: f64,
}

/// Directed edge owner -> contact, used only for fan-out target resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactLink {
    /// Document id; filled from the registry key when read.
    #[serde(default)]
    pub id: String,
    pub owner_id: String,
    pub contact_user_id: String,
    #[serde(default)]
    pub relation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// The triggering principal's profile, read as of dispatch time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnerProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
}

/// One inbox entry written by fan-out for a single contact target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub session_id: Uuid,
    pub source_user_id: String,
    pub source_link_id: String,
    pub source_name: String,
    pub source_phone: String,
    pub relation: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_station_id: Option<String>,
    pub is_read: bool,
    pub sent_at: DateTime<Utc>,
}
