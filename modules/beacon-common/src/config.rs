use std::env;
use std::time::Duration;

/// Timing and channel configuration for the SOS pipeline.
///
/// Defaults match the shipped constants; every value can be overridden from
/// the environment for testing and staged rollouts.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Window after a trigger during which the same input pattern cannot
    /// open a new session.
    pub trigger_cooldown: Duration,
    /// Bound on the fresh high-accuracy location fix.
    pub fresh_fix_timeout: Duration,
    /// Bound on the last-known-fix fallback.
    pub last_known_fix_timeout: Duration,
    /// Bound on every durable-store call.
    pub store_call_timeout: Duration,
    /// Evidence capture is force-stopped after this long.
    pub max_capture_duration: Duration,
    /// Grace delay after a capture-terminal event before the session
    /// context tears itself down, so trailing writes can land.
    pub session_linger: Duration,
    /// Cadence of the live-location merge stream.
    pub live_location_interval: Duration,
    /// Bound on each degraded-channel send.
    pub sms_send_timeout: Duration,
    /// Recipient of last resort when no station or contact number exists.
    pub default_emergency_number: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            trigger_cooldown: Duration::from_secs(15),
            fresh_fix_timeout: Duration::from_secs(8),
            last_known_fix_timeout: Duration::from_secs(3),
            store_call_timeout: Duration::from_secs(20),
            max_capture_duration: Duration::from_secs(45),
            session_linger: Duration::from_secs(20),
            live_location_interval: Duration::from_secs(10),
            sms_send_timeout: Duration::from_secs(10),
            default_emergency_number: "112".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration, applying environment overrides on top of defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            trigger_cooldown: env_secs("BEACON_TRIGGER_COOLDOWN_SECS", defaults.trigger_cooldown),
            fresh_fix_timeout: env_secs("BEACON_FRESH_FIX_TIMEOUT_SECS", defaults.fresh_fix_timeout),
            last_known_fix_timeout: env_secs(
                "BEACON_LAST_KNOWN_FIX_TIMEOUT_SECS",
                defaults.last_known_fix_timeout,
            ),
            store_call_timeout: env_secs("BEACON_STORE_TIMEOUT_SECS", defaults.store_call_timeout),
            max_capture_duration: env_secs(
                "BEACON_MAX_CAPTURE_SECS",
                defaults.max_capture_duration,
            ),
            session_linger: env_secs("BEACON_SESSION_LINGER_SECS", defaults.session_linger),
            live_location_interval: env_secs(
                "BEACON_LIVE_LOCATION_INTERVAL_SECS",
                defaults.live_location_interval,
            ),
            sms_send_timeout: env_secs("BEACON_SMS_TIMEOUT_SECS", defaults.sms_send_timeout),
            default_emergency_number: env::var("BEACON_DEFAULT_EMERGENCY_NUMBER")
                .unwrap_or(defaults.default_emergency_number),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
