use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Tunables for the sync core. `Default` matches what the app ships with.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on every store call made on behalf of a view.
    pub request_timeout: Duration,
    /// First reconnect delay after a subscription drops.
    pub reconnect_base: Duration,
    /// Reconnect delays double up to this cap.
    pub reconnect_max: Duration,
    pub message_limit: u32,
    pub photo_limit: u32,
    /// Per-subscription fan-out buffer. A view that falls this far behind
    /// resynchronizes instead of replaying.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            message_limit: 50,
            photo_limit: 20,
            event_buffer: 256,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `SLOPE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: env_millis("SLOPE_REQUEST_TIMEOUT_MS").unwrap_or(defaults.request_timeout),
            reconnect_base: env_millis("SLOPE_RECONNECT_BASE_MS").unwrap_or(defaults.reconnect_base),
            reconnect_max: env_millis("SLOPE_RECONNECT_MAX_MS").unwrap_or(defaults.reconnect_max),
            message_limit: env_parse("SLOPE_MESSAGE_LIMIT").unwrap_or(defaults.message_limit),
            photo_limit: env_parse("SLOPE_PHOTO_LIMIT").unwrap_or(defaults.photo_limit),
            event_buffer: defaults.event_buffer,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}='{}'", key, raw);
            None
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
