//! Channel configuration.

use std::time::Duration;

use serde::Deserialize;
use tasklink_core::Identity;

/// Client-side channel settings.
///
/// Durations are stored in milliseconds so the struct deserializes from
/// flat JSON/TOML; use the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Base URL of the channel server, e.g. `ws://127.0.0.1:8000`.
    pub url: String,
    /// Path template appended to `url`; `{identity}` is substituted.
    pub channel_path: String,
    pub connect_timeout_ms: u64,
    /// Minimum spacing between physical connect attempts.
    pub min_connect_interval_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Automatic reconnects after a failure or drop. Zero disables them.
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub stale_check_interval_ms: u64,
    /// Silence longer than this closes the connection as half-open.
    pub stale_threshold_ms: u64,
    /// Close the channel when no task is active for `idle_timeout_ms`.
    pub smart_mode: bool,
    pub idle_timeout_ms: u64,
    /// Grace period before a shared session with no leases is destroyed.
    pub shared_grace_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000".to_string(),
            channel_path: "/ws/{identity}".to_string(),
            connect_timeout_ms: 10_000,
            min_connect_interval_ms: 2_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 30_000,
            stale_check_interval_ms: 10_000,
            stale_threshold_ms: 75_000,
            smart_mode: false,
            idle_timeout_ms: 300_000,
            shared_grace_ms: 1_000,
        }
    }
}

impl ChannelConfig {
    /// Load settings from `TASKLINK_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("TASKLINK_URL").unwrap_or(defaults.url),
            channel_path: std::env::var("TASKLINK_CHANNEL_PATH").unwrap_or(defaults.channel_path),
            connect_timeout_ms: env_or("TASKLINK_CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms),
            min_connect_interval_ms: env_or(
                "TASKLINK_MIN_CONNECT_INTERVAL_MS",
                defaults.min_connect_interval_ms,
            ),
            reconnect_base_delay_ms: env_or(
                "TASKLINK_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay_ms,
            ),
            reconnect_max_delay_ms: env_or(
                "TASKLINK_RECONNECT_MAX_DELAY_MS",
                defaults.reconnect_max_delay_ms,
            ),
            max_reconnect_attempts: env_or(
                "TASKLINK_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            heartbeat_interval_ms: env_or(
                "TASKLINK_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            ),
            stale_check_interval_ms: env_or(
                "TASKLINK_STALE_CHECK_INTERVAL_MS",
                defaults.stale_check_interval_ms,
            ),
            stale_threshold_ms: env_or("TASKLINK_STALE_THRESHOLD_MS", defaults.stale_threshold_ms),
            smart_mode: env_or("TASKLINK_SMART_MODE", defaults.smart_mode),
            idle_timeout_ms: env_or("TASKLINK_IDLE_TIMEOUT_MS", defaults.idle_timeout_ms),
            shared_grace_ms: env_or("TASKLINK_SHARED_GRACE_MS", defaults.shared_grace_ms),
        }
    }

    /// Full channel URL for an identity.
    #[must_use]
    pub fn channel_url(&self, identity: &Identity) -> String {
        format!(
            "{}{}",
            self.url.trim_end_matches('/'),
            self.channel_path.replace("{identity}", identity.as_str())
        )
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn min_connect_interval(&self) -> Duration {
        Duration::from_millis(self.min_connect_interval_ms)
    }

    #[must_use]
    pub const fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    #[must_use]
    pub const fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn stale_check_interval(&self) -> Duration {
        Duration::from_millis(self.stale_check_interval_ms)
    }

    #[must_use]
    pub const fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    /// Idle timeout, when smart mode is on.
    #[must_use]
    pub const fn idle_timeout(&self) -> Option<Duration> {
        if self.smart_mode {
            Some(Duration::from_millis(self.idle_timeout_ms))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn shared_grace(&self) -> Duration {
        Duration::from_millis(self.shared_grace_ms)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
