//! Runtime tunables for the synchronization client

use std::env;
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3001/ws";

pub const TAP_BATCH_INTERVAL: Duration = Duration::from_millis(50);
pub const MAX_TAP_BATCH_COUNT: u32 = 50;

pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

pub const ACTION_QUEUE_CAPACITY: usize = 100;
pub const INITIAL_CLIENT_SEQ: u64 = 1;

// Upper bound on the round trip credited with passive production during a rollback.
pub const ROLLBACK_ACCRUAL_CAP: Duration = Duration::from_secs(10);
// Relative drift between live and expected essence tolerated before a rollback is skipped.
pub const ROLLBACK_DIVERGENCE_RATIO: f64 = 0.01;
pub const ROLLBACK_DIVERGENCE_FLOOR: f64 = 1.0;

pub const SNAPSHOT_PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub server_url: String,
    pub auth_token: String,

    pub tap_batch_interval: Duration,
    pub max_tap_batch_count: u32,

    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,

    pub action_queue_capacity: usize,
    pub initial_client_seq: u64,

    pub rollback_accrual_cap: Duration,
    pub rollback_divergence_ratio: f64,
    pub rollback_divergence_floor: f64,
    /// Advance essence locally at `productionPerSecond` between server updates
    pub project_passive: bool,

    pub snapshot_publish_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            auth_token: String::new(),
            tap_batch_interval: TAP_BATCH_INTERVAL,
            max_tap_batch_count: MAX_TAP_BATCH_COUNT,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            reconnect_max_delay: RECONNECT_MAX_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            action_queue_capacity: ACTION_QUEUE_CAPACITY,
            initial_client_seq: INITIAL_CLIENT_SEQ,
            rollback_accrual_cap: ROLLBACK_ACCRUAL_CAP,
            rollback_divergence_ratio: ROLLBACK_DIVERGENCE_RATIO,
            rollback_divergence_floor: ROLLBACK_DIVERGENCE_FLOOR,
            project_passive: true,
            snapshot_publish_interval: SNAPSHOT_PUBLISH_INTERVAL,
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with any `CLICKER_*` environment variables that parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: env::var("CLICKER_SERVER_URL").unwrap_or(defaults.server_url),
            auth_token: env::var("CLICKER_AUTH_TOKEN").unwrap_or(defaults.auth_token),
            tap_batch_interval: env_millis("CLICKER_TAP_BATCH_INTERVAL_MS")
                .unwrap_or(defaults.tap_batch_interval),
            max_tap_batch_count: env_parse("CLICKER_MAX_TAP_BATCH")
                .unwrap_or(defaults.max_tap_batch_count),
            reconnect_base_delay: env_millis("CLICKER_RECONNECT_BASE_MS")
                .unwrap_or(defaults.reconnect_base_delay),
            reconnect_max_delay: env_millis("CLICKER_RECONNECT_MAX_MS")
                .unwrap_or(defaults.reconnect_max_delay),
            max_reconnect_attempts: env_parse("CLICKER_MAX_RECONNECT_ATTEMPTS")
                .unwrap_or(defaults.max_reconnect_attempts),
            action_queue_capacity: env_parse("CLICKER_ACTION_QUEUE_CAPACITY")
                .unwrap_or(defaults.action_queue_capacity),
            project_passive: env_parse("CLICKER_PROJECT_PASSIVE")
                .unwrap_or(defaults.project_passive),
            ..defaults
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
