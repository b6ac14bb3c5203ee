//! Shared defaults and environment variable names.
//!
//! Component configs take their defaults from here so the values stay in
//! one place.

/// Default topic root.
pub const DEFAULT_TOPIC_ROOT: &str = "lab";

/// Device presence defaults.
pub mod devices {
    /// Seconds of silence before a device is marked offline.
    pub const DEFAULT_SILENCE_TIMEOUT_SECS: u64 = 300;
    /// Seconds between offline sweeps.
    pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
    /// Longest accepted silence timeout: one year.
    pub const MAX_SILENCE_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;
}

/// Dead letter and dedup retention limits.
pub mod retention {
    /// Longest dead letter retention: ten years.
    pub const MAX_DEAD_LETTER_HOURS: u64 = 10 * 365 * 24;
    /// Longest dedup window: one year.
    pub const MAX_DEDUP_TTL_SECS: u64 = 365 * 24 * 60 * 60;
}

/// Lock manager defaults.
pub mod locks {
    /// Seconds between expiry sweeps.
    pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
}

/// Router defaults.
pub mod router {
    pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 16;
    /// Zero disables the per-handler timeout.
    pub const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 30;
}

/// Scheduler defaults.
pub mod scheduler {
    pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
    pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 10;
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG_PATH: &str = "LABCTL_CONFIG";
    pub const TOPIC_ROOT: &str = "LABCTL_TOPIC_ROOT";
    pub const MQTT_HOST: &str = "LABCTL_MQTT_HOST";
    pub const MQTT_PORT: &str = "LABCTL_MQTT_PORT";
    pub const MQTT_CLIENT_ID: &str = "LABCTL_MQTT_CLIENT_ID";
    pub const MQTT_USERNAME: &str = "LABCTL_MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "LABCTL_MQTT_PASSWORD";
    pub const SILENCE_TIMEOUT_SECS: &str = "LABCTL_SILENCE_TIMEOUT_SECS";
    pub const MAX_CONCURRENT_HANDLERS: &str = "LABCTL_MAX_CONCURRENT_HANDLERS";
    pub const LOG_JSON: &str = "LABCTL_LOG_JSON";
}
