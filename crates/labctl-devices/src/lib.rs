//! Device registry for labctl.
//!
//! | Type | Role |
//! |------|------|
//! | [`Device`] | One known device and its last observed state |
//! | [`StatusDelta`] | Partial update merged by [`DeviceRegistry::upsert`] |
//! | [`DeviceRegistry`] | The map, its offline sweep and lock-aware removal |
//! | [`HeartbeatConfig`] | Silence timeout and sweep period |

pub mod device;
pub mod registry;

pub use device::{Device, DeviceStatus, ScalarValue, StatusDelta};
pub use registry::{DeviceRegistry, DeviceStats};

use labctl_core::config::devices::{DEFAULT_SILENCE_TIMEOUT_SECS, DEFAULT_SWEEP_INTERVAL_SECS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Presence tracking configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Seconds without a message before a device is marked offline (default: 300).
    pub silence_timeout_secs: u64,
    /// Seconds between offline sweeps (default: 30).
    pub sweep_interval_secs: u64,
    /// Whether the background sweep runs at all.
    pub auto_mark_offline: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            silence_timeout_secs: DEFAULT_SILENCE_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            auto_mark_offline: true,
        }
    }
}

impl HeartbeatConfig {
    pub fn new(silence_timeout_secs: u64, sweep_interval_secs: u64) -> Self {
        Self {
            silence_timeout_secs,
            sweep_interval_secs,
            auto_mark_offline: true,
        }
    }

    pub fn sweep_duration(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
