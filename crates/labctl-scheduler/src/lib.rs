//! Timed invocation of labctl modules.
//!
//! Jobs fire a module's handler directly with a stored payload, on a
//! one-shot time, a fixed interval or a cron recurrence (UTC).

pub mod error;
pub mod job;
pub mod scheduler;
pub mod trigger;

pub use error::{Result, SchedulerError};
pub use job::{CancelOutcome, FireReport, JobSpec, JobState, ScheduledJob};
pub use scheduler::TaskScheduler;
pub use trigger::{parse_cron, Trigger, MAX_INTERVAL_SECS};

use labctl_core::config::scheduler::{DEFAULT_MAX_CONCURRENT_JOBS, DEFAULT_TICK_INTERVAL_MS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick interval for checking due jobs (milliseconds)
    pub tick_interval_ms: u64,
    /// Maximum concurrent firings
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_concurrent: DEFAULT_MAX_CONCURRENT_JOBS,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
