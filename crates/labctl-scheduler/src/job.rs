//! Job records.

use crate::trigger::Trigger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a job: `Scheduled → Due → Firing → (Scheduled | Completed | Cancelled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Due,
    Firing,
    Completed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Due => "due",
            Self::Firing => "firing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn default_enabled() -> bool {
    true
}

/// Request to schedule a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Generated when absent.
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub trigger: Trigger,
    /// Target module; receives the payload on its command topic.
    pub module: String,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl JobSpec {
    pub fn new(module: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            job_id: None,
            name: None,
            trigger,
            module: module.into(),
            payload: empty_object(),
            enabled: true,
        }
    }

    pub fn with_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A job held by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub name: String,
    pub trigger: Trigger,
    pub module: String,
    pub payload: serde_json::Value,
    pub next_run_at: DateTime<Utc>,
    pub enabled: bool,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub last_error: Option<String>,
}

/// Returned by `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed immediately.
    Cancelled,
    /// The job is firing; it is removed once the current run finishes.
    AfterCurrentRun,
}

/// Result of one job firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireReport {
    pub job_id: String,
    pub module: String,
    pub scheduled_for: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    /// State the job moved to after this run.
    pub state: JobState,
    pub next_run_at: Option<DateTime<Utc>>,
}
