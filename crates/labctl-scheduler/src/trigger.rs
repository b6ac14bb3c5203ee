//! Job triggers and next-run arithmetic.

use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted interval: ten years.
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire once at `at`.
    Once { at: DateTime<Utc> },
    /// Fire every `every_secs` seconds, first run one period after scheduling.
    Interval { every_secs: u64 },
    /// Cron recurrence, evaluated in UTC.
    Cron { expr: String },
}

impl Trigger {
    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once { at }
    }

    pub fn interval(every: Duration) -> Self {
        Self::Interval {
            every_secs: every.as_secs(),
        }
    }

    /// Build a cron trigger, rejecting malformed expressions up front.
    pub fn cron(expr: impl Into<String>) -> Result<Self> {
        let expr = expr.into();
        parse_cron(&expr)?;
        Ok(Self::Cron { expr })
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Once { .. } => "once",
            Self::Interval { .. } => "interval",
            Self::Cron { .. } => "cron",
        }
    }

    /// Parse and check the trigger. Returns the compiled cron schedule if any.
    pub fn compile(&self) -> Result<Option<Schedule>> {
        match self {
            Self::Once { .. } => Ok(None),
            Self::Interval { every_secs: 0 } => Err(SchedulerError::InvalidTrigger(
                "interval must be at least one second".to_string(),
            )),
            Self::Interval { every_secs } if *every_secs > MAX_INTERVAL_SECS => {
                Err(SchedulerError::InvalidTrigger(format!(
                    "interval of {every_secs}s exceeds the maximum of {MAX_INTERVAL_SECS}s"
                )))
            }
            Self::Interval { .. } => Ok(None),
            Self::Cron { expr } => parse_cron(expr).map(Some),
        }
    }

    /// First run time for a job scheduled at `now`.
    pub fn first_run(&self, schedule: Option<&Schedule>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Self::Once { at } => {
                if *at < now {
                    return Err(SchedulerError::PastOneShot(at.to_rfc3339()));
                }
                Ok(*at)
            }
            Self::Interval { every_secs } => secs(*every_secs)
                .and_then(|every| now.checked_add_signed(every))
                .ok_or_else(|| SchedulerError::InvalidTrigger(format!("interval of {every_secs}s is out of range"))),
            Self::Cron { expr } => schedule
                .and_then(|s| s.after(&now).next())
                .ok_or_else(|| SchedulerError::InvalidCronExpression(format!("{expr}: no upcoming run"))),
        }
    }

    /// Next run after a fire that was scheduled for `scheduled` and completed at `now`.
    ///
    /// Intervals advance from the scheduled time, not the completion time, and
    /// skip any ticks already missed. `None` means the job is finished, or
    /// that the next run would fall outside the representable time range.
    pub fn next_after_fire(
        &self,
        schedule: Option<&Schedule>,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Self::Once { .. } => None,
            Self::Interval { every_secs } => {
                let every = secs((*every_secs).max(1))?;
                let mut next = scheduled.checked_add_signed(every)?;
                if next <= now {
                    let behind = (now - next).num_milliseconds() / every.num_milliseconds() + 1;
                    next = match i32::try_from(behind).ok().and_then(|n| every.checked_mul(n)) {
                        Some(skip) => next.checked_add_signed(skip)?,
                        // Too far behind to stay on the grid.
                        None => now.checked_add_signed(every)?,
                    };
                }
                Some(next)
            }
            Self::Cron { .. } => schedule.and_then(|s| s.after(&now).next()),
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Once { at } => write!(f, "once at {}", at.to_rfc3339()),
            Self::Interval { every_secs } => write!(f, "every {every_secs}s"),
            Self::Cron { expr } => write!(f, "cron '{expr}'"),
        }
    }
}

/// Parse a cron expression.
///
/// Standard 5-field expressions (minute hour day month weekday) get a
/// leading seconds field of `0`; 6 and 7 field expressions are passed through.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expr.trim()),
        6 | 7 => expr.trim().to_string(),
        _ => {
            return Err(SchedulerError::InvalidCronExpression(format!(
                "{expr}: expected 5, 6 or 7 fields, got {fields}"
            )))
        }
    };
    Schedule::from_str(&normalized)
        .map_err(|e| SchedulerError::InvalidCronExpression(format!("{expr}: {e}")))
}

fn secs(n: u64) -> Option<ChronoDuration> {
    i64::try_from(n).ok().and_then(ChronoDuration::try_seconds)
}
