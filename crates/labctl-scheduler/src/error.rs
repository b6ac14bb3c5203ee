//! Scheduler errors.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression: {0}")]
    InvalidCronExpression(String),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("One-shot time {0} is in the past")]
    PastOneShot(String),

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl From<SchedulerError> for labctl_core::Error {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::UnknownModule(_) | SchedulerError::JobNotFound(_) => {
                labctl_core::Error::NotFound(e.to_string())
            }
            SchedulerError::DuplicateJob(_) => labctl_core::Error::AlreadyExists(e.to_string()),
            _ => labctl_core::Error::Validation(e.to_string()),
        }
    }
}
