//! Control surface for a web or dashboard layer.
//!
//! Queries never fail; commands return a [`Rejection`] carrying a stable
//! reason code.

use crate::health::{HealthReport, LivenessReport, ReadinessReport};
use crate::service::Orchestrator;
use labctl_core::Error;
use labctl_devices::Device;
use labctl_locks::LockInfo;
use labctl_plugins::{DeadLetter, DeadLetterFilter, DeadLetterStats};
use labctl_scheduler::{CancelOutcome, JobSpec, ScheduledJob, SchedulerError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// A refused command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Rejection {
    /// `NOT_FOUND`, `IN_USE`, `DENIED`, `BAD_REQUEST`, `DUPLICATE_MODULE`,
    /// `MODULE_ERROR`, `ALREADY_EXISTS` or `EXCEPTION`.
    pub code: String,
    pub message: String,
}

impl From<Error> for Rejection {
    fn from(err: Error) -> Self {
        Self {
            code: err.reason_code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<SchedulerError> for Rejection {
    fn from(err: SchedulerError) -> Self {
        Error::from(err).into()
    }
}

pub type ApiResult<T> = std::result::Result<T, Rejection>;

#[derive(Clone)]
pub struct ControlApi {
    orchestrator: Arc<Orchestrator>,
}

impl ControlApi {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    // ========== Devices ==========

    pub async fn list_devices(&self, device_type: Option<&str>) -> Vec<Device> {
        self.orchestrator.devices().list(device_type).await
    }

    pub async fn get_device(&self, device_id: &str) -> ApiResult<Device> {
        Ok(self.orchestrator.devices().get(device_id).await?)
    }

    /// Refused with `IN_USE` while the device is exclusively leased.
    pub async fn remove_device(&self, device_id: &str) -> ApiResult<()> {
        self.orchestrator.devices().remove(device_id).await?;
        info!(category = "devices", device_id, "Device removed via API");
        Ok(())
    }

    // ========== Locks ==========

    pub fn list_locks(&self) -> Vec<LockInfo> {
        self.orchestrator.locks().list()
    }

    pub fn force_release_lock(&self, lock_id: &str) -> ApiResult<()> {
        self.orchestrator.locks().force_release(lock_id)?;
        info!(category = "locks", lock_id, "Lease force-released via API");
        Ok(())
    }

    // ========== Jobs ==========

    pub async fn list_jobs(&self) -> Vec<ScheduledJob> {
        self.orchestrator.scheduler().list().await
    }

    pub async fn create_job(&self, spec: JobSpec) -> ApiResult<ScheduledJob> {
        Ok(self.orchestrator.scheduler().schedule(spec).await?)
    }

    pub async fn cancel_job(&self, job_id: &str) -> ApiResult<CancelOutcome> {
        Ok(self.orchestrator.scheduler().cancel(job_id).await?)
    }

    // ========== Dead letters ==========

    pub fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Vec<DeadLetter> {
        self.orchestrator.dead_letters().list(filter)
    }

    pub fn dead_letter_stats(&self) -> DeadLetterStats {
        self.orchestrator.dead_letters().stats()
    }

    /// Republish a dead letter to its original topic.
    pub async fn retry_dead_letter(&self, id: &str) -> ApiResult<DeadLetter> {
        Ok(self.orchestrator.dead_letters().retry(id).await?)
    }

    // ========== Service ==========

    pub fn list_modules(&self) -> Vec<String> {
        self.orchestrator.registry().names()
    }

    pub async fn health(&self) -> HealthReport {
        self.orchestrator.health().await
    }

    pub async fn readiness(&self) -> ReadinessReport {
        self.orchestrator.readiness().await
    }

    pub fn liveness(&self) -> LivenessReport {
        self.orchestrator.liveness()
    }

    pub async fn metrics_text(&self) -> ApiResult<String> {
        Ok(self.orchestrator.metrics_text().await?)
    }
}

impl Orchestrator {
    pub fn api(self: &Arc<Self>) -> ControlApi {
        ControlApi::new(self.clone())
    }
}
