//! Health, readiness and liveness reports.

use chrono::{DateTime, Utc};
use labctl_devices::DeviceStats;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl CheckResult {
    fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status across all checks.
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: BTreeMap<String, CheckResult>,
    pub uptime_seconds: u64,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub details: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessReport {
    pub alive: bool,
    pub uptime_seconds: u64,
}

/// Everything the checks look at, gathered by the service.
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    pub bus_name: String,
    pub bus_connected: bool,
    pub devices: DeviceStats,
    pub plugins: Vec<String>,
    pub started: bool,
    pub scheduler_running: bool,
    pub scheduled_jobs: usize,
    pub uptime_seconds: u64,
}

fn check_bus(inputs: &HealthInputs) -> CheckResult {
    let check = if inputs.bus_connected {
        CheckResult::new(HealthStatus::Healthy, format!("{} connected", inputs.bus_name))
    } else {
        CheckResult::new(HealthStatus::Unhealthy, format!("{} not connected", inputs.bus_name))
    };
    check.with_details(json!({ "connected": inputs.bus_connected }))
}

fn check_devices(stats: &DeviceStats) -> CheckResult {
    let details = json!({ "total": stats.total, "online": stats.online, "offline": stats.offline });
    if stats.total == 0 {
        return CheckResult::new(HealthStatus::Healthy, "No devices registered").with_details(details);
    }
    // At least half online.
    let check = if stats.online * 2 >= stats.total {
        CheckResult::new(
            HealthStatus::Healthy,
            format!("{}/{} devices online", stats.online, stats.total),
        )
    } else {
        CheckResult::new(
            HealthStatus::Degraded,
            format!("Only {}/{} devices online", stats.online, stats.total),
        )
    };
    check.with_details(details)
}

fn check_plugins(plugins: &[String]) -> CheckResult {
    CheckResult::new(HealthStatus::Healthy, format!("{} modules registered", plugins.len()))
        .with_details(json!({ "modules": plugins }))
}

fn check_scheduler(inputs: &HealthInputs) -> CheckResult {
    let details = json!({ "running": inputs.scheduler_running, "jobs": inputs.scheduled_jobs });
    let check = if inputs.scheduler_running || !inputs.started {
        CheckResult::new(HealthStatus::Healthy, format!("{} jobs scheduled", inputs.scheduled_jobs))
    } else {
        CheckResult::new(HealthStatus::Degraded, "Scheduler loop is not running")
    };
    check.with_details(details)
}

pub fn assess(inputs: &HealthInputs) -> HealthReport {
    let mut checks = BTreeMap::new();
    checks.insert("bus".to_string(), check_bus(inputs));
    checks.insert("devices".to_string(), check_devices(&inputs.devices));
    checks.insert("plugins".to_string(), check_plugins(&inputs.plugins));
    checks.insert("scheduler".to_string(), check_scheduler(inputs));

    let status = checks
        .values()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);

    HealthReport {
        status,
        timestamp: Utc::now(),
        checks,
        uptime_seconds: inputs.uptime_seconds,
        version: crate::VERSION.to_string(),
    }
}

pub fn readiness(inputs: &HealthInputs) -> ReadinessReport {
    let details: BTreeMap<String, bool> = [
        ("bus".to_string(), inputs.bus_connected),
        ("started".to_string(), inputs.started),
        ("plugins".to_string(), !inputs.plugins.is_empty()),
    ]
    .into_iter()
    .collect();
    ReadinessReport {
        ready: details.values().all(|ok| *ok),
        details,
    }
}

pub fn liveness(uptime_seconds: u64) -> LivenessReport {
    LivenessReport {
        alive: true,
        uptime_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> HealthInputs {
        HealthInputs {
            bus_name: "memory".to_string(),
            bus_connected: true,
            devices: DeviceStats::default(),
            plugins: vec!["device_tracker".to_string()],
            started: true,
            scheduler_running: true,
            scheduled_jobs: 0,
            uptime_seconds: 12,
        }
    }

    #[test]
    fn test_healthy_with_no_devices() {
        let report = assess(&inputs());
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 4);
        assert_eq!(report.uptime_seconds, 12);
        assert!(readiness(&inputs()).ready);
    }

    #[test]
    fn test_device_threshold() {
        let mut inputs = inputs();
        inputs.devices = DeviceStats {
            total: 4,
            online: 2,
            offline: 2,
            ..DeviceStats::default()
        };
        assert_eq!(assess(&inputs).status, HealthStatus::Healthy);

        inputs.devices.online = 1;
        inputs.devices.offline = 3;
        let report = assess(&inputs);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.checks["devices"].status, HealthStatus::Degraded);
    }

    #[test]
    fn test_disconnected_bus_is_unhealthy_and_not_ready() {
        let mut inputs = inputs();
        inputs.bus_connected = false;
        inputs.devices = DeviceStats {
            total: 2,
            offline: 2,
            ..DeviceStats::default()
        };
        assert_eq!(assess(&inputs).status, HealthStatus::Unhealthy);

        let ready = readiness(&inputs);
        assert!(!ready.ready);
        assert!(!ready.details["bus"]);
        assert!(liveness(1).alive);
    }

    #[test]
    fn test_stopped_scheduler_degrades_after_start() {
        let mut inputs = inputs();
        inputs.scheduler_running = false;
        assert_eq!(assess(&inputs).status, HealthStatus::Degraded);

        inputs.started = false;
        assert_eq!(assess(&inputs).checks["scheduler"].status, HealthStatus::Healthy);
    }
}
