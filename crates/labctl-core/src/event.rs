//! Domain events for the lab coordination service.
//!
//! Every state change made by the registry, the lock manager, the router or
//! the scheduler is announced on the [`EventBus`](crate::eventbus::EventBus)
//! as one of these events. Timestamps are unix seconds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified event type for labctl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LabEvent {
    // ========== Device Events ==========
    /// First message seen from a device
    DeviceAdded {
        device_id: String,
        device_type: String,
        timestamp: i64,
    },

    /// Known device changed state
    DeviceUpdated {
        device_id: String,
        status: String,
        timestamp: i64,
    },

    /// Device went silent past its timeout
    DeviceOffline {
        device_id: String,
        reason: Option<String>,
        timestamp: i64,
    },

    /// Device removed by an explicit request
    DeviceRemoved { device_id: String, timestamp: i64 },

    // ========== Lock Events ==========
    LockAcquired {
        lock_id: String,
        resource_id: String,
        kind: String,
        holder: String,
        timestamp: i64,
    },

    LockReleased {
        lock_id: String,
        resource_id: String,
        holder: String,
        forced: bool,
        timestamp: i64,
    },

    /// Lease TTL elapsed without renewal
    LockExpired {
        lock_id: String,
        resource_id: String,
        holder: String,
        timestamp: i64,
    },

    // ========== Dispatch Events ==========
    /// A module handler returned an error, panicked or timed out
    HandlerFault {
        module: String,
        topic: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        timestamp: i64,
    },

    /// A faulted message was parked in the dead letter queue
    MessageDeadLettered {
        dead_letter_id: String,
        topic: String,
        reason: String,
        timestamp: i64,
    },

    // ========== Scheduler Events ==========
    JobScheduled {
        job_id: String,
        module: String,
        next_run_at: i64,
        timestamp: i64,
    },

    JobFired {
        job_id: String,
        module: String,
        success: bool,
        timestamp: i64,
    },

    /// One-shot job ran and left the schedule
    JobCompleted { job_id: String, timestamp: i64 },

    JobCancelled { job_id: String, timestamp: i64 },
}

impl LabEvent {
    /// Get the event type name for filtering.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::DeviceAdded { .. } => "DeviceAdded",
            Self::DeviceUpdated { .. } => "DeviceUpdated",
            Self::DeviceOffline { .. } => "DeviceOffline",
            Self::DeviceRemoved { .. } => "DeviceRemoved",
            Self::LockAcquired { .. } => "LockAcquired",
            Self::LockReleased { .. } => "LockReleased",
            Self::LockExpired { .. } => "LockExpired",
            Self::HandlerFault { .. } => "HandlerFault",
            Self::MessageDeadLettered { .. } => "MessageDeadLettered",
            Self::JobScheduled { .. } => "JobScheduled",
            Self::JobFired { .. } => "JobFired",
            Self::JobCompleted { .. } => "JobCompleted",
            Self::JobCancelled { .. } => "JobCancelled",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::DeviceAdded { timestamp, .. }
            | Self::DeviceUpdated { timestamp, .. }
            | Self::DeviceOffline { timestamp, .. }
            | Self::DeviceRemoved { timestamp, .. }
            | Self::LockAcquired { timestamp, .. }
            | Self::LockReleased { timestamp, .. }
            | Self::LockExpired { timestamp, .. }
            | Self::HandlerFault { timestamp, .. }
            | Self::MessageDeadLettered { timestamp, .. }
            | Self::JobScheduled { timestamp, .. }
            | Self::JobFired { timestamp, .. }
            | Self::JobCompleted { timestamp, .. }
            | Self::JobCancelled { timestamp, .. } => *timestamp,
        }
    }

    /// Check if this is a device event.
    pub fn is_device_event(&self) -> bool {
        matches!(
            self,
            Self::DeviceAdded { .. }
                | Self::DeviceUpdated { .. }
                | Self::DeviceOffline { .. }
                | Self::DeviceRemoved { .. }
        )
    }

    /// Check if this is a lock event.
    pub fn is_lock_event(&self) -> bool {
        matches!(
            self,
            Self::LockAcquired { .. } | Self::LockReleased { .. } | Self::LockExpired { .. }
        )
    }

    /// Check if this is a scheduler event.
    pub fn is_job_event(&self) -> bool {
        matches!(
            self,
            Self::JobScheduled { .. }
                | Self::JobFired { .. }
                | Self::JobCompleted { .. }
                | Self::JobCancelled { .. }
        )
    }

    /// Check if this reports a failed handler or dead letter.
    pub fn is_fault_event(&self) -> bool {
        matches!(
            self,
            Self::HandlerFault { .. } | Self::MessageDeadLettered { .. }
        )
    }

    /// Device the event refers to, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::DeviceAdded { device_id, .. }
            | Self::DeviceUpdated { device_id, .. }
            | Self::DeviceOffline { device_id, .. }
            | Self::DeviceRemoved { device_id, .. } => Some(device_id),
            Self::LockAcquired { resource_id, .. }
            | Self::LockReleased { resource_id, .. }
            | Self::LockExpired { resource_id, .. } => Some(resource_id),
            _ => None,
        }
    }
}

impl fmt::Display for LabEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device_id() {
            Some(id) => write!(f, "{}({})", self.type_name(), id),
            None => write!(f, "{}", self.type_name()),
        }
    }
}

/// Event metadata.
///
/// Attached to each event for tracking and correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub event_id: String,
    /// Optional correlation ID, e.g. the command `req_id`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Component that published the event
    pub source: String,
    pub timestamp: i64,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_name() {
        let event = LabEvent::DeviceAdded {
            device_id: "device-1".to_string(),
            device_type: "pump".to_string(),
            timestamp: 0,
        };
        assert_eq!(event.type_name(), "DeviceAdded");
        assert!(event.is_device_event());
        assert!(!event.is_lock_event());
        assert_eq!(event.to_string(), "DeviceAdded(device-1)");
    }

    #[test]
    fn test_lock_event_refers_to_resource() {
        let event = LabEvent::LockExpired {
            lock_id: "l1".to_string(),
            resource_id: "device-1".to_string(),
            holder: "proj".to_string(),
            timestamp: 42,
        };
        assert!(event.is_lock_event());
        assert_eq!(event.device_id(), Some("device-1"));
        assert_eq!(event.timestamp(), 42);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = LabEvent::JobCancelled {
            job_id: "j1".to_string(),
            timestamp: 7,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "JobCancelled");

        let back: LabEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
