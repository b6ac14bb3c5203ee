//! Device registry.
//!
//! The authoritative map of known devices. Devices appear on the first
//! message that names them, are refreshed by every later message, go
//! `offline` after a silence timeout and disappear only on an explicit
//! [`DeviceRegistry::remove`], which refuses while an exclusive lease is
//! held on the device.

use crate::device::{Device, DeviceStatus, StatusDelta};
use crate::HeartbeatConfig;
use chrono::{DateTime, Utc};
use labctl_core::envelope::validate_device_id;
use labctl_core::{Error, EventBus, LabEvent, Result, ShutdownListener};
use labctl_locks::LockManager;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Device counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub error: usize,
    pub unknown: usize,
}

pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<String, Device>>,
    locks: Arc<LockManager>,
    events: EventBus,
    heartbeat: HeartbeatConfig,
}

impl DeviceRegistry {
    pub fn new(heartbeat: HeartbeatConfig, locks: Arc<LockManager>, events: EventBus) -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            locks,
            events,
            heartbeat,
        }
    }

    pub fn heartbeat_config(&self) -> &HeartbeatConfig {
        &self.heartbeat
    }

    /// Merge `delta` into the device, creating it on first sight.
    ///
    /// `last_seen` only ever moves forward: a delta observed before the
    /// current `last_seen` still merges its fields but leaves the timestamp.
    pub async fn upsert(&self, device_id: &str, delta: StatusDelta) -> Result<Device> {
        validate_device_id(device_id)?;
        let observed = delta.observed_at.unwrap_or_else(Utc::now);

        let (device, event) = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(device_id) {
                Some(device) => {
                    let before = (device.status, device.device_type.clone(), device.metadata.clone());

                    let current = device.status;
                    device.status = delta.status.unwrap_or_else(|| current.on_message());
                    if let Some(device_type) = delta.device_type {
                        device.device_type = device_type;
                    }
                    device.metadata.extend(delta.metadata);
                    device.last_seen = device.last_seen.max(observed);

                    let changed =
                        before != (device.status, device.device_type.clone(), device.metadata.clone());
                    let event = changed.then(|| LabEvent::DeviceUpdated {
                        device_id: device.device_id.clone(),
                        status: device.status.to_string(),
                        timestamp: device.last_seen.timestamp(),
                    });
                    (device.clone(), event)
                }
                None => {
                    let device = Device {
                        device_id: device_id.to_string(),
                        device_type: delta.device_type.unwrap_or_else(|| "unknown".to_string()),
                        status: delta.status.unwrap_or(DeviceStatus::Online),
                        first_seen: observed,
                        last_seen: observed,
                        metadata: delta.metadata,
                    };
                    devices.insert(device_id.to_string(), device.clone());
                    let event = LabEvent::DeviceAdded {
                        device_id: device.device_id.clone(),
                        device_type: device.device_type.clone(),
                        timestamp: observed.timestamp(),
                    };
                    (device, Some(event))
                }
            }
        };

        if let Some(event) = event {
            match &event {
                LabEvent::DeviceAdded { .. } => info!(
                    category = "devices",
                    device_id,
                    device_type = %device.device_type,
                    "Device added"
                ),
                _ => debug!(category = "devices", device_id, status = %device.status, "Device updated"),
            }
            self.events.publish_with_source(event, "devices");
        }
        Ok(device)
    }

    /// Refresh `last_seen` without changing anything else.
    pub async fn touch(&self, device_id: &str) -> Result<Device> {
        self.upsert(device_id, StatusDelta::new()).await
    }

    pub async fn get(&self, device_id: &str) -> Result<Device> {
        self.devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("device {device_id}")))
    }

    /// Devices ordered by `device_id`, optionally only one type.
    pub async fn list(&self, device_type: Option<&str>) -> Vec<Device> {
        self.devices
            .read()
            .await
            .values()
            .filter(|d| device_type.map_or(true, |t| d.device_type == t))
            .cloned()
            .collect()
    }

    /// Delete a device.
    ///
    /// Fails with `ResourceBusy` while an exclusive lease exists on it.
    pub async fn remove(&self, device_id: &str) -> Result<()> {
        let mut devices = self.devices.write().await;
        if !devices.contains_key(device_id) {
            return Err(Error::not_found(format!("device {device_id}")));
        }
        if self.locks.has_exclusive(device_id) {
            return Err(Error::busy(format!(
                "device {device_id} is held under an exclusive lease"
            )));
        }
        devices.remove(device_id);
        drop(devices);

        info!(category = "devices", device_id, "Device removed");
        self.events.publish_with_source(
            LabEvent::DeviceRemoved {
                device_id: device_id.to_string(),
                timestamp: Utc::now().timestamp(),
            },
            "devices",
        );
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn stats(&self) -> DeviceStats {
        let devices = self.devices.read().await;
        let mut stats = DeviceStats {
            total: devices.len(),
            ..DeviceStats::default()
        };
        for device in devices.values() {
            match device.status {
                DeviceStatus::Online => stats.online += 1,
                DeviceStatus::Offline => stats.offline += 1,
                DeviceStatus::Error => stats.error += 1,
                DeviceStatus::Unknown => stats.unknown += 1,
            }
        }
        stats
    }

    /// Mark devices silent for longer than the timeout as offline.
    ///
    /// Returns the ids that transitioned. Devices are never deleted here.
    pub async fn sweep_offline_at(&self, now: DateTime<Utc>) -> Vec<String> {
        // A timeout too large to represent never expires.
        let timeout = i64::try_from(self.heartbeat.silence_timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        let stale: Vec<(String, i64)> = {
            let mut devices = self.devices.write().await;
            devices
                .values_mut()
                .filter(|d| d.status != DeviceStatus::Offline && now - d.last_seen > timeout)
                .map(|d| {
                    d.status = DeviceStatus::Offline;
                    (d.device_id.clone(), d.silence_at(now))
                })
                .collect()
        };

        for (device_id, silence) in &stale {
            info!(
                category = "devices",
                device_id = %device_id,
                silence_secs = silence,
                "Device silent past timeout, marking offline"
            );
            self.events.publish_with_source(
                LabEvent::DeviceOffline {
                    device_id: device_id.clone(),
                    reason: Some(format!("no message for {silence}s")),
                    timestamp: now.timestamp(),
                },
                "devices",
            );
        }
        stale.into_iter().map(|(id, _)| id).collect()
    }

    pub async fn sweep_offline(&self) -> Vec<String> {
        self.sweep_offline_at(Utc::now()).await
    }

    /// Run the offline sweep every `sweep_interval_secs` until shutdown.
    pub fn spawn_presence_monitor(self: &Arc<Self>, mut shutdown: ShutdownListener) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            if !registry.heartbeat.auto_mark_offline {
                debug!(category = "devices", "Presence monitor disabled");
                return;
            }
            let mut timer = tokio::time::interval(registry.heartbeat.sweep_duration());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // Skip first tick

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = timer.tick() => {
                        registry.sweep_offline().await;
                    }
                }
            }
            debug!(category = "devices", "Presence monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScalarValue;
    use labctl_locks::{LeaseKind, LockManagerConfig};

    fn registry() -> (DeviceRegistry, Arc<LockManager>, EventBus) {
        let events = EventBus::new();
        let locks = Arc::new(LockManager::new(LockManagerConfig::default(), events.clone()));
        let registry = DeviceRegistry::new(HeartbeatConfig::default(), locks.clone(), events.clone());
        (registry, locks, events)
    }

    #[tokio::test]
    async fn test_huge_silence_timeout_never_marks_offline() {
        let locks = Arc::new(LockManager::new(LockManagerConfig::default(), EventBus::new()));
        let heartbeat = HeartbeatConfig {
            silence_timeout_secs: u64::MAX,
            ..HeartbeatConfig::default()
        };
        let registry = DeviceRegistry::new(heartbeat, locks, EventBus::new());
        registry.upsert("device-1", StatusDelta::new()).await.unwrap();

        let later = Utc::now() + chrono::Duration::days(3650);
        assert!(registry.sweep_offline_at(later).await.is_empty());
        assert_eq!(registry.get("device-1").await.unwrap().status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_upsert_creates_then_merges() {
        let (registry, _, events) = registry();
        let mut rx = events.filter().device_events();

        let device = registry
            .upsert(
                "device-1",
                StatusDelta::new().with_type("projector").with_metadata("fw", "1.0"),
            )
            .await
            .unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.device_type, "projector");

        let device = registry
            .upsert("device-1", StatusDelta::new().with_metadata("lamp_hours", 10i64))
            .await
            .unwrap();
        assert_eq!(device.device_type, "projector");
        assert_eq!(device.metadata.len(), 2);
        assert_eq!(device.metadata["lamp_hours"], ScalarValue::Int(10));

        let types: Vec<&str> = std::iter::from_fn(|| rx.try_recv())
            .map(|(e, _)| e.type_name())
            .collect();
        assert_eq!(types, vec!["DeviceAdded", "DeviceUpdated"]);
    }

    #[tokio::test]
    async fn test_plain_refresh_emits_nothing() {
        let (registry, _, events) = registry();
        registry.touch("device-1").await.unwrap();
        let mut rx = events.subscribe();
        registry.touch("device-1").await.unwrap();
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_error_is_sticky_until_cleared() {
        let (registry, _, _) = registry();
        registry
            .upsert("d", StatusDelta::new().with_status(DeviceStatus::Error))
            .await
            .unwrap();
        assert_eq!(registry.touch("d").await.unwrap().status, DeviceStatus::Error);
        let cleared = registry
            .upsert("d", StatusDelta::new().with_status(DeviceStatus::Online))
            .await
            .unwrap();
        assert_eq!(cleared.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_list_ordered_and_filtered() {
        let (registry, _, _) = registry();
        for (id, ty) in [("c", "pump"), ("a", "camera"), ("b", "pump")] {
            registry
                .upsert(id, StatusDelta::new().with_type(ty))
                .await
                .unwrap();
        }
        let ids: Vec<String> = registry.list(None).await.into_iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let pumps: Vec<String> = registry
            .list(Some("pump"))
            .await
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(pumps, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_remove_blocked_by_exclusive_lease() {
        let (registry, locks, _) = registry();
        registry.touch("device-1").await.unwrap();

        let handle = locks
            .acquire("device-1", LeaseKind::Exclusive, "proj", None)
            .unwrap();
        assert!(matches!(
            registry.remove("device-1").await,
            Err(Error::ResourceBusy(_))
        ));

        locks.release(&handle).unwrap();
        registry.remove("device-1").await.unwrap();
        assert!(matches!(
            registry.get("device-1").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            registry.remove("device-1").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_lease_does_not_block_remove() {
        let (registry, locks, _) = registry();
        registry.touch("device-1").await.unwrap();
        locks.acquire("device-1", LeaseKind::Shared, "viewer", None).unwrap();
        assert!(registry.remove("device-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_device_id() {
        let (registry, _, _) = registry();
        assert!(matches!(
            registry.touch("bad id").await,
            Err(Error::Validation(_))
        ));
        assert!(registry.touch("").await.is_err());
    }
}
