//! Presence and timestamp properties of the device registry.

use chrono::{Duration as ChronoDuration, Utc};
use labctl_core::EventBus;
use labctl_devices::{DeviceRegistry, DeviceStatus, HeartbeatConfig, StatusDelta};
use labctl_locks::{LockManager, LockManagerConfig};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

fn make_registry(silence_timeout_secs: u64) -> (Arc<DeviceRegistry>, EventBus) {
    let events = EventBus::new();
    let locks = Arc::new(LockManager::new(LockManagerConfig::default(), events.clone()));
    let registry = DeviceRegistry::new(
        HeartbeatConfig::new(silence_timeout_secs, 1),
        locks,
        events.clone(),
    );
    (Arc::new(registry), events)
}

#[tokio::test]
async fn test_last_seen_never_moves_backwards() {
    let (registry, _) = make_registry(300);
    let base = Utc::now();
    let mut rng = rand::thread_rng();
    let mut max_seen = None;

    for _ in 0..200 {
        // Out-of-order observation times, as delivered by a jittery bus.
        let at = base + ChronoDuration::milliseconds(rng.gen_range(-60_000..60_000));
        let device = registry
            .upsert("device-1", StatusDelta::new().observed_at(at))
            .await
            .unwrap();

        let expected = max_seen.map_or(at, |m: chrono::DateTime<Utc>| m.max(at));
        assert_eq!(device.last_seen, expected);
        max_seen = Some(expected);
    }
}

#[tokio::test]
async fn test_offline_iff_silent_past_timeout() {
    let (registry, events) = make_registry(300);
    let mut offline = events.subscribe_filtered(|e| e.type_name() == "DeviceOffline");
    let now = Utc::now();

    registry
        .upsert("fresh", StatusDelta::new().observed_at(now - ChronoDuration::seconds(10)))
        .await
        .unwrap();
    registry
        .upsert("boundary", StatusDelta::new().observed_at(now - ChronoDuration::seconds(300)))
        .await
        .unwrap();
    registry
        .upsert("stale", StatusDelta::new().observed_at(now - ChronoDuration::seconds(301)))
        .await
        .unwrap();

    let swept = registry.sweep_offline_at(now).await;
    assert_eq!(swept, vec!["stale".to_string()]);

    assert_eq!(registry.get("fresh").await.unwrap().status, DeviceStatus::Online);
    assert_eq!(registry.get("boundary").await.unwrap().status, DeviceStatus::Online);
    assert_eq!(registry.get("stale").await.unwrap().status, DeviceStatus::Offline);

    // Offline devices stay registered and are not swept twice.
    assert!(registry.sweep_offline_at(now).await.is_empty());
    assert_eq!(registry.count().await, 3);

    let (event, _) = offline.try_recv().unwrap();
    assert_eq!(event.device_id(), Some("stale"));
    assert!(offline.try_recv().is_none());
}

#[tokio::test]
async fn test_message_after_offline_brings_device_back() {
    let (registry, _) = make_registry(300);
    let now = Utc::now();
    registry
        .upsert("d1", StatusDelta::new().observed_at(now - ChronoDuration::seconds(400)))
        .await
        .unwrap();
    registry.sweep_offline_at(now).await;
    assert_eq!(registry.get("d1").await.unwrap().status, DeviceStatus::Offline);

    let device = registry.touch("d1").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
    let stats = registry.stats().await;
    assert_eq!((stats.total, stats.online), (1, 1));
}

#[tokio::test]
async fn test_presence_monitor_runs_in_background() {
    let (registry, events) = make_registry(0);
    let mut offline = events.subscribe_filtered(|e| e.type_name() == "DeviceOffline");
    let shutdown = labctl_core::Shutdown::new();
    let monitor = registry.spawn_presence_monitor(shutdown.listener());

    registry
        .upsert("d1", StatusDelta::new().observed_at(Utc::now() - ChronoDuration::seconds(5)))
        .await
        .unwrap();

    let (event, _) = tokio::time::timeout(Duration::from_secs(3), offline.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.device_id(), Some("d1"));

    shutdown.trigger();
    monitor.await.unwrap();
}
