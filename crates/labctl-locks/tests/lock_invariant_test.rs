//! Concurrency tests for the lock manager.
//!
//! Many tasks hammer a handful of resources with random acquire/release/renew
//! sequences; after every step the lease table must still satisfy the
//! exclusive/shared invariant.

use labctl_core::EventBus;
use labctl_locks::{LeaseKind, LockHandle, LockInfo, LockManager, LockManagerConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

const RESOURCES: [&str; 3] = ["device-1", "device-2", "device-3"];

fn assert_invariant(leases: &[LockInfo]) {
    let exclusive = leases
        .iter()
        .filter(|l| l.kind == LeaseKind::Exclusive)
        .count();
    assert!(exclusive <= 1, "two exclusive leases: {leases:?}");
    if exclusive == 1 {
        assert_eq!(leases.len(), 1, "exclusive lease shared: {leases:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_concurrent_acquire_release_keeps_invariant() {
    let locks = Arc::new(LockManager::new(LockManagerConfig::default(), EventBus::new()));
    let mut tasks = Vec::new();

    for worker in 0..16u64 {
        let locks = locks.clone();
        tasks.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(worker);
            let holder = format!("worker-{worker}");
            let mut held: Vec<LockHandle> = Vec::new();

            for _ in 0..500 {
                let resource = RESOURCES[rng.gen_range(0..RESOURCES.len())];
                match rng.gen_range(0..10) {
                    0..=4 => {
                        let kind = if rng.gen_bool(0.3) {
                            LeaseKind::Exclusive
                        } else {
                            LeaseKind::Shared
                        };
                        let ttl = rng.gen_bool(0.2).then(|| Duration::from_millis(5));
                        if let Ok(handle) = locks.acquire(resource, kind, &holder, ttl) {
                            held.push(handle);
                        }
                    }
                    5..=7 if !held.is_empty() => {
                        let handle = held.swap_remove(rng.gen_range(0..held.len()));
                        locks.release(&handle).unwrap();
                        // Second release of the same handle is a no-op.
                        locks.release(&handle).unwrap();
                    }
                    8 if !held.is_empty() => {
                        let handle = &held[rng.gen_range(0..held.len())];
                        // Expired handles answer NotFound; live ones renew.
                        let _ = locks.renew(handle, Duration::from_millis(5));
                    }
                    _ => {
                        locks.sweep_expired();
                    }
                }

                assert_invariant(&locks.locks_for(resource));
                tokio::task::yield_now().await;
            }

            for handle in held {
                locks.release(&handle).unwrap();
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    for resource in RESOURCES {
        assert!(locks.locks_for(resource).is_empty());
    }
    let stats = locks.stats();
    assert!(stats.granted > 0);
    assert!(stats.denied > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_exclusive_winner() {
    let locks = Arc::new(LockManager::new(LockManagerConfig::default(), EventBus::new()));

    let attempts: Vec<_> = (0..32)
        .map(|i| {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire("device-1", LeaseKind::Exclusive, &format!("h{i}"), None)
                    .is_ok()
            })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(locks.has_exclusive("device-1"));
}

#[tokio::test]
async fn test_sweeper_expires_leases_in_background() {
    let events = EventBus::new();
    let mut expired = events.filter().lock_events();
    let config = LockManagerConfig {
        sweep_interval: Duration::from_millis(20),
        ..LockManagerConfig::default()
    };
    let locks = Arc::new(LockManager::new(config, events));
    let shutdown = labctl_core::Shutdown::new();
    let sweeper = locks.spawn_sweeper(shutdown.listener());

    locks
        .acquire("device-1", LeaseKind::Exclusive, "proj", Some(Duration::from_millis(30)))
        .unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let (event, _) = expired.recv().await.unwrap();
            if event.type_name() == "LockExpired" {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seen.device_id(), Some("device-1"));
    assert!(locks.list().is_empty());

    shutdown.trigger();
    sweeper.await.unwrap();
}
