//! Lease table.
//!
//! Per resource, either one exclusive lease or any number of shared leases
//! is active at a time. Acquisition never waits; a conflicting request gets
//! [`Error::Denied`] immediately. Leases carry an optional TTL. A lease past
//! its TTL is treated as gone by every operation even before the sweep
//! removes it.

use crate::{LeaseKind, LockHandle, LockInfo, LockManagerConfig};
use chrono::{DateTime, Utc};
use labctl_core::{Error, EventBus, LabEvent, Result, ShutdownListener};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Issues lock ids as `<prefix><sequence>`. Every issued id can be
/// recognised later without remembering it: a well-formed id below the next
/// sequence number that is no longer in the table was released or expired.
struct LockIds {
    prefix: String,
    next: u64,
}

impl LockIds {
    fn new() -> Self {
        Self {
            prefix: format!("{}-", uuid::Uuid::new_v4().simple()),
            next: 0,
        }
    }

    fn issue(&mut self) -> String {
        let id = format!("{}{}", self.prefix, self.next);
        self.next += 1;
        id
    }

    fn was_issued(&self, lock_id: &str) -> bool {
        lock_id
            .strip_prefix(&self.prefix)
            .and_then(|seq| seq.parse::<u64>().ok().filter(|n| n.to_string() == seq))
            .is_some_and(|seq| seq < self.next)
    }
}

#[derive(Default)]
struct Table {
    /// resource_id -> active leases in acquisition order
    by_resource: BTreeMap<String, Vec<LockInfo>>,
    /// lock_id -> resource_id
    index: HashMap<String, String>,
}

impl Table {
    fn remove(&mut self, lock_id: &str) -> Option<LockInfo> {
        let resource = self.index.remove(lock_id)?;
        let leases = self.by_resource.get_mut(&resource)?;
        let pos = leases.iter().position(|l| l.lock_id == lock_id)?;
        let removed = leases.remove(pos);
        if leases.is_empty() {
            self.by_resource.remove(&resource);
        }
        Some(removed)
    }

    fn get(&self, lock_id: &str) -> Option<&LockInfo> {
        let resource = self.index.get(lock_id)?;
        self.by_resource
            .get(resource)?
            .iter()
            .find(|l| l.lock_id == lock_id)
    }

    fn get_mut(&mut self, lock_id: &str) -> Option<&mut LockInfo> {
        let resource = self.index.get(lock_id)?;
        self.by_resource
            .get_mut(resource)?
            .iter_mut()
            .find(|l| l.lock_id == lock_id)
    }

    fn expired_ids(&self, resource: Option<&str>, now: DateTime<Utc>) -> Vec<String> {
        let leases: Box<dyn Iterator<Item = &LockInfo>> = match resource {
            Some(r) => Box::new(self.by_resource.get(r).into_iter().flatten()),
            None => Box::new(self.by_resource.values().flatten()),
        };
        leases
            .filter(|l| l.is_expired_at(now))
            .map(|l| l.lock_id.clone())
            .collect()
    }
}

struct State {
    table: Table,
    ids: LockIds,
}

impl State {
    /// Remove every expired lease (optionally of one resource).
    fn purge_expired(&mut self, resource: Option<&str>, now: DateTime<Utc>) -> Vec<LockInfo> {
        let ids = self.table.expired_ids(resource, now);
        let mut expired = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(info) = self.table.remove(&id) {
                expired.push(info);
            }
        }
        expired
    }
}

/// Lock counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LockStats {
    pub active: usize,
    pub granted: u64,
    pub denied: u64,
    pub released: u64,
    pub expired: u64,
}

/// Arbiter for device leases.
pub struct LockManager {
    state: Mutex<State>,
    events: EventBus,
    config: LockManagerConfig,
    granted: AtomicU64,
    denied: AtomicU64,
    released: AtomicU64,
    expired: AtomicU64,
}

impl LockManager {
    pub fn new(config: LockManagerConfig, events: EventBus) -> Self {
        Self {
            state: Mutex::new(State {
                table: Table::default(),
                ids: LockIds::new(),
            }),
            events,
            config,
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            released: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// Try to take a lease. Never waits.
    ///
    /// `ttl` of `None` falls back to the configured default TTL, which may
    /// itself be `None` (lease lives until released).
    pub fn acquire(
        &self,
        resource_id: &str,
        kind: LeaseKind,
        holder: &str,
        ttl: Option<Duration>,
    ) -> Result<LockHandle> {
        self.acquire_at(resource_id, kind, holder, ttl, Utc::now())
    }

    pub fn acquire_at(
        &self,
        resource_id: &str,
        kind: LeaseKind,
        holder: &str,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<LockHandle> {
        if resource_id.trim().is_empty() {
            return Err(Error::validation("resource_id cannot be empty"));
        }
        if holder.trim().is_empty() {
            return Err(Error::validation("holder cannot be empty"));
        }
        let expires_at = match ttl.or(self.config.default_ttl) {
            Some(ttl) => Some(now + to_chrono(ttl)?),
            None => None,
        };

        let (outcome, expired) = {
            let mut state = self.state.lock();
            let expired = state.purge_expired(Some(resource_id), now);

            let conflict = state
                .table
                .by_resource
                .get(resource_id)
                .and_then(|leases| leases.iter().find(|l| !kind.compatible_with(l.kind)))
                .map(|l| (l.kind, l.holder.clone()));

            let outcome = match conflict {
                Some((held_kind, held_by)) => Err((held_kind, held_by)),
                None => {
                    let info = LockInfo {
                        lock_id: state.ids.issue(),
                        resource_id: resource_id.to_string(),
                        kind,
                        holder: holder.to_string(),
                        acquired_at: now,
                        expires_at,
                    };
                    state
                        .table
                        .index
                        .insert(info.lock_id.clone(), info.resource_id.clone());
                    state
                        .table
                        .by_resource
                        .entry(info.resource_id.clone())
                        .or_default()
                        .push(info.clone());
                    Ok(info)
                }
            };
            (outcome, expired)
        };

        self.announce_expired(expired, now);

        match outcome {
            Ok(info) => {
                self.granted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    category = "locks",
                    resource_id,
                    holder,
                    kind = %kind,
                    lock_id = %info.lock_id,
                    "Lease granted"
                );
                self.events.publish_with_source(
                    LabEvent::LockAcquired {
                        lock_id: info.lock_id.clone(),
                        resource_id: info.resource_id.clone(),
                        kind: kind.to_string(),
                        holder: info.holder.clone(),
                        timestamp: now.timestamp(),
                    },
                    "locks",
                );
                Ok(info.handle())
            }
            Err((held_kind, held_by)) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    category = "locks",
                    resource_id,
                    holder,
                    requested = %kind,
                    held = %held_kind,
                    held_by = %held_by,
                    "Lease denied"
                );
                Err(Error::denied(format!(
                    "{resource_id} is held {held_kind} by {held_by}"
                )))
            }
        }
    }

    /// Release a lease.
    ///
    /// Releasing an already released or expired handle succeeds without
    /// effect. A handle this manager never issued is `NotFound`.
    pub fn release(&self, handle: &LockHandle) -> Result<()> {
        self.release_id(&handle.lock_id, false)
    }

    /// Release a lease by id on behalf of an operator.
    pub fn force_release(&self, lock_id: &str) -> Result<()> {
        self.release_id(lock_id, true)
    }

    fn release_id(&self, lock_id: &str, forced: bool) -> Result<()> {
        let now = Utc::now();
        let removed = {
            let mut state = self.state.lock();
            match state.table.remove(lock_id) {
                Some(info) => Some(info),
                None if state.ids.was_issued(lock_id) => None,
                None => return Err(Error::not_found(format!("lock {lock_id}"))),
            }
        };

        let Some(info) = removed else {
            debug!(category = "locks", lock_id, "Release of inactive handle ignored");
            return Ok(());
        };

        if info.is_expired_at(now) {
            self.announce_expired(vec![info], now);
            return Ok(());
        }

        self.released.fetch_add(1, Ordering::Relaxed);
        if forced {
            info!(
                category = "locks",
                lock_id,
                resource_id = %info.resource_id,
                holder = %info.holder,
                "Lease force-released"
            );
        } else {
            debug!(category = "locks", lock_id, resource_id = %info.resource_id, "Lease released");
        }
        self.events.publish_with_source(
            LabEvent::LockReleased {
                lock_id: info.lock_id,
                resource_id: info.resource_id,
                holder: info.holder,
                forced,
                timestamp: now.timestamp(),
            },
            "locks",
        );
        Ok(())
    }

    /// Push a lease's expiry to `now + ttl`.
    ///
    /// `NotFound` once the lease has expired, even if the sweep has not yet
    /// removed it, or after it was released.
    pub fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<LockInfo> {
        self.renew_at(handle, ttl, Utc::now())
    }

    pub fn renew_at(
        &self,
        handle: &LockHandle,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockInfo> {
        let new_expiry = now + to_chrono(ttl)?;
        let outcome = {
            let mut state = self.state.lock();
            let expired = match state.table.get(&handle.lock_id) {
                None => None,
                Some(info) => Some(info.is_expired_at(now)),
            };
            match expired {
                None => Err(None),
                Some(true) => Err(state.table.remove(&handle.lock_id)),
                Some(false) => match state.table.get_mut(&handle.lock_id) {
                    Some(info) => {
                        info.expires_at = Some(new_expiry);
                        Ok(info.clone())
                    }
                    None => Err(None),
                },
            }
        };

        match outcome {
            Ok(info) => {
                debug!(category = "locks", lock_id = %info.lock_id, "Lease renewed");
                Ok(info)
            }
            Err(expired) => {
                if let Some(info) = expired {
                    self.announce_expired(vec![info], now);
                }
                Err(Error::not_found(format!("lock {}", handle.lock_id)))
            }
        }
    }

    /// Drop every lease held by `holder`. Returns how many were released.
    pub fn release_holder(&self, holder: &str) -> usize {
        let ids: Vec<String> = {
            let state = self.state.lock();
            state
                .table
                .by_resource
                .values()
                .flatten()
                .filter(|l| l.holder == holder)
                .map(|l| l.lock_id.clone())
                .collect()
        };
        ids.iter()
            .filter(|id| self.release_id(id, false).is_ok())
            .count()
    }

    /// Remove every lease past its TTL, emitting `LockExpired` for each.
    pub fn sweep_expired(&self) -> Vec<LockInfo> {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<LockInfo> {
        let expired = self.state.lock().purge_expired(None, now);
        if !expired.is_empty() {
            info!(category = "locks", count = expired.len(), "Expired leases swept");
        }
        self.announce_expired(expired.clone(), now);
        expired
    }

    /// Active (unexpired) leases ordered by resource, then acquisition.
    pub fn list(&self) -> Vec<LockInfo> {
        let now = Utc::now();
        let state = self.state.lock();
        state
            .table
            .by_resource
            .values()
            .flatten()
            .filter(|l| !l.is_expired_at(now))
            .cloned()
            .collect()
    }

    pub fn locks_for(&self, resource_id: &str) -> Vec<LockInfo> {
        let now = Utc::now();
        let state = self.state.lock();
        state
            .table
            .by_resource
            .get(resource_id)
            .map(|leases| {
                leases
                    .iter()
                    .filter(|l| !l.is_expired_at(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, lock_id: &str) -> Option<LockInfo> {
        let now = Utc::now();
        self.state
            .lock()
            .table
            .get(lock_id)
            .filter(|l| !l.is_expired_at(now))
            .cloned()
    }

    /// Whether an unexpired exclusive lease exists on `resource_id`.
    pub fn has_exclusive(&self, resource_id: &str) -> bool {
        self.locks_for(resource_id)
            .iter()
            .any(|l| l.kind == LeaseKind::Exclusive)
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            active: self.list().len(),
            granted: self.granted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    /// Run the expiry sweep every `sweep_interval` until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: ShutdownListener) -> JoinHandle<()> {
        let manager = self.clone();
        let period = manager.config.sweep_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = timer.tick() => {
                        manager.sweep_expired();
                    }
                }
            }
            debug!(category = "locks", "Lease sweeper stopped");
        })
    }

    fn announce_expired(&self, expired: Vec<LockInfo>, now: DateTime<Utc>) {
        for info in expired {
            self.expired.fetch_add(1, Ordering::Relaxed);
            warn!(
                category = "locks",
                lock_id = %info.lock_id,
                resource_id = %info.resource_id,
                holder = %info.holder,
                "Lease expired"
            );
            self.events.publish_with_source(
                LabEvent::LockExpired {
                    lock_id: info.lock_id,
                    resource_id: info.resource_id,
                    holder: info.holder,
                    timestamp: now.timestamp(),
                },
                "locks",
            );
        }
    }
}

fn to_chrono(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|_| Error::validation(format!("ttl {ttl:?} out of range")))
}
