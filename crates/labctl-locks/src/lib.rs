//! Resource lock manager for labctl.
//!
//! Modules take a lease on a device before driving it so two control paths
//! never fight over the same hardware.
//!
//! ## Rules
//!
//! - At most one exclusive lease per resource, and never alongside shared
//!   leases. Shared leases coexist with each other.
//! - [`LockManager::acquire`] never waits. Callers that want to wait use
//!   [`acquire_with_retry`].
//! - Leases are not re-entrant and cannot be upgraded.
//! - Holder liveness is TTL based: a holder that disappears loses its lease
//!   when the TTL runs out.

pub mod manager;
pub mod retry;

pub use manager::{LockManager, LockStats};
pub use retry::{acquire_with_retry, RetryConfig};

use chrono::{DateTime, Utc};
use labctl_core::config::locks::DEFAULT_SWEEP_INTERVAL_SECS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lease kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseKind {
    Exclusive,
    Shared,
}

impl LeaseKind {
    /// Whether a new lease of this kind may coexist with a held one.
    pub fn compatible_with(self, held: LeaseKind) -> bool {
        matches!((self, held), (LeaseKind::Shared, LeaseKind::Shared))
    }
}

impl fmt::Display for LeaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseKind::Exclusive => f.write_str("exclusive"),
            LeaseKind::Shared => f.write_str("shared"),
        }
    }
}

impl std::str::FromStr for LeaseKind {
    type Err = labctl_core::Error;

    fn from_str(s: &str) -> labctl_core::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exclusive" => Ok(LeaseKind::Exclusive),
            "shared" => Ok(LeaseKind::Shared),
            other => Err(labctl_core::Error::validation(format!(
                "unknown lease kind '{other}'"
            ))),
        }
    }
}

/// Proof of a granted lease, returned by acquire and needed to release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHandle {
    pub lock_id: String,
    pub resource_id: String,
    pub kind: LeaseKind,
    pub holder: String,
}

/// A lease as stored by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_id: String,
    pub resource_id: String,
    pub kind: LeaseKind,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    pub fn handle(&self) -> LockHandle {
        LockHandle {
            lock_id: self.lock_id.clone(),
            resource_id: self.resource_id.clone(),
            kind: self.kind,
            holder: self.holder.clone(),
        }
    }
}

/// Lock manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LockManagerConfig {
    /// Period of the background expiry sweep.
    pub sweep_interval: Duration,
    /// TTL applied when acquire passes none. `None` means no expiry.
    pub default_ttl: Option<Duration>,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            default_ttl: None,
        }
    }
}
