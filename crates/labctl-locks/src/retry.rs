//! Jittered exponential backoff for callers that are willing to wait.
//!
//! The manager itself never queues requests; this helper simply retries
//! [`LockManager::acquire`] while it keeps answering `Denied`.

use crate::{LeaseKind, LockHandle, LockManager};
use labctl_core::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Backoff settings. Attempt `n` (1-based) waits
/// `min(base_delay * exponential_base^(n-1), max_delay)` plus or minus
/// `jitter_factor` of that value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows attempt `attempt` (1-based),
    /// without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = self.exponential_base.powi(attempt.saturating_sub(1) as i32);
        let secs = (self.base_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt).as_secs_f64();
        let range = base * self.jitter_factor.clamp(0.0, 1.0);
        if range <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let jitter = rand::thread_rng().gen_range(-range..=range);
        Duration::from_secs_f64((base + jitter).max(0.0))
    }
}

/// Retry `acquire` with backoff while it returns `Denied`.
///
/// Any other error is returned immediately. After `max_attempts` denials
/// the last `Denied` is returned.
pub async fn acquire_with_retry(
    locks: &LockManager,
    resource_id: &str,
    kind: LeaseKind,
    holder: &str,
    ttl: Option<Duration>,
    retry: &RetryConfig,
) -> Result<LockHandle> {
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match locks.acquire(resource_id, kind, holder, ttl) {
            Ok(handle) => return Ok(handle),
            Err(Error::Denied(reason)) if attempt < attempts => {
                let delay = retry.delay_for(attempt);
                debug!(
                    category = "locks",
                    resource_id,
                    holder,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Lease busy, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
