//! Dead letter queue for messages a handler could not process.
//!
//! Every fault the router isolates is recorded here, published to the
//! `<root>/dlq/...` topic family and kept in a bounded in-memory buffer so
//! operators can list, retry or purge it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use labctl_bus::DynMessageBus;
use labctl_core::{Error, EventBus, LabEvent, Result, TopicScheme};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

/// Why a message ended up in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ParseError,
    ValidationError,
    ProcessingError,
    Timeout,
    DeviceOffline,
    UnknownDevice,
    ModuleError,
    ResourceLocked,
    RateLimited,
    Unknown,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "parse_error",
            Self::ValidationError => "validation_error",
            Self::ProcessingError => "processing_error",
            Self::Timeout => "timeout",
            Self::DeviceOffline => "device_offline",
            Self::UnknownDevice => "unknown_device",
            Self::ModuleError => "module_error",
            Self::ResourceLocked => "resource_locked",
            Self::RateLimited => "rate_limited",
            Self::Unknown => "unknown",
        }
    }

    /// Classify a service error returned by a handler.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Validation(_) => Self::ValidationError,
            Error::Serialization(_) => Self::ParseError,
            Error::Denied(_) | Error::ResourceBusy(_) => Self::ResourceLocked,
            Error::NotFound(_) => Self::UnknownDevice,
            _ => Self::ModuleError,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed message with enough context to inspect or replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub topic: String,
    /// Original payload bytes, base64 in JSON.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub reason: FailureReason,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

/// Input to [`DeadLetterQueue::record`].
#[derive(Debug, Clone)]
pub struct FailedMessage<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub reason: FailureReason,
    pub error: String,
    pub module: Option<&'a str>,
    pub job_id: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Entries kept in memory; the oldest is evicted first.
    pub capacity: usize,
    /// Manual retries allowed per entry.
    pub max_retries: u32,
    /// Age after which [`DeadLetterQueue::purge_expired`] drops entries, in hours.
    pub retention_hours: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_retries: 3,
            retention_hours: 24 * 7,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    pub reason: Option<FailureReason>,
    pub device_id: Option<String>,
    pub module: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub recorded: u64,
    pub evicted: u64,
    pub by_reason: BTreeMap<String, usize>,
    pub by_device: BTreeMap<String, usize>,
    pub by_module: BTreeMap<String, usize>,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<DeadLetter>,
    recorded: u64,
    evicted: u64,
}

pub struct DeadLetterQueue {
    config: DeadLetterConfig,
    state: Mutex<QueueState>,
    bus: DynMessageBus,
    events: EventBus,
    topics: TopicScheme,
}

impl DeadLetterQueue {
    pub fn new(
        config: DeadLetterConfig,
        bus: DynMessageBus,
        events: EventBus,
        topics: TopicScheme,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            bus,
            events,
            topics,
        }
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Store a failure, publish it to its DLQ topic and emit `MessageDeadLettered`.
    ///
    /// Publishing is best effort: a disconnected bus does not lose the entry.
    pub async fn record(&self, failed: FailedMessage<'_>) -> DeadLetter {
        let now = Utc::now();
        let body: Option<serde_json::Value> = serde_json::from_slice(failed.payload).ok();
        let device_id = self
            .topics
            .parse_device_topic(failed.topic)
            .map(str::to_string)
            .or_else(|| json_str(body.as_ref(), "device_id"));
        let req_id = json_str(body.as_ref(), "req_id");

        let letter = DeadLetter {
            id: uuid::Uuid::new_v4().to_string(),
            topic: failed.topic.to_string(),
            payload: failed.payload.to_vec(),
            reason: failed.reason,
            error: failed.error,
            module: failed.module.map(str::to_string),
            device_id,
            req_id,
            job_id: failed.job_id.map(str::to_string),
            retry_count: 0,
            first_failed_at: now,
            last_failed_at: now,
        };

        {
            let mut state = self.state.lock();
            state.recorded += 1;
            if self.config.capacity > 0 && state.entries.len() >= self.config.capacity {
                state.entries.pop_front();
                state.evicted += 1;
            }
            state.entries.push_back(letter.clone());
        }

        warn!(
            category = "dlq",
            dead_letter_id = %letter.id,
            topic = %letter.topic,
            reason = %letter.reason,
            module = ?letter.module,
            "Message dead-lettered"
        );

        self.publish_letter(&letter).await;
        self.events.publish(LabEvent::MessageDeadLettered {
            dead_letter_id: letter.id.clone(),
            topic: letter.topic.clone(),
            reason: letter.reason.to_string(),
            timestamp: now.timestamp(),
        });
        letter
    }

    async fn publish_letter(&self, letter: &DeadLetter) {
        let topic = self
            .topics
            .dlq_topic(letter.device_id.as_deref(), letter.module.as_deref());
        let payload = match serde_json::to_vec(letter) {
            Ok(p) => p,
            Err(e) => {
                warn!(category = "dlq", error = %e, "Failed to encode dead letter");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&topic, payload).await {
            warn!(category = "dlq", topic = %topic, error = %e, "Failed to publish dead letter");
        }
    }

    /// Entries matching `filter`, newest first.
    pub fn list(&self, filter: &DeadLetterFilter) -> Vec<DeadLetter> {
        let state = self.state.lock();
        let iter = state.entries.iter().rev().filter(|l| {
            filter.reason.is_none_or(|r| l.reason == r)
                && filter
                    .device_id
                    .as_deref()
                    .is_none_or(|d| l.device_id.as_deref() == Some(d))
                && filter
                    .module
                    .as_deref()
                    .is_none_or(|m| l.module.as_deref() == Some(m))
        });
        match filter.limit {
            Some(limit) => iter.take(limit).cloned().collect(),
            None => iter.cloned().collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<DeadLetter> {
        self.state.lock().entries.iter().find(|l| l.id == id).cloned()
    }

    /// Republish the original payload bytes to the original topic.
    ///
    /// The entry stays in the queue, so a message that fails again is
    /// recorded as a new entry. Only a successful publish counts against
    /// `max_retries`.
    pub async fn retry(&self, id: &str) -> Result<DeadLetter> {
        let (topic, payload) = {
            let state = self.state.lock();
            let letter = state
                .entries
                .iter()
                .find(|l| l.id == id)
                .ok_or_else(|| Error::not_found(format!("dead letter {id}")))?;
            if letter.retry_count >= self.config.max_retries {
                return Err(Error::validation(format!(
                    "dead letter {id} exhausted {} retries",
                    self.config.max_retries
                )));
            }
            (letter.topic.clone(), letter.payload.clone())
        };

        self.bus.publish(&topic, payload).await?;

        let letter = {
            let mut state = self.state.lock();
            let letter = state
                .entries
                .iter_mut()
                .find(|l| l.id == id)
                .ok_or_else(|| Error::not_found(format!("dead letter {id}")))?;
            letter.retry_count += 1;
            letter.last_failed_at = Utc::now();
            letter.clone()
        };
        info!(
            category = "dlq",
            dead_letter_id = %letter.id,
            retry_count = letter.retry_count,
            "Dead letter retried"
        );
        Ok(letter)
    }

    pub fn remove(&self, id: &str) -> Result<DeadLetter> {
        let mut state = self.state.lock();
        let pos = state
            .entries
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| Error::not_found(format!("dead letter {id}")))?;
        state
            .entries
            .remove(pos)
            .ok_or_else(|| Error::internal("dead letter index out of range"))
    }

    /// Drop entries whose last failure is older than `cutoff`. Returns the count.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|l| l.last_failed_at >= cutoff);
        before - state.entries.len()
    }

    /// Apply the configured retention.
    pub fn purge_expired(&self) -> usize {
        let cutoff = i64::try_from(self.config.retention_hours)
            .ok()
            .and_then(ChronoDuration::try_hours)
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let purged = self.purge_older_than(cutoff);
        if purged > 0 {
            info!(category = "dlq", purged, "Purged expired dead letters");
        }
        purged
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.entries.len();
        state.entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DeadLetterStats {
        let state = self.state.lock();
        let mut stats = DeadLetterStats {
            total: state.entries.len(),
            recorded: state.recorded,
            evicted: state.evicted,
            ..Default::default()
        };
        for letter in &state.entries {
            *stats.by_reason.entry(letter.reason.to_string()).or_default() += 1;
            if let Some(device) = &letter.device_id {
                *stats.by_device.entry(device.clone()).or_default() += 1;
            }
            if let Some(module) = &letter.module {
                *stats.by_module.entry(module.clone()).or_default() += 1;
            }
        }
        stats
    }
}

pub type SharedDeadLetterQueue = Arc<DeadLetterQueue>;

fn json_str(body: Option<&serde_json::Value>, key: &str) -> Option<String> {
    body?.get(key)?.as_str().map(str::to_string)
}

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labctl_bus::{MemoryBus, MessageBus};

    fn make_queue(capacity: usize) -> (DeadLetterQueue, Arc<MemoryBus>, EventBus) {
        let bus = Arc::new(MemoryBus::new());
        let events = EventBus::new();
        let config = DeadLetterConfig {
            capacity,
            ..Default::default()
        };
        let dlq = DeadLetterQueue::new(config, bus.clone(), events.clone(), TopicScheme::default());
        (dlq, bus, events)
    }

    fn failed<'a>(topic: &'a str, payload: &'a [u8], module: Option<&'a str>) -> FailedMessage<'a> {
        FailedMessage {
            topic,
            payload,
            reason: FailureReason::ModuleError,
            error: "boom".to_string(),
            module,
            job_id: None,
        }
    }

    #[tokio::test]
    async fn test_record_publishes_to_device_module_topic() {
        let (dlq, bus, events) = make_queue(10);
        let mut rx = events.subscribe();
        let payload = br#"{"req_id":"r-1","device_id":"dev-1","action":"start"}"#;

        let letter = dlq.record(failed("lab/proj/cmd", payload, Some("proj"))).await;
        assert_eq!(letter.device_id.as_deref(), Some("dev-1"));
        assert_eq!(letter.req_id.as_deref(), Some("r-1"));

        let published = bus.published_matching("lab/dlq/dev-1/proj");
        assert_eq!(published.len(), 1);
        let echoed: DeadLetter = published[0].parse_json().unwrap();
        assert_eq!(echoed.id, letter.id);

        let (event, _) = rx.try_recv().unwrap();
        assert_eq!(event.type_name(), "MessageDeadLettered");
    }

    #[tokio::test]
    async fn test_device_taken_from_topic_and_orchestrator_fallback() {
        let (dlq, bus, _) = make_queue(10);
        dlq.record(failed("lab/device/scope-1/status", b"not json", None)).await;
        dlq.record(failed("lab/misc", b"not json", None)).await;

        assert_eq!(bus.published_matching("lab/dlq/scope-1/device").len(), 1);
        assert_eq!(bus.published_matching("lab/dlq/orchestrator").len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let (dlq, _, _) = make_queue(2);
        let first = dlq.record(failed("lab/a/cmd", b"1", Some("a"))).await;
        dlq.record(failed("lab/a/cmd", b"2", Some("a"))).await;
        dlq.record(failed("lab/a/cmd", b"3", Some("a"))).await;

        assert_eq!(dlq.len(), 2);
        assert!(dlq.get(&first.id).is_none());
        let stats = dlq.stats();
        assert_eq!((stats.recorded, stats.evicted), (3, 1));
        assert_eq!(stats.by_module.get("a"), Some(&2));

        let newest = dlq.list(&DeadLetterFilter::default());
        assert_eq!(newest[0].payload, b"3".to_vec());
    }

    #[tokio::test]
    async fn test_retry_republishes_until_exhausted() {
        let (dlq, bus, _) = make_queue(10);
        let letter = dlq.record(failed("lab/proj/cmd", b"{}", Some("proj"))).await;

        for attempt in 1..=3 {
            let retried = dlq.retry(&letter.id).await.unwrap();
            assert_eq!(retried.retry_count, attempt);
        }
        assert_eq!(bus.published_matching("lab/proj/cmd").len(), 3);
        assert!(matches!(dlq.retry(&letter.id).await, Err(Error::Validation(_))));
        assert!(matches!(dlq.retry("missing").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_retry_replays_exact_bytes() {
        let (dlq, bus, _) = make_queue(10);
        let raw: &[u8] = &[0xff, 0xfe, b'{', 0x00, 0x80];
        let letter = dlq.record(failed("lab/proj/cmd", raw, Some("proj"))).await;

        let echoed: DeadLetter = bus.published_matching("lab/dlq/orchestrator")[0]
            .parse_json()
            .unwrap();
        assert_eq!(echoed.payload, raw.to_vec());

        dlq.retry(&letter.id).await.unwrap();
        let replayed = bus.published_matching("lab/proj/cmd");
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].payload, raw.to_vec());
    }

    #[tokio::test]
    async fn test_failed_retry_does_not_spend_an_attempt() {
        let (dlq, bus, _) = make_queue(10);
        let letter = dlq.record(failed("lab/proj/cmd", b"{}", Some("proj"))).await;

        bus.set_connected(false);
        assert!(dlq.retry(&letter.id).await.is_err());
        assert_eq!(dlq.get(&letter.id).unwrap().retry_count, 0);

        bus.set_connected(true);
        assert_eq!(dlq.retry(&letter.id).await.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_record_survives_disconnected_bus() {
        let (dlq, bus, _) = make_queue(10);
        bus.set_connected(false);
        dlq.record(failed("lab/proj/cmd", b"{}", Some("proj"))).await;
        assert_eq!(dlq.len(), 1);
        assert!(bus.published().is_empty());
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn test_purge_and_filter() {
        let (dlq, _, _) = make_queue(10);
        dlq.record(failed("lab/a/cmd", b"{}", Some("a"))).await;
        dlq.record(failed("lab/b/cmd", b"{}", Some("b"))).await;

        let only_b = dlq.list(&DeadLetterFilter {
            module: Some("b".to_string()),
            ..Default::default()
        });
        assert_eq!(only_b.len(), 1);

        assert_eq!(dlq.purge_older_than(Utc::now() - ChronoDuration::hours(1)), 0);
        assert_eq!(dlq.purge_older_than(Utc::now() + ChronoDuration::seconds(1)), 2);
        assert!(dlq.is_empty());
    }
}
