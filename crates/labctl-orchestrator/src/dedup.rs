//! Command deduplication by `req_id`.
//!
//! A command is a duplicate when a request with the same `req_id`, module
//! and action was seen within the TTL and did not fail. Entries are kept in
//! LRU order and the oldest are evicted past `max_size`.

use crate::config::DedupConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Processing,
    Completed,
    Failed,
}

/// Result of [`RequestDeduplicator::check_and_mark`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// First sighting; the request is now marked as processing.
    Fresh,
    /// Seen before in the given state. Drop it.
    Duplicate(RequestState),
}

#[derive(Debug, Clone)]
struct Record {
    module: String,
    action: String,
    state: RequestState,
    updated_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct Cache {
    records: HashMap<String, Record>,
    /// LRU order: lowest sequence is least recently used.
    order: BTreeMap<u64, String>,
    next_seq: u64,
    duplicates: u64,
}

impl Cache {
    fn touch(&mut self, req_id: &str) {
        let seq = self.next_seq;
        if let Some(record) = self.records.get_mut(req_id) {
            self.order.remove(&record.seq);
            record.seq = seq;
            self.order.insert(seq, req_id.to_string());
            self.next_seq += 1;
        }
    }

    fn remove(&mut self, req_id: &str) {
        if let Some(record) = self.records.remove(req_id) {
            self.order.remove(&record.seq);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub cached: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub duplicates_dropped: u64,
    pub max_size: usize,
    pub ttl_secs: u64,
}

pub struct RequestDeduplicator {
    ttl: ChronoDuration,
    ttl_secs: u64,
    max_size: usize,
    cache: Mutex<Cache>,
}

impl RequestDeduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            ttl: i64::try_from(config.ttl_secs)
                .ok()
                .and_then(ChronoDuration::try_seconds)
                .unwrap_or(ChronoDuration::MAX),
            ttl_secs: config.ttl_secs,
            max_size: config.max_size.max(1),
            cache: Mutex::new(Cache::default()),
        }
    }

    pub fn check_and_mark(&self, req_id: &str, module: &str, action: &str) -> DedupDecision {
        self.check_and_mark_at(req_id, module, action, Utc::now())
    }

    /// Check a request and mark it as processing when it is fresh.
    pub fn check_and_mark_at(
        &self,
        req_id: &str,
        module: &str,
        action: &str,
        now: DateTime<Utc>,
    ) -> DedupDecision {
        let mut cache = self.cache.lock();
        self.expire(&mut cache, now);

        if let Some(record) = cache.records.get(req_id) {
            let same_request = record.module == module && record.action == action;
            let state = record.state;
            if same_request && state != RequestState::Failed {
                cache.duplicates += 1;
                cache.touch(req_id);
                return DedupDecision::Duplicate(state);
            }
            if !same_request {
                tracing::warn!(
                    category = "router",
                    req_id,
                    module,
                    action,
                    "req_id reused for a different request"
                );
            }
            cache.remove(req_id);
        }

        let seq = cache.next_seq;
        cache.next_seq += 1;
        cache.records.insert(
            req_id.to_string(),
            Record {
                module: module.to_string(),
                action: action.to_string(),
                state: RequestState::Processing,
                updated_at: now,
                seq,
            },
        );
        cache.order.insert(seq, req_id.to_string());

        while cache.records.len() > self.max_size {
            let Some((_, oldest)) = cache.order.pop_first() else {
                break;
            };
            cache.records.remove(&oldest);
        }
        DedupDecision::Fresh
    }

    pub fn mark_completed(&self, req_id: &str) {
        self.finish(req_id, RequestState::Completed, Utc::now());
    }

    /// A failed request may be submitted again with the same `req_id`.
    pub fn mark_failed(&self, req_id: &str) {
        self.finish(req_id, RequestState::Failed, Utc::now());
    }

    fn finish(&self, req_id: &str, state: RequestState, now: DateTime<Utc>) {
        let mut cache = self.cache.lock();
        if let Some(record) = cache.records.get_mut(req_id) {
            record.state = state;
            record.updated_at = now;
            cache.touch(req_id);
        }
    }

    pub fn state(&self, req_id: &str) -> Option<RequestState> {
        self.cache.lock().records.get(req_id).map(|r| r.state)
    }

    pub fn clear(&self) {
        let mut cache = self.cache.lock();
        cache.records.clear();
        cache.order.clear();
    }

    pub fn stats(&self) -> DedupStats {
        let cache = self.cache.lock();
        let mut stats = DedupStats {
            cached: cache.records.len(),
            duplicates_dropped: cache.duplicates,
            max_size: self.max_size,
            ttl_secs: self.ttl_secs,
            ..DedupStats::default()
        };
        for record in cache.records.values() {
            match record.state {
                RequestState::Processing => stats.processing += 1,
                RequestState::Completed => stats.completed += 1,
                RequestState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    // Walks from the least recently used end and stops at the first live entry.
    fn expire(&self, cache: &mut Cache, now: DateTime<Utc>) {
        loop {
            let Some((&seq, req_id)) = cache.order.first_key_value() else {
                return;
            };
            let expired = cache
                .records
                .get(req_id)
                .is_none_or(|r| now - r.updated_at > self.ttl);
            if !expired {
                return;
            }
            let req_id = req_id.clone();
            cache.order.remove(&seq);
            cache.records.remove(&req_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup(ttl_secs: u64, max_size: usize) -> RequestDeduplicator {
        RequestDeduplicator::new(&DedupConfig {
            enabled: true,
            ttl_secs,
            max_size,
        })
    }

    #[test]
    fn test_duplicate_within_ttl() {
        let dedup = dedup(300, 100);
        let t0 = Utc::now();

        assert_eq!(dedup.check_and_mark_at("r1", "proj", "start", t0), DedupDecision::Fresh);
        assert_eq!(
            dedup.check_and_mark_at("r1", "proj", "start", t0),
            DedupDecision::Duplicate(RequestState::Processing)
        );
        dedup.mark_completed("r1");
        assert_eq!(
            dedup.check_and_mark_at("r1", "proj", "start", t0 + ChronoDuration::seconds(10)),
            DedupDecision::Duplicate(RequestState::Completed)
        );
        assert_eq!(dedup.stats().duplicates_dropped, 2);
    }

    #[test]
    fn test_expired_and_failed_requests_pass_again() {
        let dedup = dedup(60, 100);
        let t0 = Utc::now();

        dedup.check_and_mark_at("r1", "proj", "start", t0);
        assert_eq!(
            dedup.check_and_mark_at("r1", "proj", "start", t0 + ChronoDuration::seconds(61)),
            DedupDecision::Fresh
        );

        dedup.mark_failed("r1");
        assert_eq!(dedup.state("r1"), Some(RequestState::Failed));
        assert_eq!(dedup.check_and_mark("r1", "proj", "start"), DedupDecision::Fresh);
    }

    #[test]
    fn test_same_id_different_request_is_fresh() {
        let dedup = dedup(300, 100);
        dedup.check_and_mark("r1", "proj", "start");
        assert_eq!(dedup.check_and_mark("r1", "proj", "stop"), DedupDecision::Fresh);
        assert_eq!(dedup.check_and_mark("r1", "scope", "stop"), DedupDecision::Fresh);
        assert_eq!(dedup.stats().cached, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let dedup = dedup(300, 2);
        let t0 = Utc::now();
        dedup.check_and_mark_at("a", "m", "x", t0);
        dedup.check_and_mark_at("b", "m", "x", t0);
        // Touching "a" makes "b" the eviction candidate.
        dedup.check_and_mark_at("a", "m", "x", t0);
        dedup.check_and_mark_at("c", "m", "x", t0);

        assert!(dedup.state("a").is_some());
        assert!(dedup.state("b").is_none());
        assert!(dedup.state("c").is_some());
        assert_eq!(dedup.stats().cached, 2);
    }
}
