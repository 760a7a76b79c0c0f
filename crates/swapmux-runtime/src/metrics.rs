//! Metrics Store: a bounded ring of per-request records plus capture
//! lookup, with a live feed onto the Event Bus.
//!
//! Grounded on `gglib-runtime/src/process/logs.rs`'s `LogBuffer`
//! (`VecDeque` that pops the front once at capacity), generalized from log
//! lines to [`RequestRecord`]s plus a side table of [`CapturePayload`]s
//! evicted in lockstep.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::RwLock;

use swapmux_core::events::{Event, MetricsEvent};
use swapmux_core::ports::EventPublisher;
use swapmux_core::{CapturePayload, RequestRecord};

struct Ring {
    records: VecDeque<RequestRecord>,
    captures: HashMap<String, CapturePayload>,
    capacity: usize,
}

/// Bounded ordered sequence of [`RequestRecord`]; inserts at the tail,
/// evicts the oldest on overflow. Owns its ring outright per section 3's
/// ownership note (no shared mutation from outside this type).
pub struct MetricsStore {
    ring: RwLock<Ring>,
    events: Arc<dyn EventPublisher>,
}

impl MetricsStore {
    #[must_use]
    pub fn new(capacity: usize, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            ring: RwLock::new(Ring {
                records: VecDeque::with_capacity(capacity),
                captures: HashMap::new(),
                capacity,
            }),
            events,
        }
    }

    /// Inserts a completed request's record (and, if present, its capture
    /// payload), evicting the oldest entry when at capacity, and publishes
    /// a [`MetricsEvent`] onto the Event Bus.
    pub async fn insert(&self, record: RequestRecord, capture: Option<CapturePayload>) {
        let metrics_event = MetricsEvent {
            request_id: record.id.clone(),
            model_id: record.model_id.clone(),
            prompt_tokens: record.prompt_tokens,
            completion_tokens: record.completion_tokens,
            tokens_per_second: record.tokens_per_second,
            duration_ms: record.duration_ms,
        };
        {
            let mut ring = self.ring.write().expect("metrics store lock poisoned");
            if ring.records.len() >= ring.capacity {
                if let Some(evicted) = ring.records.pop_front() {
                    ring.captures.remove(&evicted.id);
                }
            }
            if let Some(payload) = capture {
                ring.captures.insert(record.id.clone(), payload);
            }
            ring.records.push_back(record);
        }
        self.events.publish(Event::Metrics(metrics_event)).await;
    }

    /// Returns the most recent records, oldest first, for `/api/models`-
    /// adjacent listing endpoints.
    #[must_use]
    pub fn list(&self) -> Vec<RequestRecord> {
        self.ring
            .read()
            .expect("metrics store lock poisoned")
            .records
            .iter()
            .cloned()
            .collect()
    }

    /// Looks up a retained capture by its record id. Returns `None` both
    /// when the id is unknown and when its capture was dropped for
    /// exceeding `captureMaxBytes` (the record's `captured` flag already
    /// tells the caller which case applies).
    #[must_use]
    pub fn get_capture(&self, id: &str) -> Option<CapturePayload> {
        self.ring
            .read()
            .expect("metrics store lock poisoned")
            .captures
            .get(id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swapmux_core::ports::NoopPublisher;

    fn record(id: &str) -> RequestRecord {
        RequestRecord {
            id: id.to_string(),
            timestamp_ms: 0,
            model_id: "m".to_string(),
            prompt_tokens: Some(10),
            completion_tokens: Some(20),
            tokens_per_second: Some(5.0),
            duration_ms: 100,
            captured: false,
        }
    }

    #[tokio::test]
    async fn evicts_oldest_at_capacity() {
        let store = MetricsStore::new(2, Arc::new(NoopPublisher));
        store.insert(record("a"), None).await;
        store.insert(record("b"), None).await;
        store.insert(record("c"), None).await;
        let ids: Vec<_> = store.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn eviction_drops_the_matching_capture() {
        let store = MetricsStore::new(1, Arc::new(NoopPublisher));
        let payload = CapturePayload {
            request_headers: vec![],
            request_body_base64: String::new(),
            response_headers: vec![],
            response_body_base64: String::new(),
        };
        store.insert(record("a"), Some(payload)).await;
        assert!(store.get_capture("a").is_some());
        store.insert(record("b"), None).await;
        assert!(store.get_capture("a").is_none());
    }
}
