//! Event Bus: fans out log lines, status changes, and metrics to
//! subscribers, keyed by event type.
//!
//! Grounded on `gglib-runtime/src/process/broadcaster.rs`'s
//! `ServerEventBroadcaster` (global-singleton-with-`subscribe()`-returns-
//! receiver shape) and `process/logs.rs`'s `RwLock<HashMap<...>>`
//! copy-on-write subscriber bookkeeping, but deliberately **not** built on
//! `tokio::sync::broadcast`: broadcast drops the slowest receiver's backlog
//! on overflow instead of applying backpressure to the publisher, which
//! violates section 4.7's "`Publish` blocks until queue space is below the
//! watermark" requirement. Each subscription instead gets its own bounded
//! `tokio::sync::mpsc` channel.

use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::mpsc;

use swapmux_core::events::{Event, EventKind};
use swapmux_core::ports::{EventPublisher, EventSubscription};

/// Default bound on a single subscriber's queue, per section 4.7.
pub const DEFAULT_QUEUE_WATERMARK: usize = 50_000;

struct Subscriber {
    kind: EventKind,
    tx: mpsc::Sender<Event>,
}

/// The Event Bus. Subscriptions are served by a dedicated bounded queue
/// each; `publish` applies backpressure by awaiting send permits on every
/// matching subscriber before returning, so a slow consumer throttles the
/// publisher rather than silently losing events.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    watermark: usize,
}

impl EventBus {
    #[must_use]
    pub fn new(watermark: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            watermark,
        }
    }

    /// Registers a new subscription for `kind`. Subscribe/unsubscribe take
    /// the write lock only to swap in a new `Vec`; readers (`publish`)
    /// never block behind a subscribe/unsubscribe call for longer than a
    /// vector clone.
    #[must_use]
    pub fn subscribe(&self, kind: EventKind) -> BusSubscription {
        let (tx, rx) = mpsc::channel(self.watermark);
        let mut subscribers = self.subscribers.write().expect("event bus lock poisoned");
        subscribers.push(Subscriber { kind, tx });
        BusSubscription { kind, rx }
    }

    /// Drops every subscriber whose sender has been closed (its
    /// `BusSubscription` was dropped). Called opportunistically from
    /// `publish` so dead SSE clients don't accumulate forever.
    fn reap_closed(&self) {
        let mut subscribers = self.subscribers.write().expect("event bus lock poisoned");
        subscribers.retain(|s| !s.tx.is_closed());
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event: Event) {
        let kind = event.kind();
        let targets: Vec<mpsc::Sender<Event>> = {
            let subscribers = self.subscribers.read().expect("event bus lock poisoned");
            subscribers
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| s.tx.clone())
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        for tx in targets {
            // A closed receiver just means the subscriber went away; that's
            // not a publish failure.
            let _ = tx.send(event.clone()).await;
        }
        self.reap_closed();
    }
}

/// A single subscription's receive half, returned by [`EventBus::subscribe`].
pub struct BusSubscription {
    kind: EventKind,
    rx: mpsc::Receiver<Event>,
}

#[async_trait]
impl EventSubscription for BusSubscription {
    async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    fn kind(&self) -> EventKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swapmux_core::events::{LogDataEvent, LogSource};

    #[tokio::test]
    async fn delivers_only_matching_kind() {
        let bus = EventBus::new(16);
        let mut log_sub = bus.subscribe(EventKind::LogData);
        let mut status_sub = bus.subscribe(EventKind::ModelStatus);

        bus.publish(Event::LogData(LogDataEvent {
            source: LogSource::Proxy,
            model_id: None,
            line: "hello".into(),
            timestamp_ms: 0,
        }))
        .await;

        let received = log_sub.recv().await;
        assert!(received.is_some());

        drop(log_sub);
        drop(status_sub.kind());
        // The ModelStatus subscriber never sees the LogData event: draining
        // it with a short timeout should find nothing.
        let empty = tokio::time::timeout(std::time::Duration::from_millis(20), status_sub.recv())
            .await
            .is_err();
        assert!(empty);
    }

    #[tokio::test]
    async fn fifo_per_publisher_subscriber_pair() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(EventKind::LogData);
        for i in 0..5 {
            bus.publish(Event::LogData(LogDataEvent {
                source: LogSource::Upstream,
                model_id: None,
                line: format!("line-{i}"),
                timestamp_ms: i,
            }))
            .await;
        }
        for i in 0..5 {
            let Some(Event::LogData(data)) = sub.recv().await else {
                panic!("expected LogData event");
            };
            assert_eq!(data.line, format!("line-{i}"));
        }
    }
}
