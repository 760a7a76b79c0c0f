use async_trait::async_trait;

use crate::events::{Event, EventKind};

/// The publish side of the Event Bus, as seen by anything that needs to
/// emit events (the Process Runner, the Swap Scheduler, the Metrics Store)
/// without depending on the bus's concrete subscriber-management
/// implementation.
///
/// `publish` blocks until the slowest subscriber interested in this event's
/// kind has queue space below the configured watermark — callers must not
/// assume this returns instantly.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event);
}

/// A receive-only view of one subscription, returned by the Event Bus's
/// `subscribe` method. Kept as a trait so callers in `swapmux-proxy` (the
/// SSE handler) don't need to name the bus's concrete queue type.
#[async_trait]
pub trait EventSubscription: Send {
    /// Awaits the next event for this subscription's kind, or `None` once
    /// the bus has been shut down and this subscription's queue has
    /// drained.
    async fn recv(&mut self) -> Option<Event>;

    fn kind(&self) -> EventKind;
}

/// A no-op publisher for tests and for components that run without an
/// Event Bus wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _event: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LogDataEvent, LogSource};

    #[tokio::test]
    async fn noop_publisher_accepts_anything() {
        let publisher = NoopPublisher;
        publisher
            .publish(Event::LogData(LogDataEvent {
                source: LogSource::Proxy,
                model_id: None,
                line: "hello".into(),
                timestamp_ms: 0,
            }))
            .await;
    }
}
