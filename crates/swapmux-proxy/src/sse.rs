//! `GET /api/events`: SSE multiplex of `modelStatus`, `logData`, and
//! `metrics` envelopes (section 6), with a 30s keep-alive comment.
//!
//! Grounded on `gglib-axum/src/sse.rs`'s `Sse::new(stream).keep_alive(...)`
//! shape. That broadcaster fans a single `tokio::sync::broadcast::Sender`
//! out to every client; here each client instead opens three independent
//! [`swapmux_runtime::EventBus`] subscriptions (one per [`EventKind`]) and
//! merges them, since the bus hands out a dedicated bounded queue per
//! subscription rather than one shared ring.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_core::Stream;

use swapmux_core::events::{Event, EventKind};
use swapmux_core::ports::EventSubscription;

use crate::server::ProxyState;

fn encode(event: &Event) -> Option<SseEvent> {
    serde_json::to_string(event)
        .map(|json| SseEvent::default().data(json))
        .ok()
}

pub async fn events(
    State(state): State<ProxyState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static> {
    let mut status_sub = state.events.subscribe(EventKind::ModelStatus);
    let mut log_sub = state.events.subscribe(EventKind::LogData);
    let mut metrics_sub = state.events.subscribe(EventKind::Metrics);

    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                Some(event) = status_sub.recv() => {
                    if let Some(frame) = encode(&event) {
                        yield Ok(frame);
                    }
                }
                Some(event) = log_sub.recv() => {
                    if let Some(frame) = encode(&event) {
                        yield Ok(frame);
                    }
                }
                Some(event) = metrics_sub.recv() => {
                    if let Some(frame) = encode(&event) {
                        yield Ok(frame);
                    }
                }
                else => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("ping"))
}
