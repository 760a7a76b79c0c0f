use serde::{Deserialize, Serialize};

use crate::model::ModelInstanceState;

/// The log source tag carried on every [`Event::LogData`] entry, matching
/// the `source` field clients filter on when multiplexing `/api/events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Emitted by the proxy itself (request routing, admission, errors).
    Proxy,
    /// Tailed from an upstream child process's stdout/stderr.
    Upstream,
}

/// A model instance's state transition, as published to the Event Bus and
/// fanned out over `/api/events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatusEvent {
    pub model_id: String,
    pub state: ModelInstanceState,
    pub port: Option<u16>,
    pub updated_at_ms: u64,
}

/// A single tailed log line from either the proxy or an upstream process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDataEvent {
    pub source: LogSource,
    pub model_id: Option<String>,
    pub line: String,
    pub timestamp_ms: u64,
}

/// A completed request's metrics, published as it is inserted into the
/// Metrics Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub request_id: String,
    pub model_id: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub tokens_per_second: Option<f64>,
    pub duration_ms: u64,
}

/// Every payload shape the Event Bus carries. Tagged so subscribers (and
/// the SSE encoder) never need to guess a payload's type from context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Event {
    ModelStatus(ModelStatusEvent),
    LogData(LogDataEvent),
    Metrics(MetricsEvent),
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ModelStatus(_) => EventKind::ModelStatus,
            Self::LogData(_) => EventKind::LogData,
            Self::Metrics(_) => EventKind::Metrics,
        }
    }
}

/// The subscription key subscribers filter on; distinct from [`Event`] so a
/// subscriber can ask for "all `ModelStatus` events" without constructing a
/// dummy payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ModelStatus,
    LogData,
    Metrics,
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_status_round_trips_through_json() {
        let event = Event::ModelStatus(ModelStatusEvent {
            model_id: "llama-3".into(),
            state: ModelInstanceState::Ready,
            port: Some(5801),
            updated_at_ms: 1000,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "modelStatus");
        assert_eq!(json["data"]["modelId"], "llama-3");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), EventKind::ModelStatus);
    }

    #[test]
    fn log_data_tags_source() {
        let event = Event::LogData(LogDataEvent {
            source: LogSource::Upstream,
            model_id: Some("llama-3".into()),
            line: "loading model".into(),
            timestamp_ms: 1,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["data"]["source"], "upstream");
    }
}
