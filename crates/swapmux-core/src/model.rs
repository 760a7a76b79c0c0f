use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Request-body fields to strip before forwarding to an upstream that does
/// not understand them (e.g. sampler knobs a particular backend rejects).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRules {
    /// Top-level JSON field names removed from the request body.
    #[serde(default)]
    pub strip_fields: Vec<String>,
}

/// The normalized, validated shape of a single model entry. Distinct from
/// the raw YAML document shape (`RawModelConfig` in `config.rs`) so the
/// wire format and the in-memory model can evolve independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub id: String,
    /// Shell command template, e.g. `llama-server --port ${PORT} -m model.gguf`.
    /// `None` when `proxy_url` names an already-running upstream instead.
    pub cmd: Option<String>,
    pub cmd_stop: Option<String>,
    /// Explicit upstream base URL, bypassing the Process Runner entirely.
    pub proxy_url: Option<String>,
    pub health_endpoint: String,
    pub aliases: Vec<String>,
    pub env: HashMap<String, String>,
    pub unload_after_secs: u64,
    pub concurrency_limit: usize,
    pub unlisted: bool,
    pub group: String,
    pub filters: FilterRules,
    pub capture: bool,
    pub use_model_name: Option<String>,
}

impl ModelConfig {
    /// Whether this model requires the Process Runner at all, or is just a
    /// named pointer at an externally-managed upstream.
    #[must_use]
    pub const fn is_managed(&self) -> bool {
        self.cmd.is_some()
    }
}

/// The normalized shape of a named group. Every model belongs to exactly
/// one group, including the synthetic `(default)` group materialized for
/// models that name none explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub name: String,
    pub members: Vec<String>,
    pub swap: bool,
    pub exclusive: bool,
    pub persistent: bool,
}

/// The name of the group synthesized for models that do not name one.
pub const DEFAULT_GROUP: &str = "(default)";

impl GroupConfig {
    #[must_use]
    pub fn default_group(members: Vec<String>) -> Self {
        Self {
            name: DEFAULT_GROUP.to_string(),
            members,
            swap: true,
            exclusive: true,
            persistent: false,
        }
    }
}

/// The five states in the process lifecycle, plus the terminal `shutdown`
/// state reachable from any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelInstanceState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Shutdown,
}

impl ModelInstanceState {
    /// A port is held by the instance in exactly these states.
    #[must_use]
    pub const fn holds_port(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Stopping)
    }

    /// Whether this state still accepts new requests from the Swap
    /// Scheduler's resolution loop (`stopped`/`starting` trigger an
    /// `EnsureRunning`; `ready` can be leased directly).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// One completed (or in-flight, while being recorded) request, as stored in
/// the Metrics Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub timestamp_ms: u64,
    pub model_id: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub tokens_per_second: Option<f64>,
    pub duration_ms: u64,
    pub captured: bool,
}

/// Request/response headers and bodies captured for a single
/// [`RequestRecord`], keyed by that record's id. Bounded in size per side by
/// `captureMaxBytes`; dropped (clearing `RequestRecord::captured`) if either
/// side exceeds the cap rather than truncated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturePayload {
    pub request_headers: Vec<(String, String)>,
    pub request_body_base64: String,
    pub response_headers: Vec<(String, String)>,
    pub response_body_base64: String,
}
