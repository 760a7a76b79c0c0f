//! Axum HTTP server: OpenAI-style routes forwarded through the Swap
//! Scheduler, the raw `/upstream/<model>/*` bypass, and the `/api/*`
//! management surface (section 6).
//!
//! Grounded on `gglib-proxy/src/server.rs` for the overall `Router`/
//! `ProxyState`/`axum::serve(...).with_graceful_shutdown(...)` shape.
//! Collapsed from that file's one-route-per-handler-function OpenAI surface
//! (it only ever proxied `/v1/chat/completions`) to a single
//! `openai_forward` handler shared by every OpenAI-style route, since they
//! differ only in which path segment gets forwarded verbatim to the
//! upstream.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use reqwest::Client;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use swapmux_core::SwapmuxError;
use swapmux_runtime::{EventBus, MetricsStore, SharedRegistry};

use crate::error::ApiError;
use crate::forward::{self, JsonForward, MultipartField, MultipartForward, OutgoingBody};
use crate::management;
use crate::models::{ModelInfo, ModelsResponse};
use crate::scan::Scanner;
use crate::sse;

/// Shared state every handler closes over. Cheap to clone: every field is
/// an `Arc` (or, for `reqwest::Client`, internally reference-counted).
#[derive(Clone)]
pub struct ProxyState {
    pub registry: Arc<SharedRegistry>,
    pub events: Arc<EventBus>,
    pub metrics: Arc<MetricsStore>,
    pub client: Client,
}

/// Builds the full router. Split from [`serve`] so tests can exercise
/// routes without binding a socket.
#[must_use]
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai_forward))
        .route("/v1/completions", post(openai_forward))
        .route("/v1/embeddings", post(openai_forward))
        .route("/v1/audio/speech", post(openai_forward))
        .route("/v1/audio/transcriptions", post(audio_transcriptions_forward))
        .route("/v1/rerank", post(openai_forward))
        .route("/v1/images/generations", post(openai_forward))
        .route("/v1/models", get(list_models))
        .route("/upstream/{model}/{*rest}", axum::routing::any(upstream_passthrough))
        .route("/api/models/", get(management::list_models))
        .route("/api/models/unload", post(management::unload_all))
        .route("/api/models/unload/{id}", post(management::unload_one))
        .route("/api/events", get(sse::events))
        .route("/api/captures/{id}", get(management::get_capture))
        .route("/api/version", get(management::version))
        .route("/health", get(management::health))
        .route("/", get(root))
        .with_state(state)
}

/// Starts serving on an already-bound listener, shutting down gracefully
/// when `cancel` fires.
pub async fn serve(listener: TcpListener, state: ProxyState, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let app = router(state);
    info!("proxy listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("proxy server shut down");
    Ok(())
}

async fn root() -> &'static str {
    "swapmux"
}

async fn list_models(State(state): State<ProxyState>) -> Json<ModelsResponse> {
    let registry = state.registry.current();
    let mut data: Vec<ModelInfo> = registry
        .config
        .models
        .values()
        .filter(|model| !model.unlisted)
        .map(|model| ModelInfo::new(model.id.clone(), 0))
        .collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));
    Json(ModelsResponse::new(data))
}

/// Drains the next data frame out of an in-flight request/response body,
/// skipping trailer frames. `None` means the body is exhausted.
async fn next_data_frame(body: &mut Body) -> Result<Option<Bytes>, ApiError> {
    loop {
        match body.frame().await {
            None => return Ok(None),
            Some(Err(error)) => return Err(SwapmuxError::BadRequestBody(error.to_string()).into()),
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    return Ok(Some(data));
                }
                // trailer frame; keep draining for the next data frame.
            }
        }
    }
}

/// JSON-escapes `value` the way `serde_json` would inside a string literal
/// (quotes and control characters), without the surrounding quotes --
/// callers splice it directly between the quotes already in the buffer.
fn json_escaped(value: &str) -> String {
    let quoted = serde_json::to_string(value).unwrap_or_default();
    quoted
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_string()
}

/// Shared by every `/v1/*` OpenAI-style route except
/// `/v1/audio/transcriptions` (multipart, see [`audio_transcriptions_forward`]):
/// the only difference between them is which path the upstream expects, and
/// `uri.path()` already tells us that verbatim.
///
/// Scans only up to [`crate::scan::SCAN_LOOKAHEAD_CAP`] bytes of the request
/// body to find `model`/`stream` (section 9's anti-buffering design note)
/// rather than parsing the whole document into a `serde_json::Value`. When
/// the resolved model needs neither `strip_fields` nor capture -- the common
/// case -- the scanned prefix (with `model` spliced to the physical model
/// id) is forwarded together with whatever of the body the scan didn't
/// consume, as a stream, without ever materializing the full body. Only
/// when the model configures `filters.stripFields` or `capture` (both of
/// which need the whole document) does this fall back to draining the rest
/// of the body and rewriting it as a `Value`, same as before.
async fn openai_forward(
    State(state): State<ProxyState>,
    uri: Uri,
    headers: HeaderMap,
    mut body: Body,
) -> Result<Response, ApiError> {
    let mut scanner = Scanner::new();
    let mut reached_eof = false;
    loop {
        let Some(chunk) = next_data_frame(&mut body).await? else {
            reached_eof = true;
            break;
        };
        if scanner.feed(&chunk) {
            break;
        }
    }

    let requested_name = scanner
        .model
        .clone()
        .ok_or_else(|| SwapmuxError::BadRequestBody("missing \"model\" field".to_string()))?;
    let is_streaming = scanner.stream;

    let ctx = CancellationToken::new();
    let registry = state.registry.current();
    let resolution = swapmux_runtime::resolve(&registry, &requested_name, &ctx).await?;
    let instance = registry
        .instance(&resolution.model_id)
        .expect("resolve() only returns ids backed by a registry instance");
    let strip_fields = instance.config().filters.strip_fields.clone();
    let capture = instance.config().capture;

    let outgoing_body = if strip_fields.is_empty() && !capture {
        let (start, end) = scanner
            .model_value_range
            .expect("scanner recorded a model string value whenever `model` is Some");
        let prefix = scanner.buffer();
        let mut head = BytesMut::with_capacity(prefix.len() + resolution.outgoing_model_name.len());
        head.extend_from_slice(&prefix[..start]);
        head.extend_from_slice(json_escaped(&resolution.outgoing_model_name).as_bytes());
        head.extend_from_slice(&prefix[end..]);
        let head = head.freeze();

        if reached_eof {
            OutgoingBody::Buffered(head)
        } else {
            let tail_stream = async_stream::stream! {
                let mut body = body;
                yield Ok::<Bytes, std::io::Error>(head);
                loop {
                    match next_data_frame(&mut body).await {
                        Ok(Some(chunk)) => yield Ok(chunk),
                        Ok(None) => break,
                        Err(_) => {
                            yield Err(std::io::Error::other("request body stream error"));
                            break;
                        }
                    }
                }
            };
            OutgoingBody::Streamed(reqwest::Body::wrap_stream(tail_stream))
        }
    } else {
        let mut buf = BytesMut::from(scanner.buffer());
        if !reached_eof {
            while let Some(chunk) = next_data_frame(&mut body).await? {
                buf.extend_from_slice(&chunk);
            }
        }
        let mut value: Value =
            serde_json::from_slice(&buf).map_err(|error| SwapmuxError::BadRequestBody(error.to_string()))?;
        if let Some(map) = value.as_object_mut() {
            map.insert("model".to_string(), Value::String(resolution.outgoing_model_name));
        }
        forward::strip_fields(&mut value, &strip_fields);
        OutgoingBody::Buffered(Bytes::from(serde_json::to_vec(&value).unwrap_or_default()))
    };

    let base_url = forward::base_url_for(instance)
        .await
        .ok_or(SwapmuxError::UpstreamDisconnect)?;
    let url = format!("{base_url}{}", uri.path());

    Ok(forward::forward_json(JsonForward {
        client: &state.client,
        url,
        headers: &headers,
        body: outgoing_body,
        is_streaming,
        model_id: resolution.model_id,
        capture,
        capture_max_bytes: registry.config.capture_max_bytes,
        metrics: &state.metrics,
        lease: resolution.lease,
    })
    .await)
}

/// `/v1/audio/transcriptions`: the only OpenAI-style route whose request
/// body is `multipart/form-data` (audio file plus a `model` field) rather
/// than JSON (section 6). Reads every field via axum's `Multipart`
/// extractor, resolves `model` the same way every other route does, then
/// re-encodes the fields (with `model` rewritten to the physical model id)
/// into a fresh multipart body for the upstream request.
async fn audio_transcriptions_forward(
    State(state): State<ProxyState>,
    uri: Uri,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut fields = Vec::new();
    let mut requested_name = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| SwapmuxError::BadRequestBody(error.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(ToString::to_string);
        let content_type = field.content_type().map(ToString::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|error| SwapmuxError::BadRequestBody(error.to_string()))?;
        if name == "model" {
            requested_name = Some(String::from_utf8_lossy(&bytes).into_owned());
        }
        fields.push(MultipartField { name, file_name, content_type, bytes });
    }
    let requested_name =
        requested_name.ok_or_else(|| SwapmuxError::BadRequestBody("missing \"model\" field".to_string()))?;

    let ctx = CancellationToken::new();
    let registry = state.registry.current();
    let resolution = swapmux_runtime::resolve(&registry, &requested_name, &ctx).await?;
    let instance = registry
        .instance(&resolution.model_id)
        .expect("resolve() only returns ids backed by a registry instance");

    for field in &mut fields {
        if field.name == "model" {
            field.bytes = Bytes::from(resolution.outgoing_model_name.clone());
        }
    }

    let base_url = forward::base_url_for(instance)
        .await
        .ok_or(SwapmuxError::UpstreamDisconnect)?;
    let url = format!("{base_url}{}", uri.path());

    Ok(forward::forward_multipart(MultipartForward {
        client: &state.client,
        url,
        headers: &headers,
        fields,
        model_id: resolution.model_id,
        lease: resolution.lease,
    })
    .await)
}

async fn upstream_passthrough(
    State(state): State<ProxyState>,
    axum::extract::Path((model, rest)): axum::extract::Path<(String, String)>,
    method: axum::http::Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let ctx = CancellationToken::new();
    let registry = state.registry.current();
    let resolution = swapmux_runtime::resolve(&registry, &model, &ctx).await?;
    let instance = registry
        .instance(&resolution.model_id)
        .expect("resolve() only returns ids backed by a registry instance");
    let base_url = forward::base_url_for(instance)
        .await
        .ok_or(SwapmuxError::UpstreamDisconnect)?;

    Ok(forward::forward_raw(
        &state.client,
        &base_url,
        &rest,
        uri.query(),
        method,
        &headers,
        body,
        resolution.lease,
    )
    .await)
}
