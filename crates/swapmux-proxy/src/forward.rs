//! Forwarding to the upstream selected by the Swap Scheduler: header
//! filtering, JSON body rewriting, streaming/non-streaming response
//! branching, SSE token-usage scanning, and the capture tee.
//!
//! Grounded on `gglib-proxy/src/forward.rs` for the hop-by-hop header list
//! and the streaming/non-streaming branch shape. Departs from it in one
//! deliberate way: that file strips `authorization` before forwarding to
//! llama-server; this proxy forwards it verbatim, since bearer tokens are
//! meant to reach the upstream unchanged rather than be swallowed here.
//! The SSE scanner and capture tee have no teacher counterpart and are
//! built new on top of the same `bytes_stream()` passthrough.

use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, error};

use swapmux_core::{CapturePayload, RequestRecord, SwapmuxError};
use swapmux_runtime::{Lease, MetricsStore, ModelInstance};

use crate::error::ApiError;

/// Headers that must never be forwarded to the upstream as-is. Does **not**
/// include `authorization`: per section 1, bearer tokens pass through.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn should_forward_header(name: &str) -> bool {
    !HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

fn forwardable_header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| should_forward_header(name.as_str()))
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

/// The upstream base URL for a ready instance: its configured `proxyUrl` if
/// it has one, otherwise `http://127.0.0.1:<leased port>`. `None` only when
/// called against an instance that is not currently holding a port (should
/// not happen for a `Lease` obtained through the Swap Scheduler).
pub async fn base_url_for(instance: &ModelInstance) -> Option<String> {
    if let Some(url) = &instance.config().proxy_url {
        return Some(url.trim_end_matches('/').to_string());
    }
    instance.port().await.map(|port| format!("http://127.0.0.1:{port}"))
}

/// Removes the given top-level fields from a JSON request body (section
/// 4.6's request filters, e.g. dropping sampler knobs an upstream rejects).
pub fn strip_fields(body: &mut Value, fields: &[String]) {
    if fields.is_empty() {
        return;
    }
    if let Some(map) = body.as_object_mut() {
        for field in fields {
            map.remove(field);
        }
    }
}

/// Incrementally scans `data: {...}` SSE frames for token usage and timing
/// fields without holding the full response body in memory (design note:
/// "SSE parsing for metrics must tolerate partial frames and the terminal
/// `data: [DONE]` sentinel").
#[derive(Default)]
struct SseMetricsScanner {
    buf: Vec<u8>,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    tokens_per_second: Option<f64>,
}

impl SseMetricsScanner {
    fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.scan_line(&line);
        }
    }

    fn scan_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let Some(payload) = line.trim_end().strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        if let Some(usage) = value.get("usage") {
            if let Some(tokens) = usage.get("prompt_tokens").and_then(Value::as_u64) {
                self.prompt_tokens = Some(tokens);
            }
            if let Some(tokens) = usage.get("completion_tokens").and_then(Value::as_u64) {
                self.completion_tokens = Some(tokens);
            }
        }
        if let Some(timings) = value.get("timings") {
            if let Some(tps) = timings.get("predicted_per_second").and_then(Value::as_f64) {
                self.tokens_per_second = Some(tps);
            }
        }
    }
}

/// Accumulates both sides of a request/response pair up to a size cap,
/// clearing itself (and reporting `overflowed`) the moment either side
/// would exceed it rather than truncating (section 4.6, section 9(c)).
struct CaptureAccumulator {
    max_bytes: usize,
    request_headers: Vec<(String, String)>,
    request_body: Vec<u8>,
    response_headers: Vec<(String, String)>,
    response_body: Vec<u8>,
    overflowed: bool,
}

impl CaptureAccumulator {
    fn new(max_bytes: usize, request_headers: Vec<(String, String)>, request_body: &[u8]) -> Self {
        let overflowed = request_body.len() > max_bytes;
        Self {
            max_bytes,
            request_headers,
            request_body: if overflowed { Vec::new() } else { request_body.to_vec() },
            response_headers: Vec::new(),
            response_body: Vec::new(),
            overflowed,
        }
    }

    fn set_response_headers(&mut self, headers: Vec<(String, String)>) {
        self.response_headers = headers;
    }

    fn push_response(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.response_body.len() + chunk.len() > self.max_bytes {
            self.overflowed = true;
            self.response_body.clear();
            return;
        }
        self.response_body.extend_from_slice(chunk);
    }

    fn finish(self) -> Option<CapturePayload> {
        if self.overflowed {
            return None;
        }
        let engine = base64::engine::general_purpose::STANDARD;
        Some(CapturePayload {
            request_headers: self.request_headers,
            request_body_base64: engine.encode(&self.request_body),
            response_headers: self.response_headers,
            response_body_base64: engine.encode(&self.response_body),
        })
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// The outgoing request body for [`forward_json`]. Most requests take the
/// `Buffered` path (the whole, already-rewritten JSON document); the
/// streaming-scanner splice path in `server::openai_forward` uses `Streamed`
/// for the rare document too large to fit the scanner's lookahead cap, so
/// the unread remainder is relayed without ever being buffered here.
pub enum OutgoingBody {
    Buffered(Bytes),
    Streamed(reqwest::Body),
}

/// Everything needed to forward one already-resolved, already-rewritten
/// JSON request and record its outcome.
pub struct JsonForward<'a> {
    pub client: &'a Client,
    pub url: String,
    pub headers: &'a HeaderMap,
    pub body: OutgoingBody,
    pub is_streaming: bool,
    pub model_id: String,
    pub capture: bool,
    pub capture_max_bytes: usize,
    pub metrics: &'a MetricsStore,
    pub lease: Lease,
}

/// Sends the request and branches into the streaming or buffered response
/// path, recording a [`RequestRecord`] (and optional capture) either way.
///
/// Request-body capture only ever runs against `OutgoingBody::Buffered`:
/// capture and the streaming-splice path are mutually exclusive by
/// construction (`server::openai_forward` only takes the splice path when
/// the resolved model has capture disabled), so a `Streamed` body simply
/// captures as empty rather than needing a mid-stream tee.
pub async fn forward_json(params: JsonForward<'_>) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let started = Instant::now();
    let forwarded_headers = forwardable_header_pairs(params.headers);
    let capture_sample: &[u8] = match &params.body {
        OutgoingBody::Buffered(bytes) => bytes,
        OutgoingBody::Streamed(_) => &[],
    };
    let mut capture = params
        .capture
        .then(|| CaptureAccumulator::new(params.capture_max_bytes, forwarded_headers.clone(), capture_sample));

    let mut builder = params.client.post(&params.url).header("content-type", "application/json");
    for (name, value) in &forwarded_headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let outgoing_body = match params.body {
        OutgoingBody::Buffered(bytes) => reqwest::Body::from(bytes),
        OutgoingBody::Streamed(body) => body,
    };

    let response = match builder.body(outgoing_body).send().await {
        Ok(response) => response,
        Err(error) => {
            error!(model_id = %params.model_id, %error, "failed to reach upstream");
            return ApiError(SwapmuxError::UpstreamDisconnect).into_response();
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let response_headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    if let Some(acc) = capture.as_mut() {
        acc.set_response_headers(response_headers.clone());
    }
    let content_type = response
        .headers()
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| axum::http::HeaderValue::from_static("application/json"));

    if !status.is_success() {
        let bytes = response.bytes().await.unwrap_or_default();
        drop(params.lease);
        return Response::builder()
            .status(status)
            .header("content-type", content_type)
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    if params.is_streaming {
        debug!(model_id = %params.model_id, request_id = %request_id, "streaming response from upstream");
        let metrics = params.metrics;
        let body_stream = async_stream::stream! {
            let _lease = params.lease;
            let mut scanner = SseMetricsScanner::default();
            let mut capture = capture;
            let mut upstream = response.bytes_stream();
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(bytes) => {
                        scanner.feed(&bytes);
                        if let Some(acc) = capture.as_mut() {
                            acc.push_response(&bytes);
                        }
                        yield Ok::<Bytes, std::io::Error>(bytes);
                    }
                    Err(error) => {
                        yield Err(std::io::Error::other(error));
                        break;
                    }
                }
            }
            let captured = capture.as_ref().is_some_and(|acc| !acc.overflowed);
            let record = RequestRecord {
                id: request_id.clone(),
                timestamp_ms: now_ms(),
                model_id: params.model_id.clone(),
                prompt_tokens: scanner.prompt_tokens,
                completion_tokens: scanner.completion_tokens,
                tokens_per_second: scanner.tokens_per_second,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                captured,
            };
            metrics.insert(record, capture.and_then(CaptureAccumulator::finish)).await;
        };
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .header("x-accel-buffering", "no")
            .body(Body::from_stream(body_stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    } else {
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(error) => {
                error!(model_id = %params.model_id, %error, "upstream disconnected mid-response");
                drop(params.lease);
                return ApiError(SwapmuxError::UpstreamDisconnect).into_response();
            }
        };
        let usage = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|value| value.get("usage").cloned());
        let (prompt_tokens, completion_tokens) = usage
            .map(|usage| {
                (
                    usage.get("prompt_tokens").and_then(Value::as_u64),
                    usage.get("completion_tokens").and_then(Value::as_u64),
                )
            })
            .unwrap_or((None, None));
        if let Some(acc) = capture.as_mut() {
            acc.push_response(&bytes);
        }
        let captured = capture.as_ref().is_some_and(|acc| !acc.overflowed);
        let record = RequestRecord {
            id: request_id,
            timestamp_ms: now_ms(),
            model_id: params.model_id,
            prompt_tokens,
            completion_tokens,
            tokens_per_second: None,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            captured,
        };
        params.metrics.insert(record, capture.and_then(CaptureAccumulator::finish)).await;
        drop(params.lease);
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", content_type)
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Raw passthrough for `/upstream/<model>/*`: method, headers, and body are
/// forwarded verbatim with no JSON rewriting, filtering, or metrics/capture
/// bookkeeping (section 6: "bypassing JSON rewriting").
pub async fn forward_raw(
    client: &Client,
    base_url: &str,
    rest_of_path: &str,
    query: Option<&str>,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
    lease: Lease,
) -> Response {
    let mut url = format!("{base_url}/{rest_of_path}");
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut builder = client.request(reqwest_method, &url);
    for (name, value) in headers.iter() {
        if should_forward_header(name.as_str())
            && let Ok(value_str) = value.to_str()
        {
            builder = builder.header(name.as_str(), value_str);
        }
    }

    let response = match builder.body(body).send().await {
        Ok(response) => response,
        Err(error) => {
            drop(lease);
            error!(%error, "upstream passthrough request failed");
            return ApiError(SwapmuxError::UpstreamDisconnect).into_response();
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| axum::http::HeaderValue::from_static("application/octet-stream"));
    let body_stream = async_stream::stream! {
        let _lease = lease;
        let mut upstream = response.bytes_stream();
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => yield Ok::<Bytes, std::io::Error>(bytes),
                Err(error) => {
                    yield Err(std::io::Error::other(error));
                    break;
                }
            }
        }
    };
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// One field of a parsed `multipart/form-data` request, captured as an
/// owned value so the handler can rewrite the `model` field before
/// re-encoding the form for the upstream request.
pub struct MultipartField {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Everything needed to re-encode and forward a parsed multipart request
/// (section 6: `/v1/audio/transcriptions`).
pub struct MultipartForward<'a> {
    pub client: &'a Client,
    pub url: String,
    pub headers: &'a HeaderMap,
    pub fields: Vec<MultipartField>,
    pub model_id: String,
    pub lease: Lease,
}

/// Re-encodes the already-rewritten fields into a fresh multipart body and
/// forwards it upstream. Mirrors [`forward_raw`]'s scope, not
/// [`forward_json`]'s: no streaming response, no SSE/token-usage scanning,
/// no capture -- transcription responses are a single JSON object and this
/// route carries no token-usage fields to scan for.
pub async fn forward_multipart(params: MultipartForward<'_>) -> Response {
    let mut form = reqwest::multipart::Form::new();
    for field in params.fields {
        let mut part = reqwest::multipart::Part::bytes(field.bytes.to_vec());
        if let Some(file_name) = field.file_name {
            part = part.file_name(file_name);
        }
        if let Some(content_type) = field.content_type
            && let Ok(with_mime) = part.mime_str(&content_type)
        {
            part = with_mime;
        }
        form = form.part(field.name, part);
    }

    let mut builder = params.client.post(&params.url);
    for (name, value) in forwardable_header_pairs(params.headers) {
        if name.eq_ignore_ascii_case("content-type") {
            // reqwest sets its own `multipart/form-data; boundary=...` for the
            // re-encoded form; the client's original boundary is stale.
            continue;
        }
        builder = builder.header(name, value);
    }

    let response = match builder.multipart(form).send().await {
        Ok(response) => response,
        Err(error) => {
            drop(params.lease);
            error!(model_id = %params.model_id, %error, "failed to reach upstream");
            return ApiError(SwapmuxError::UpstreamDisconnect).into_response();
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| axum::http::HeaderValue::from_static("application/json"));
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(error) => {
            drop(params.lease);
            error!(model_id = %params.model_id, %error, "upstream disconnected mid-response");
            return ApiError(SwapmuxError::UpstreamDisconnect).into_response();
        }
    };
    drop(params.lease);
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
