//! End-to-end scenario tests driven against a real (managed) fake upstream
//! process rather than the `proxyUrl`-only fixture `routes.rs` uses. Each
//! scenario spawns a tiny `python3` HTTP server as the model's `cmd` --
//! per the test-tooling note that a managed-instance test should bind the
//! assigned port and answer the health endpoint rather than depending on an
//! actual model binary -- and drives it through [`swapmux_proxy::router`]
//! the same way `routes.rs` drives the unmanaged fixture.
//!
//! Covers the six end-to-end scenarios: alias resolution, profile/field
//! stripping, swap eviction ordering, concurrency-limit serialization,
//! crash recovery, and idle unload.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use swapmux_core::events::{Event, EventKind};
use swapmux_core::ports::EventSubscription;
use swapmux_core::{Config, EventPublisher, ModelInstanceState};
use swapmux_runtime::{EventBus, MetricsStore, PortAllocator, Registry, SharedRegistry};

use swapmux_proxy::ProxyState;

/// Writes a `python3` fake upstream server to `dir/name.py` and returns the
/// `cmd` string to spawn it, `${PORT}`-templated per
/// [`swapmux_runtime::runner::substitute_template`]. `post_body` is spliced
/// in as the `do_post` handler's response logic, already having read the
/// request into `body`; variants differ only in what they do with it.
fn write_fake_server(dir: &Path, name: &str, post_body: &str) -> String {
    let path = dir.join(format!("{name}.py"));
    let script = format!(
        r#"import http.server
import os
import sys
import time


def do_get(self):
    body = b'{{"status":"ok"}}'
    self.send_response(200)
    self.send_header("Content-Type", "application/json")
    self.send_header("Content-Length", str(len(body)))
    self.end_headers()
    self.wfile.write(body)


def do_post(self):
    length = int(self.headers.get("Content-Length", 0))
    body = self.rfile.read(length)
{post_body}


class Handler(http.server.BaseHTTPRequestHandler):
    do_GET = do_get
    do_POST = do_post

    def log_message(self, *args):
        pass


port = int(sys.argv[1])
http.server.HTTPServer(("127.0.0.1", port), Handler).serve_forever()
"#
    );
    std::fs::write(&path, script).unwrap();
    format!("python3 {} ${{PORT}}", path.display())
}

const ECHO_POST: &str = "    self.send_response(200)\n    self.send_header(\"Content-Type\", \"application/json\")\n    self.send_header(\"Content-Length\", str(len(body)))\n    self.end_headers()\n    self.wfile.write(body)";

const SLOW_POST: &str = "    time.sleep(0.3)\n    self.send_response(200)\n    self.send_header(\"Content-Type\", \"application/json\")\n    self.send_header(\"Content-Length\", str(len(body)))\n    self.end_headers()\n    self.wfile.write(body)";

const CRASH_POST: &str = "    self.send_response(200)\n    self.send_header(\"Content-Type\", \"application/json\")\n    self.send_header(\"Content-Length\", str(len(body)))\n    self.end_headers()\n    self.wfile.write(body)\n    self.wfile.flush()\n    os._exit(137)";

fn echo_cmd(dir: &Path, name: &str) -> String {
    write_fake_server(dir, name, ECHO_POST)
}

fn slow_cmd(dir: &Path, name: &str) -> String {
    write_fake_server(dir, name, SLOW_POST)
}

fn crash_cmd(dir: &Path, name: &str) -> String {
    write_fake_server(dir, name, CRASH_POST)
}

fn build_state(yaml: &str, start_port: u16) -> ProxyState {
    let config = Config::from_yaml(yaml, "test").unwrap();
    let ports = Arc::new(PortAllocator::new(start_port, 20));
    let events = Arc::new(EventBus::new(64));
    let registry = Registry::build(config, ports, events.clone(), 5, Duration::from_millis(500));
    let metrics = Arc::new(MetricsStore::new(64, events.clone() as Arc<dyn EventPublisher>));
    ProxyState {
        registry: Arc::new(SharedRegistry::new(registry)),
        events,
        metrics,
        client: reqwest::Client::new(),
    }
}

async fn chat_completion(state: &ProxyState, body: &str) -> (StatusCode, serde_json::Value) {
    let app = swapmux_proxy::router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let parsed = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, parsed)
}

async fn instance_state(state: &ProxyState, model_id: &str) -> ModelInstanceState {
    state.registry.current().instance(model_id).unwrap().state().await
}

async fn wait_for_state(state: &ProxyState, model_id: &str, target: ModelInstanceState, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if instance_state(state, model_id).await == target {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {model_id} to reach {target:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn alias_resolves_and_rewrites_outgoing_model_name() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = echo_cmd(dir.path(), "alias");
    let yaml = format!(
        r#"
models:
  alias-target:
    cmd: "{cmd}"
    aliases: ["at"]
"#
    );
    let state = build_state(&yaml, 24000);

    let (status, body) = chat_completion(&state, r#"{"model":"at","messages":[]}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "alias-target");
    assert_eq!(instance_state(&state, "alias-target").await, ModelInstanceState::Ready);
}

#[tokio::test]
async fn strip_fields_removes_configured_keys_before_forwarding() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = echo_cmd(dir.path(), "strip");
    let yaml = format!(
        r#"
models:
  strip-target:
    cmd: "{cmd}"
    filters:
      strip_fields: ["secret_field"]
"#
    );
    let state = build_state(&yaml, 24020);

    let (status, body) = chat_completion(
        &state,
        r#"{"model":"strip-target","secret_field":"shh","messages":[]}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "strip-target");
    assert!(body.get("secret_field").is_none());
}

#[tokio::test]
async fn swap_group_stops_sibling_before_starting_target() {
    let dir = tempfile::tempdir().unwrap();
    let cmd_a = echo_cmd(dir.path(), "swap_a");
    let cmd_b = echo_cmd(dir.path(), "swap_b");
    let yaml = format!(
        r#"
groups:
  pair:
    members: ["swap-a", "swap-b"]

models:
  swap-a:
    cmd: "{cmd_a}"
    group: pair
  swap-b:
    cmd: "{cmd_b}"
    group: pair
"#
    );
    let state = build_state(&yaml, 24040);

    let (status, _) = chat_completion(&state, r#"{"model":"swap-a","messages":[]}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(instance_state(&state, "swap-a").await, ModelInstanceState::Ready);

    let mut sub = state.events.subscribe(EventKind::ModelStatus);

    let (status, _) = chat_completion(&state, r#"{"model":"swap-b","messages":[]}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(instance_state(&state, "swap-b").await, ModelInstanceState::Ready);
    assert_eq!(instance_state(&state, "swap-a").await, ModelInstanceState::Stopped);

    let mut swap_a_stopped_at = None;
    let mut swap_b_ready_at = None;
    let mut order = 0usize;
    while let Ok(Some(Event::ModelStatus(status))) =
        tokio::time::timeout(Duration::from_millis(500), sub.recv()).await
    {
        order += 1;
        if status.model_id == "swap-a" && status.state == ModelInstanceState::Stopped && swap_a_stopped_at.is_none() {
            swap_a_stopped_at = Some(order);
        }
        if status.model_id == "swap-b" && status.state == ModelInstanceState::Ready && swap_b_ready_at.is_none() {
            swap_b_ready_at = Some(order);
        }
    }

    let swap_a_stopped_at = swap_a_stopped_at.expect("swap-a should have reported stopped");
    let swap_b_ready_at = swap_b_ready_at.expect("swap-b should have reported ready");
    assert!(
        swap_a_stopped_at < swap_b_ready_at,
        "swap-a's eviction must be observed before swap-b becomes ready"
    );
}

#[tokio::test]
async fn concurrency_limit_serializes_requests_past_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = slow_cmd(dir.path(), "limited");
    let yaml = format!(
        r#"
models:
  limited:
    cmd: "{cmd}"
    concurrency_limit: 1
"#
    );
    let state = build_state(&yaml, 24060);

    let started = Instant::now();
    let (first, second) = tokio::join!(
        chat_completion(&state, r#"{"model":"limited","messages":[]}"#),
        chat_completion(&state, r#"{"model":"limited","messages":[]}"#),
    );
    let elapsed = started.elapsed();

    assert_eq!(first.0, StatusCode::OK);
    assert_eq!(second.0, StatusCode::OK);
    assert!(
        elapsed >= Duration::from_millis(550),
        "two requests against a concurrency_limit of 1 should serialize, took {elapsed:?}"
    );
}

#[tokio::test]
async fn crashed_instance_returns_bad_gateway_then_restarts_on_next_request() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = crash_cmd(dir.path(), "crashy");
    let yaml = format!(
        r#"
models:
  crashy:
    cmd: "{cmd}"
"#
    );
    let state = build_state(&yaml, 24080);

    let (status, _) = chat_completion(&state, r#"{"model":"crashy","messages":[]}"#).await;
    assert_eq!(status, StatusCode::OK);

    // Give the process time to actually exit (and its socket to close)
    // before the next request, so the connection failure below is
    // deterministic rather than racing the crash.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (status, _) = chat_completion(&state, r#"{"model":"crashy","messages":[]}"#).await;
    assert!(
        status == StatusCode::BAD_GATEWAY || status == StatusCode::GATEWAY_TIMEOUT,
        "request against a crashed upstream should surface as a gateway error, got {status}"
    );

    wait_for_state(&state, "crashy", ModelInstanceState::Stopped, Duration::from_secs(5)).await;

    let (status, _) = chat_completion(&state, r#"{"model":"crashy","messages":[]}"#).await;
    assert_eq!(status, StatusCode::OK, "a fresh request should respawn the crashed instance");
    assert_eq!(instance_state(&state, "crashy").await, ModelInstanceState::Ready);
}

#[tokio::test]
async fn idle_instance_unloads_after_configured_duration_and_restarts_on_demand() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = echo_cmd(dir.path(), "idle");
    let yaml = format!(
        r#"
models:
  idle-target:
    cmd: "{cmd}"
    unload_after: 1
"#
    );
    let state = build_state(&yaml, 24100);

    let (status, _) = chat_completion(&state, r#"{"model":"idle-target","messages":[]}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(instance_state(&state, "idle-target").await, ModelInstanceState::Ready);

    wait_for_state(&state, "idle-target", ModelInstanceState::Stopped, Duration::from_secs(5)).await;

    let (status, _) = chat_completion(&state, r#"{"model":"idle-target","messages":[]}"#).await;
    assert_eq!(status, StatusCode::OK, "idle-unloaded instance should restart on the next request");
    assert_eq!(instance_state(&state, "idle-target").await, ModelInstanceState::Ready);
}
