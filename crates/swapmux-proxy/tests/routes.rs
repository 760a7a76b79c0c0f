//! Route-wiring integration tests: build a real router against an unmanaged
//! (`proxyUrl`-only) model so no child process is ever spawned, then drive
//! requests through it with `tower::ServiceExt::oneshot`.
//!
//! Grounded on `gglib-axum/tests/integration_routes.rs`'s
//! `bootstrap(...)` -> `create_router(...)` -> `.oneshot(Request...)` shape.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use swapmux_core::{Config, EventPublisher};
use swapmux_runtime::{EventBus, MetricsStore, PortAllocator, Registry, SharedRegistry};

use swapmux_proxy::ProxyState;

fn config_yaml() -> &'static str {
    r#"
models:
  echo:
    proxy: "http://127.0.0.1:9"
    aliases: ["e"]
"#
}

fn test_state() -> ProxyState {
    let config = Config::from_yaml(config_yaml(), "test").unwrap();
    let ports = Arc::new(PortAllocator::new(21000, 5));
    let events = Arc::new(EventBus::new(16));
    let registry = Registry::build(config, ports, events.clone(), 5, Duration::from_millis(50));
    let metrics = Arc::new(MetricsStore::new(16, events.clone() as Arc<dyn EventPublisher>));
    ProxyState {
        registry: Arc::new(SharedRegistry::new(registry)),
        events,
        metrics,
        client: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let app = swapmux_proxy::router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn catalog_listing_returns_configured_model() {
    let app = swapmux_proxy::router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["data"][0]["id"], "echo");
}

#[tokio::test]
async fn management_listing_reports_stopped_state() {
    let app = swapmux_proxy::router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/api/models/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["models"][0]["id"], "echo");
    assert_eq!(parsed["models"][0]["state"], "stopped");
}

#[tokio::test]
async fn unknown_capture_id_maps_to_404() {
    let app = swapmux_proxy::router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/captures/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_completions_without_model_field_is_bad_request() {
    let app = swapmux_proxy::router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"messages":[]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_completions_with_unknown_model_is_not_found() {
    let app = swapmux_proxy::router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"ghost","messages":[]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
