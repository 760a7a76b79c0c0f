//! `/api/*` management routes: model listing with live state, unload
//! triggers, capture lookup, and the trivial version/health probes
//! (section 6).

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio_util::sync::CancellationToken;

use swapmux_core::SwapmuxError;

use crate::error::ApiError;
use crate::models::{
    ManagementModelInfo, ManagementModelsResponse, UnloadResponse, VersionResponse,
};
use crate::server::ProxyState;

pub async fn list_models(State(state): State<ProxyState>) -> Json<ManagementModelsResponse> {
    let registry = state.registry.current();
    let mut models = Vec::with_capacity(registry.instances.len());
    for (id, instance) in &registry.instances {
        models.push(ManagementModelInfo {
            id: id.clone(),
            state: instance.state().await,
            port: instance.port().await,
            group: instance.config().group.clone(),
            persistent: instance.is_persistent(),
            unlisted: instance.config().unlisted,
        });
    }
    models.sort_by(|a, b| a.id.cmp(&b.id));
    Json(ManagementModelsResponse { models })
}

pub async fn unload_all(State(state): State<ProxyState>) -> Result<Json<UnloadResponse>, ApiError> {
    let registry = state.registry.current();
    let ctx = CancellationToken::new();
    let mut unloaded = Vec::new();
    for (id, instance) in &registry.instances {
        if matches!(
            instance.state().await,
            swapmux_core::ModelInstanceState::Stopped | swapmux_core::ModelInstanceState::Shutdown
        ) {
            continue;
        }
        instance.stop(&ctx).await?;
        unloaded.push(id.clone());
    }
    unloaded.sort();
    Ok(Json(UnloadResponse { unloaded }))
}

pub async fn unload_one(
    State(state): State<ProxyState>,
    Path(model_id): Path<String>,
) -> Result<Json<UnloadResponse>, ApiError> {
    let registry = state.registry.current();
    let instance = registry
        .instance(&model_id)
        .ok_or_else(|| SwapmuxError::UnknownModel(model_id.clone()))?;
    instance.stop(&CancellationToken::new()).await?;
    Ok(Json(UnloadResponse {
        unloaded: vec![model_id],
    }))
}

pub async fn get_capture(State(state): State<ProxyState>, Path(record_id): Path<String>) -> Response {
    match state.metrics.get_capture(&record_id) {
        Some(payload) => Json(payload).into_response(),
        None => ApiError(SwapmuxError::CaptureNotFound(record_id)).into_response(),
    }
}

pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse::default())
}

pub async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn version_reports_crate_version() {
        let response = version().await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
