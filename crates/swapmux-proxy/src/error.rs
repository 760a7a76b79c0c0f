//! Mapping from [`SwapmuxError`] to the JSON error body and status code
//! every route answers with when a request fails (section 7).
//!
//! Grounded on `gglib-axum/src/error.rs`'s `HttpError` (`IntoResponse` impl
//! plus a dedicated `ErrorBody` struct), generalized from a
//! message-plus-optional-metadata body to the flatter `{"error":{"type",
//! "message"}}` shape this surface promises clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use swapmux_core::SwapmuxError;

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    error_type: &'static str,
    message: String,
}

/// Newtype so `SwapmuxError` (defined in `swapmux-core`, which knows
/// nothing about HTTP) can still answer `axum` handlers directly via `?`.
pub struct ApiError(pub SwapmuxError);

impl From<SwapmuxError> for ApiError {
    fn from(error: SwapmuxError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.suggested_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: ErrorDetail {
                error_type: self.0.type_tag(),
                message: self.0.to_string(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_maps_to_404() {
        let response = ApiError(SwapmuxError::UnknownModel("ghost".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn health_check_timeout_maps_to_504() {
        let response = ApiError(SwapmuxError::HealthCheckTimeout {
            model: "m".to_string(),
            timeout_secs: 1,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
