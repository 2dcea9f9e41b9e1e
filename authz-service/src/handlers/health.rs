use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::services::get_metrics;
use crate::AppState;

/// Liveness: the role store answers.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "authz-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - role store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "authz-service"
                })),
            )
        }
    }
}

/// Readiness: the role store answers and a rule snapshot has been loaded.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(e) = state.store.health_check().await {
        tracing::warn!(error = %e, "Readiness check failed");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if state.checker.snapshot().is_empty() {
        tracing::warn!("Readiness check failed - no permission rules loaded");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
