use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::AppState;
use service_core::error::AppError;

pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";

/// Reject requests without the configured admin key.
pub async fn admin_key_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(ADMIN_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match presented {
        Some(key) if keys_match(key, &state.admin_api_key) => next.run(request).await,
        _ => {
            tracing::warn!(
                path = %request.uri().path(),
                "Failed admin authentication attempt"
            );
            AppError::Unauthorized(anyhow::anyhow!("Invalid or missing admin API key"))
                .into_response()
        }
    }
}

fn keys_match(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}
