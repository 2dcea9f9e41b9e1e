//! Access decision endpoints.
//!
//! Callers either pass resolved role names, or a principal whose roles are
//! resolved here. Both sources are unioned.

use axum::extract::{Json, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;
use validator::Validate;

use crate::services::Principal;
use crate::AppState;
use service_core::error::AppError;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    #[serde(default)]
    pub roles: Vec<String>,
    pub principal: Option<Principal>,
    #[validate(length(min = 1, max = 128))]
    pub action: String,
    #[validate(length(min = 1, max = 32))]
    pub relation: String,
    #[validate(length(min = 1, max = 128))]
    pub entity: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Record to strip down to the visible fields.
    pub record: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub allowed: bool,
    pub roles: Vec<String>,
    pub visible_attributes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    pub user_id: Uuid,
    pub roles: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /authz/check
pub async fn check(
    State(state): State<AppState>,
    Json(req): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, AppError> {
    req.validate()?;

    let mut roles: BTreeSet<String> = req.roles.iter().cloned().collect();
    if let Some(principal) = &req.principal {
        roles.extend(state.resolver.resolve(principal).await?);
    }
    let roles: Vec<String> = roles.into_iter().collect();

    let allowed = state
        .checker
        .can(&roles, &req.action, &req.relation, &req.entity, &req.attributes);
    let visible_attributes = state.checker.visible_attributes(
        &roles,
        &req.action,
        &req.relation,
        &req.entity,
        &req.attributes,
    );
    let record = req.record.as_ref().and_then(|record| {
        state
            .checker
            .filter_record(&roles, &req.action, &req.relation, &req.entity, record)
    });

    tracing::debug!(
        action = %req.action,
        relation = %req.relation,
        entity = %req.entity,
        allowed,
        "Access check evaluated"
    );

    Ok(Json(CheckResponse {
        allowed,
        roles,
        visible_attributes,
        record,
    }))
}

/// POST /authz/resolve
pub async fn resolve(
    State(state): State<AppState>,
    Json(principal): Json<Principal>,
) -> Result<Json<ResolveResponse>, AppError> {
    let roles = state.resolver.resolve(&principal).await?;
    Ok(Json(ResolveResponse {
        user_id: principal.user_id,
        roles,
    }))
}
