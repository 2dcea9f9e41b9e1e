//! Role administration handlers.
//!
//! Mounted under `/admin` behind the admin API key.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{AssignedRole, PermissionRule, Role};
use crate::services::{PermissionDefinition, RoleDetails};
use crate::AppState;
use service_core::error::AppError;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct RoleNameRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRoleRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleResponse {
    pub role_id: Uuid,
    pub name: String,
    pub system_default: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl From<Role> for RoleResponse {
    fn from(role: Role) -> Self {
        Self {
            role_id: role.role_id,
            name: role.name,
            system_default: role.system_default,
            created_utc: role.created_utc,
            updated_utc: role.updated_utc,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleDetailsResponse {
    #[serde(flatten)]
    pub role: RoleResponse,
    pub user_types: Vec<String>,
    pub permissions: PermissionDefinition,
}

impl From<RoleDetails> for RoleDetailsResponse {
    fn from(details: RoleDetails) -> Self {
        Self {
            role: details.role.into(),
            user_types: details.user_types.iter().map(ToString::to_string).collect(),
            permissions: details.permissions,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub entity: String,
    pub action: String,
    pub relation: String,
    pub attributes: Vec<String>,
}

impl From<PermissionRule> for PermissionResponse {
    fn from(rule: PermissionRule) -> Self {
        Self {
            entity: rule.entity,
            action: rule.action,
            relation: rule.relation.to_string(),
            attributes: rule.attributes,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentResponse {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub created_utc: DateTime<Utc>,
}

impl From<AssignedRole> for AssignmentResponse {
    fn from(assignment: AssignedRole) -> Self {
        Self {
            user_id: assignment.user_id,
            role_id: assignment.role_id,
            created_utc: assignment.created_utc,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /admin/roles
pub async fn list_roles(State(state): State<AppState>) -> Result<Json<Vec<RoleResponse>>, AppError> {
    let roles = state.admin.list_roles().await?;
    Ok(Json(roles.into_iter().map(RoleResponse::from).collect()))
}

/// POST /admin/roles
pub async fn create_role(
    State(state): State<AppState>,
    Json(req): Json<RoleNameRequest>,
) -> Result<(StatusCode, Json<RoleResponse>), AppError> {
    req.validate()?;
    let role = state.admin.create_role(&req.name).await?;
    Ok((StatusCode::CREATED, Json(role.into())))
}

/// GET /admin/roles/:role_id
pub async fn get_role(
    State(state): State<AppState>,
    Path(role_id): Path<Uuid>,
) -> Result<Json<RoleDetailsResponse>, AppError> {
    let details = state.admin.get_role(role_id).await?;
    Ok(Json(details.into()))
}

/// PUT /admin/roles/:role_id
pub async fn update_role(
    State(state): State<AppState>,
    Path(role_id): Path<Uuid>,
    Json(req): Json<RoleNameRequest>,
) -> Result<Json<RoleResponse>, AppError> {
    req.validate()?;
    let role = state.admin.update_role(role_id, &req.name).await?;
    Ok(Json(role.into()))
}

/// DELETE /admin/roles/:role_id
pub async fn remove_role(
    State(state): State<AppState>,
    Path(role_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.admin.remove_role(role_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /admin/roles/:role_id/permissions
///
/// Body is a nested definition: `{"Balance": {"get": {"own": ["*"]}}}`.
pub async fn add_permissions(
    State(state): State<AppState>,
    Path(role_id): Path<Uuid>,
    Json(definition): Json<PermissionDefinition>,
) -> Result<(StatusCode, Json<Vec<PermissionResponse>>), AppError> {
    let rules = state.admin.add_permissions(role_id, &definition).await?;
    Ok((
        StatusCode::CREATED,
        Json(rules.into_iter().map(PermissionResponse::from).collect()),
    ))
}

/// DELETE /admin/roles/:role_id/permissions/:entity/:action/:relation
pub async fn remove_permission(
    State(state): State<AppState>,
    Path((role_id, entity, action, relation)): Path<(Uuid, String, String, String)>,
) -> Result<StatusCode, AppError> {
    state
        .admin
        .remove_permission(role_id, &entity, &action, &relation)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /admin/roles/:role_id/assignments
pub async fn assign_role(
    State(state): State<AppState>,
    Path(role_id): Path<Uuid>,
    Json(req): Json<AssignRoleRequest>,
) -> Result<(StatusCode, Json<AssignmentResponse>), AppError> {
    let assignment = state.admin.assign_role(req.user_id, role_id).await?;
    Ok((StatusCode::CREATED, Json(assignment.into())))
}

/// DELETE /admin/roles/:role_id/assignments/:user_id
pub async fn unassign_role(
    State(state): State<AppState>,
    Path((role_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state.admin.unassign_role(user_id, role_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
