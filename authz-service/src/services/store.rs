//! Role store abstraction.
//!
//! The synchronizer, access checker and administration service only talk to
//! persistence through this trait. `Database` is the PostgreSQL
//! implementation, `MemoryRoleStore` the in-process one.

use async_trait::async_trait;
use uuid::Uuid;

use super::error::ServiceResult;
use crate::models::{AssignedRole, PermissionRule, Role, RoleUserType, UserType};

/// A permission rule together with the name of the role that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRule {
    pub role_name: String,
    pub rule: PermissionRule,
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn health_check(&self) -> ServiceResult<()>;

    // Roles
    async fn find_role_by_name(&self, name: &str) -> ServiceResult<Option<Role>>;
    async fn find_role_by_id(&self, role_id: Uuid) -> ServiceResult<Option<Role>>;
    async fn list_roles(&self) -> ServiceResult<Vec<Role>>;
    /// Insert or update by `role_id`.
    async fn save_role(&self, role: &Role) -> ServiceResult<Role>;
    /// Delete a role and everything that references it. Returns whether it existed.
    async fn delete_role(&self, role_id: Uuid) -> ServiceResult<bool>;
    /// Delete roles with the given `system_default` flag whose name is not listed.
    async fn delete_roles_not_in(&self, names: &[String], system_default: bool) -> ServiceResult<Vec<Role>>;

    // Permission rules
    async fn find_permissions(&self, role_id: Uuid) -> ServiceResult<Vec<PermissionRule>>;
    /// Insert all rules atomically.
    async fn save_permissions(&self, rules: &[PermissionRule]) -> ServiceResult<()>;
    /// Delete all rules (matched by key) atomically.
    async fn delete_permissions(&self, rules: &[PermissionRule]) -> ServiceResult<()>;
    /// Every rule with its owning role name.
    async fn load_rule_index(&self) -> ServiceResult<Vec<NamedRule>>;

    // User type links
    async fn find_role_user_types(&self, role_id: Uuid) -> ServiceResult<Vec<UserType>>;
    async fn save_role_user_types(&self, links: &[RoleUserType]) -> ServiceResult<()>;
    async fn delete_role_user_types(&self, links: &[RoleUserType]) -> ServiceResult<()>;
    async fn find_roles_by_user_type(&self, user_type: UserType) -> ServiceResult<Vec<Role>>;

    // Explicit assignments
    async fn find_assigned_roles(&self, user_id: Uuid) -> ServiceResult<Vec<Role>>;
    /// Returns `false` if the assignment already existed.
    async fn save_assigned_role(&self, assignment: &AssignedRole) -> ServiceResult<bool>;
    /// Returns whether an assignment was removed.
    async fn delete_assigned_role(&self, user_id: Uuid, role_id: Uuid) -> ServiceResult<bool>;
}
