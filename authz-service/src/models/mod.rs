//! Domain models for authz-service.

mod assigned_role;
mod permission;
mod role;
mod user_type;

pub use assigned_role::AssignedRole;
pub use permission::{PermissionRule, Relation, WILDCARD};
pub use role::{Role, RoleUserType};
pub use user_type::UserType;
