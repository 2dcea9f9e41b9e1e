//! Role model - named bundle of permission rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::UserType;

/// Role entity.
///
/// `system_default` roles are owned by the startup synchronizer and are
/// read-only for administrators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub role_id: Uuid,
    pub name: String,
    pub system_default: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Role {
    /// Create a new, non-default role.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            role_id: Uuid::new_v4(),
            name: name.into(),
            system_default: false,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Bump the modification timestamp.
    pub fn touch(&mut self) {
        self.updated_utc = Utc::now();
    }
}

/// Automatic grant of a role to every principal of a user type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, FromRow)]
pub struct RoleUserType {
    pub role_id: Uuid,
    pub user_type: UserType,
}

impl RoleUserType {
    pub fn new(role_id: Uuid, user_type: UserType) -> Self {
        Self { role_id, user_type }
    }
}
