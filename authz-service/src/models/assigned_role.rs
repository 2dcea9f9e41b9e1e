//! Explicit role grant to a single principal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AssignedRole {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub created_utc: DateTime<Utc>,
}

impl AssignedRole {
    pub fn new(user_id: Uuid, role_id: Uuid) -> Self {
        Self {
            user_id,
            role_id,
            created_utc: Utc::now(),
        }
    }
}
