//! Principal role resolution.
//!
//! A principal's effective roles are the roles linked to its user type, the
//! roles explicitly assigned to it, and any contextual roles the caller
//! supplies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::error::ServiceResult;
use super::store::RoleStore;
use crate::models::UserType;

/// Authenticated caller as seen by the authorization core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: Uuid,
    pub user_type: UserType,
    #[serde(default)]
    pub contextual_roles: Vec<String>,
}

impl Principal {
    pub fn new(user_id: Uuid, user_type: UserType) -> Self {
        Self {
            user_id,
            user_type,
            contextual_roles: Vec::new(),
        }
    }

    pub fn with_contextual_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contextual_roles.extend(roles.into_iter().map(Into::into));
        self
    }
}

#[derive(Clone)]
pub struct RoleResolver {
    store: Arc<dyn RoleStore>,
}

impl RoleResolver {
    pub fn new(store: Arc<dyn RoleStore>) -> Self {
        Self { store }
    }

    /// Sorted, de-duplicated role names of `principal`.
    #[instrument(skip(self, principal), fields(user_id = %principal.user_id, user_type = %principal.user_type))]
    pub async fn resolve(&self, principal: &Principal) -> ServiceResult<Vec<String>> {
        let (by_type, assigned) = tokio::try_join!(
            self.store.find_roles_by_user_type(principal.user_type),
            self.store.find_assigned_roles(principal.user_id),
        )?;

        let names: BTreeSet<String> = by_type
            .into_iter()
            .chain(assigned)
            .map(|role| role.name)
            .chain(
                principal
                    .contextual_roles
                    .iter()
                    .filter(|name| !name.trim().is_empty())
                    .cloned(),
            )
            .collect();

        Ok(names.into_iter().collect())
    }
}
