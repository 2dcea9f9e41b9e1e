//! Role administration.
//!
//! Administrator-facing mutations of roles, their permission rules and
//! explicit assignments. Roles flagged `system_default` belong to the startup
//! synchronizer and cannot be changed here.

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::access::AccessChecker;
use super::codec::{definition_to_rules, rules_to_definition, PermissionDefinition};
use super::error::{ServiceError, ServiceResult};
use super::metrics::record_admin_operation;
use super::store::RoleStore;
use crate::models::{AssignedRole, PermissionRule, Relation, Role, UserType};

/// A role with its user types and permissions.
#[derive(Debug, Clone, Serialize)]
pub struct RoleDetails {
    #[serde(flatten)]
    pub role: Role,
    pub user_types: Vec<UserType>,
    pub permissions: PermissionDefinition,
}

pub struct RoleAdminService {
    store: Arc<dyn RoleStore>,
    checker: Arc<AccessChecker>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl RoleAdminService {
    pub fn new(store: Arc<dyn RoleStore>, checker: Arc<AccessChecker>) -> Self {
        Self {
            store,
            checker,
            locks: DashMap::new(),
        }
    }

    pub async fn list_roles(&self) -> ServiceResult<Vec<Role>> {
        self.store.list_roles().await
    }

    pub async fn get_role(&self, role_id: Uuid) -> ServiceResult<RoleDetails> {
        let role = self.load_role(role_id).await?;
        let (user_types, rules) = tokio::try_join!(
            self.store.find_role_user_types(role_id),
            self.store.find_permissions(role_id),
        )?;
        Ok(RoleDetails {
            role,
            user_types,
            permissions: rules_to_definition(&rules),
        })
    }

    #[instrument(skip(self))]
    pub async fn create_role(&self, name: &str) -> ServiceResult<Role> {
        observed("create_role", async {
            let name = validate_role_name(name)?;
            if self.store.find_role_by_name(name).await?.is_some() {
                return Err(ServiceError::Conflict(format!(
                    "Role with name '{}' already exists",
                    name
                )));
            }
            let role = self.store.save_role(&Role::new(name)).await?;
            info!(role_id = %role.role_id, name = %role.name, "Role created");
            Ok(role)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn update_role(&self, role_id: Uuid, name: &str) -> ServiceResult<Role> {
        self.with_role_lock(role_id, observed("update_role", async {
            let mut role = self.load_mutable_role(role_id).await?;
            let name = validate_role_name(name)?;
            if role.name == name {
                return Ok(role);
            }
            if self.store.find_role_by_name(name).await?.is_some() {
                return Err(ServiceError::Conflict(format!(
                    "Role with name '{}' already exists",
                    name
                )));
            }
            role.name = name.to_string();
            role.touch();
            let role = self.store.save_role(&role).await?;
            self.refresh_snapshot().await;
            info!(role_id = %role.role_id, name = %role.name, "Role renamed");
            Ok(role)
        }))
        .await
    }

    #[instrument(skip(self))]
    pub async fn remove_role(&self, role_id: Uuid) -> ServiceResult<()> {
        let result = self
            .with_role_lock(role_id, observed("remove_role", async {
                let role = self.load_mutable_role(role_id).await?;
                if !self.store.delete_role(role_id).await? {
                    return Err(ServiceError::NotFound(format!("Role {} not found", role_id)));
                }
                self.refresh_snapshot().await;
                info!(role_id = %role_id, name = %role.name, "Role removed");
                Ok(())
            }))
            .await;

        if result.is_ok() {
            self.locks.remove(&role_id);
        }
        result
    }

    /// Add every rule of `definition` to the role in one write.
    ///
    /// Fails without writing anything if any (entity, action, relation) key
    /// already exists on the role.
    #[instrument(skip(self, definition), fields(rules = definition.leaf_count()))]
    pub async fn add_permissions(
        &self,
        role_id: Uuid,
        definition: &PermissionDefinition,
    ) -> ServiceResult<Vec<PermissionRule>> {
        self.with_role_lock(role_id, observed("add_permissions", async {
            self.load_mutable_role(role_id).await?;
            if definition.is_empty() {
                return Err(ServiceError::Validation(
                    "Permission definition is empty".to_string(),
                ));
            }
            let rules = definition_to_rules(role_id, definition)?;
            let existing = self.store.find_permissions(role_id).await?;

            let clashes: Vec<String> = rules
                .iter()
                .filter(|rule| existing.iter().any(|e| e.same_key(rule)))
                .map(|rule| format!("{}.{}.{}", rule.entity, rule.action, rule.relation))
                .collect();
            if !clashes.is_empty() {
                return Err(ServiceError::Conflict(format!(
                    "Permissions already exist on role: {}",
                    clashes.join(", ")
                )));
            }

            self.store.save_permissions(&rules).await?;
            self.refresh_snapshot().await;
            info!(role_id = %role_id, added = rules.len(), "Permissions added");
            Ok(rules)
        }))
        .await
    }

    #[instrument(skip(self))]
    pub async fn remove_permission(
        &self,
        role_id: Uuid,
        entity: &str,
        action: &str,
        relation: &str,
    ) -> ServiceResult<PermissionRule> {
        self.with_role_lock(role_id, observed("remove_permission", async {
            self.load_mutable_role(role_id).await?;
            let relation: Relation = relation.parse().map_err(ServiceError::Validation)?;

            let mut matching: Vec<PermissionRule> = self
                .store
                .find_permissions(role_id)
                .await?
                .into_iter()
                .filter(|p| p.entity == entity && p.action == action && p.relation == relation)
                .collect();

            let rule = match matching.len() {
                1 => matching.remove(0),
                0 => {
                    return Err(ServiceError::Conflict(format!(
                        "No permission {}.{}.{} on role {}",
                        entity, action, relation, role_id
                    )))
                }
                n => {
                    return Err(ServiceError::Conflict(format!(
                        "Permission {}.{}.{} is ambiguous on role {} ({} matches)",
                        entity, action, relation, role_id, n
                    )))
                }
            };

            self.store.delete_permissions(std::slice::from_ref(&rule)).await?;
            self.refresh_snapshot().await;
            info!(role_id = %role_id, entity, action, relation = %relation, "Permission removed");
            Ok(rule)
        }))
        .await
    }

    #[instrument(skip(self))]
    pub async fn assign_role(&self, user_id: Uuid, role_id: Uuid) -> ServiceResult<AssignedRole> {
        observed("assign_role", async {
            self.load_role(role_id).await?;
            let assignment = AssignedRole::new(user_id, role_id);
            if !self.store.save_assigned_role(&assignment).await? {
                return Err(ServiceError::Conflict(format!(
                    "Role {} is already assigned to user {}",
                    role_id, user_id
                )));
            }
            Ok(assignment)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn unassign_role(&self, user_id: Uuid, role_id: Uuid) -> ServiceResult<()> {
        observed("unassign_role", async {
            if !self.store.delete_assigned_role(user_id, role_id).await? {
                return Err(ServiceError::NotFound(format!(
                    "Role {} is not assigned to user {}",
                    role_id, user_id
                )));
            }
            Ok(())
        })
        .await
    }

    /// Run `operation` under the role's mutation lock. The lock entry is
    /// dropped again when the role does not exist.
    async fn with_role_lock<T>(
        &self,
        role_id: Uuid,
        operation: impl Future<Output = ServiceResult<T>>,
    ) -> ServiceResult<T> {
        let lock = self.locks.entry(role_id).or_default().clone();
        let guard = lock.lock().await;
        let result = operation.await;
        drop(guard);

        if matches!(result, Err(ServiceError::NotFound(_))) {
            self.locks.remove(&role_id);
        }
        result
    }

    async fn load_role(&self, role_id: Uuid) -> ServiceResult<Role> {
        self.store
            .find_role_by_id(role_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Role {} not found", role_id)))
    }

    async fn load_mutable_role(&self, role_id: Uuid) -> ServiceResult<Role> {
        let role = self.load_role(role_id).await?;
        if role.system_default {
            return Err(ServiceError::Conflict(format!(
                "Role '{}' is a system default role and cannot be modified",
                role.name
            )));
        }
        Ok(role)
    }

    /// The committed mutation stands even if the snapshot cannot be rebuilt.
    async fn refresh_snapshot(&self) {
        if let Err(e) = self.checker.refresh(self.store.as_ref()).await {
            error!(error = %e, "Failed to refresh rule snapshot after role change");
        }
    }
}

/// Matches the `roles.name` column.
const MAX_ROLE_NAME_LEN: usize = 128;

fn validate_role_name(name: &str) -> ServiceResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::Validation("Role name must not be empty".to_string()));
    }
    if name.chars().count() > MAX_ROLE_NAME_LEN {
        return Err(ServiceError::Validation(format!(
            "Role name must be at most {} characters",
            MAX_ROLE_NAME_LEN
        )));
    }
    Ok(name)
}

async fn observed<T>(
    operation: &str,
    operation_future: impl Future<Output = ServiceResult<T>>,
) -> ServiceResult<T> {
    let result = operation_future.await;
    record_admin_operation(operation, result.is_ok());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WILDCARD;
    use crate::services::memory::MemoryRoleStore;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryRoleStore>, Arc<AccessChecker>, Arc<RoleAdminService>) {
        let store = Arc::new(MemoryRoleStore::new());
        let checker = Arc::new(AccessChecker::default());
        let admin = Arc::new(RoleAdminService::new(store.clone(), checker.clone()));
        (store, checker, admin)
    }

    async fn system_role(store: &MemoryRoleStore) -> Role {
        let mut role = Role::new("User");
        role.system_default = true;
        store.save_role(&role).await.unwrap()
    }

    fn balance_grant() -> PermissionDefinition {
        PermissionDefinition::new().grant("Balance", "get", Relation::Own, [WILDCARD])
    }

    #[tokio::test]
    async fn test_create_role_rejects_existing_name() {
        let (_, _, admin) = setup();
        admin.create_role("Cashier").await.unwrap();

        let err = admin.create_role("Cashier").await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        let err = admin.create_role("  ").await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_system_default_roles_are_read_only() {
        let (store, _, admin) = setup();
        let role = system_role(&store).await;
        let writes = store.writes();

        let err = admin.update_role(role.role_id, "Renamed").await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        let err = admin.remove_role(role.role_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        let err = admin
            .add_permissions(role.role_id, &balance_grant())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        let err = admin
            .remove_permission(role.role_id, "Balance", "get", "own")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_system_default_roles_can_still_be_assigned() {
        let (store, _, admin) = setup();
        let role = system_role(&store).await;
        let user_id = Uuid::new_v4();

        admin.assign_role(user_id, role.role_id).await.unwrap();
        let err = admin.assign_role(user_id, role.role_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        admin.unassign_role(user_id, role.role_id).await.unwrap();
        let err = admin.unassign_role(user_id, role.role_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_role_name_longer_than_column_is_rejected() {
        let (store, _, admin) = setup();
        let err = admin.create_role(&"R".repeat(129)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(store.writes(), 0);

        let role = admin.create_role(&"R".repeat(128)).await.unwrap();
        let err = admin.update_role(role.role_id, &"S".repeat(129)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_role_ids_leave_no_lock_entries() {
        let (_, _, admin) = setup();
        for _ in 0..4 {
            let missing = Uuid::new_v4();
            assert!(admin.update_role(missing, "X").await.is_err());
            assert!(admin.remove_role(missing).await.is_err());
            assert!(admin.add_permissions(missing, &balance_grant()).await.is_err());
            assert!(admin
                .remove_permission(missing, "Balance", "get", "own")
                .await
                .is_err());
        }
        assert!(admin.locks.is_empty());

        let role = admin.create_role("Cashier").await.unwrap();
        admin.add_permissions(role.role_id, &balance_grant()).await.unwrap();
        assert_eq!(admin.locks.len(), 1);
        admin.remove_role(role.role_id).await.unwrap();
        assert!(admin.locks.is_empty());
    }

    #[tokio::test]
    async fn test_missing_role_is_not_found() {
        let (_, _, admin) = setup();
        let missing = Uuid::new_v4();
        assert!(matches!(
            admin.get_role(missing).await.unwrap_err(),
            ServiceError::NotFound(_)
        ));
        assert!(matches!(
            admin.update_role(missing, "X").await.unwrap_err(),
            ServiceError::NotFound(_)
        ));
        assert!(matches!(
            admin.assign_role(Uuid::new_v4(), missing).await.unwrap_err(),
            ServiceError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_add_permissions_refreshes_snapshot() {
        let (_, checker, admin) = setup();
        let role = admin.create_role("Cashier").await.unwrap();
        assert!(!checker.can(&["Cashier"], "get", "own", "Balance", &["amount"]));

        admin.add_permissions(role.role_id, &balance_grant()).await.unwrap();
        assert!(checker.can(&["Cashier"], "get", "own", "Balance", &["amount"]));

        let details = admin.get_role(role.role_id).await.unwrap();
        assert_eq!(details.permissions, balance_grant());
    }

    #[tokio::test]
    async fn test_add_permissions_rejects_existing_key_without_partial_write() {
        let (store, _, admin) = setup();
        let role = admin.create_role("Cashier").await.unwrap();
        admin.add_permissions(role.role_id, &balance_grant()).await.unwrap();

        let definition = PermissionDefinition::new()
            .grant("Transaction", "get", Relation::Own, ["id"])
            .grant("Balance", "get", Relation::Own, ["amount"]);
        let err = admin
            .add_permissions(role.role_id, &definition)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(store.permission_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_add_permissions_never_double_inserts() {
        let (store, _, admin) = setup();
        let role_id = admin.create_role("Cashier").await.unwrap().role_id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let admin = admin.clone();
                tokio::spawn(async move { admin.add_permissions(role_id, &balance_grant()).await })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(e) => assert!(matches!(e, ServiceError::Conflict(_))),
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(store.permission_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_permissions_unchanged() {
        let (store, checker, admin) = setup();
        let role = admin.create_role("Cashier").await.unwrap();

        store.set_fail_writes(true);
        let err = admin
            .add_permissions(role.role_id, &balance_grant())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Database(_)));
        store.set_fail_writes(false);

        assert_eq!(store.permission_count(), 0);
        assert!(!checker.can(&["Cashier"], "get", "own", "Balance", &["amount"]));
    }

    #[tokio::test]
    async fn test_remove_permission() {
        let (_, checker, admin) = setup();
        let role = admin.create_role("Cashier").await.unwrap();
        admin.add_permissions(role.role_id, &balance_grant()).await.unwrap();

        let err = admin
            .remove_permission(role.role_id, "Balance", "get", "all")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        let err = admin
            .remove_permission(role.role_id, "Balance", "get", "mine")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let removed = admin
            .remove_permission(role.role_id, "Balance", "get", "own")
            .await
            .unwrap();
        assert_eq!(removed.relation, Relation::Own);
        assert!(!checker.can(&["Cashier"], "get", "own", "Balance", &["amount"]));
    }

    #[tokio::test]
    async fn test_slow_refresh_does_not_restore_revoked_permission() {
        let (store, checker, admin) = setup();
        let cashier = admin.create_role("Cashier").await.unwrap();
        let clerk = admin.create_role("Clerk").await.unwrap();
        admin.add_permissions(cashier.role_id, &balance_grant()).await.unwrap();

        // The clerk's refresh reads the rules before the revoke and returns late.
        store.delay_next_rule_index(Duration::from_millis(300));
        let slow = {
            let admin = admin.clone();
            let clerk_id = clerk.role_id;
            tokio::spawn(async move {
                let invoice = PermissionDefinition::new().grant("Invoice", "get", Relation::Own, ["id"]);
                admin.add_permissions(clerk_id, &invoice).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        admin
            .remove_permission(cashier.role_id, "Balance", "get", "own")
            .await
            .unwrap();
        assert!(!checker.can(&["Cashier"], "get", "own", "Balance", &["amount"]));

        slow.await.unwrap().unwrap();
        assert!(!checker.can(&["Cashier"], "get", "own", "Balance", &["amount"]));
        assert!(checker.can(&["Clerk"], "get", "own", "Invoice", &["id"]));
    }

    #[tokio::test]
    async fn test_rename_and_remove_role() {
        let (store, checker, admin) = setup();
        let role = admin.create_role("Cashier").await.unwrap();
        admin.create_role("Clerk").await.unwrap();
        admin.add_permissions(role.role_id, &balance_grant()).await.unwrap();

        let err = admin.update_role(role.role_id, "Clerk").await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        admin.update_role(role.role_id, "Teller").await.unwrap();
        assert!(checker.can(&["Teller"], "get", "own", "Balance", &["amount"]));
        assert!(!checker.can(&["Cashier"], "get", "own", "Balance", &["amount"]));

        admin.remove_role(role.role_id).await.unwrap();
        assert!(!checker.can(&["Teller"], "get", "own", "Balance", &["amount"]));
        assert_eq!(store.permission_count(), 0);
        assert!(matches!(
            admin.remove_role(role.role_id).await.unwrap_err(),
            ServiceError::NotFound(_)
        ));
    }
}
