//! Default role synchronization.
//!
//! Runs once at startup, before any request is served. Reconciles the
//! declarative default role definitions against the role store in two
//! phases: `plan` reads the store and computes a complete diff, `apply`
//! writes it. Running it twice with the same definitions writes nothing the
//! second time.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::codec::{definition_to_rules, PermissionDefinition};
use super::error::{ServiceError, ServiceResult};
use super::metrics::record_sync_changes;
use super::store::RoleStore;
use crate::models::{PermissionRule, Role, RoleUserType, UserType};

/// Declarative definition of a built-in role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultRoleDefinition {
    pub name: String,
    #[serde(default)]
    pub user_types: Vec<UserType>,
    #[serde(default)]
    pub permissions: PermissionDefinition,
}

impl DefaultRoleDefinition {
    pub fn new(
        name: impl Into<String>,
        user_types: impl IntoIterator<Item = UserType>,
        permissions: PermissionDefinition,
    ) -> Self {
        Self {
            name: name.into(),
            user_types: user_types.into_iter().collect(),
            permissions,
        }
    }
}

/// Changes required to bring one role in line with its definition.
#[derive(Debug, Clone)]
pub struct RolePlan {
    pub role: Role,
    pub create: bool,
    pub mark_default: bool,
    pub user_types_to_add: Vec<UserType>,
    pub user_types_to_delete: Vec<UserType>,
    pub rules_to_add: Vec<PermissionRule>,
    pub rules_to_remove: Vec<PermissionRule>,
}

impl RolePlan {
    pub fn is_noop(&self) -> bool {
        !self.create
            && !self.mark_default
            && self.user_types_to_add.is_empty()
            && self.user_types_to_delete.is_empty()
            && self.rules_to_add.is_empty()
            && self.rules_to_remove.is_empty()
    }
}

/// Full synchronization diff.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub roles: Vec<RolePlan>,
    /// Names of every declared default role; other default roles are retired.
    pub declared_names: Vec<String>,
}

impl SyncPlan {
    /// Roles that need at least one write.
    pub fn pending(&self) -> impl Iterator<Item = &RolePlan> {
        self.roles.iter().filter(|p| !p.is_noop())
    }
}

/// Summary of what a synchronization pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub roles_created: Vec<String>,
    pub roles_retired: Vec<String>,
    pub user_types_added: usize,
    pub user_types_removed: usize,
    pub rules_added: usize,
    pub rules_removed: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        *self == SyncReport::default()
    }
}

/// Reconciles default role definitions with the role store.
#[derive(Clone)]
pub struct RoleSynchronizer {
    store: Arc<dyn RoleStore>,
}

impl RoleSynchronizer {
    pub fn new(store: Arc<dyn RoleStore>) -> Self {
        Self { store }
    }

    /// Plan and apply in one go.
    #[instrument(skip(self, definitions), fields(definitions = definitions.len()))]
    pub async fn run(&self, definitions: &[DefaultRoleDefinition]) -> ServiceResult<SyncReport> {
        let plan = self.plan(definitions).await?;
        let report = self.apply(&plan).await?;

        if report.is_empty() {
            info!("Default roles already in sync");
        } else {
            info!(
                created = report.roles_created.len(),
                retired = report.roles_retired.len(),
                user_types_added = report.user_types_added,
                user_types_removed = report.user_types_removed,
                rules_added = report.rules_added,
                rules_removed = report.rules_removed,
                "Default roles synchronized"
            );
        }
        Ok(report)
    }

    /// Compute the complete diff without writing anything.
    ///
    /// Every definition is validated before the store is read, so a malformed
    /// definition never leaves a half-synchronized store behind.
    pub async fn plan(&self, definitions: &[DefaultRoleDefinition]) -> ServiceResult<SyncPlan> {
        validate_definitions(definitions)?;

        let roles = try_join_all(definitions.iter().map(|d| self.plan_role(d))).await?;

        Ok(SyncPlan {
            roles,
            declared_names: definitions.iter().map(|d| d.name.clone()).collect(),
        })
    }

    async fn plan_role(&self, definition: &DefaultRoleDefinition) -> ServiceResult<RolePlan> {
        let existing = self.store.find_role_by_name(&definition.name).await?;
        let create = existing.is_none();
        let role = existing.unwrap_or_else(|| Role::new(definition.name.as_str()));

        let (current_types, current_rules) = if create {
            (Vec::new(), Vec::new())
        } else {
            tokio::try_join!(
                self.store.find_role_user_types(role.role_id),
                self.store.find_permissions(role.role_id),
            )?
        };

        let declared_types: BTreeSet<UserType> = definition.user_types.iter().copied().collect();
        let current_types: BTreeSet<UserType> = current_types.into_iter().collect();

        let declared_rules = definition_to_rules(role.role_id, &definition.permissions)?;

        let rules_to_add: Vec<PermissionRule> = declared_rules
            .iter()
            .filter(|d| !current_rules.iter().any(|c| c.same_grant(d)))
            .cloned()
            .collect();
        let rules_to_remove: Vec<PermissionRule> = current_rules
            .iter()
            .filter(|c| !declared_rules.iter().any(|d| d.same_grant(c)))
            .cloned()
            .collect();

        // Every added key must be free once the removals are applied.
        for rule in &rules_to_add {
            let occupied = current_rules.iter().any(|c| c.same_key(rule))
                && !rules_to_remove.iter().any(|r| r.same_key(rule));
            if occupied {
                return Err(ServiceError::Consistency(format!(
                    "Rule {}.{}.{} of role '{}' is both unchanged and changed",
                    rule.entity, rule.action, rule.relation, role.name
                )));
            }
        }

        Ok(RolePlan {
            mark_default: !role.system_default,
            create,
            user_types_to_add: declared_types.difference(&current_types).copied().collect(),
            user_types_to_delete: current_types.difference(&declared_types).copied().collect(),
            rules_to_add,
            rules_to_remove,
            role,
        })
    }

    /// Apply a plan. Roles are reconciled concurrently; undeclared default
    /// roles are retired once every declared role is in place.
    pub async fn apply(&self, plan: &SyncPlan) -> ServiceResult<SyncReport> {
        try_join_all(plan.pending().map(|p| self.apply_role(p))).await?;

        let retired = self
            .store
            .delete_roles_not_in(&plan.declared_names, true)
            .await?;
        for role in &retired {
            info!(role = %role.name, role_id = %role.role_id, "Retired default role");
        }

        let mut report = SyncReport {
            roles_retired: retired.into_iter().map(|r| r.name).collect(),
            ..SyncReport::default()
        };
        for p in plan.pending() {
            if p.create {
                report.roles_created.push(p.role.name.clone());
            }
            report.user_types_added += p.user_types_to_add.len();
            report.user_types_removed += p.user_types_to_delete.len();
            report.rules_added += p.rules_to_add.len();
            report.rules_removed += p.rules_to_remove.len();
        }

        record_sync_changes("role_created", report.roles_created.len());
        record_sync_changes("role_retired", report.roles_retired.len());
        record_sync_changes("user_type_added", report.user_types_added);
        record_sync_changes("user_type_removed", report.user_types_removed);
        record_sync_changes("rule_added", report.rules_added);
        record_sync_changes("rule_removed", report.rules_removed);

        Ok(report)
    }

    async fn apply_role(&self, plan: &RolePlan) -> ServiceResult<()> {
        let mut role = plan.role.clone();
        let role_id = role.role_id;

        if plan.create {
            role.system_default = false;
            role = self.store.save_role(&role).await?;
        }

        let user_types = async {
            let add = links(role_id, &plan.user_types_to_add);
            let delete = links(role_id, &plan.user_types_to_delete);
            tokio::try_join!(
                self.store.save_role_user_types(&add),
                self.store.delete_role_user_types(&delete),
            )
            .map(|_| ())
        };
        // Removals first: a changed rule keeps its key.
        let rules = async {
            self.store.delete_permissions(&plan.rules_to_remove).await?;
            self.store.save_permissions(&plan.rules_to_add).await
        };
        tokio::try_join!(user_types, rules)?;

        if plan.mark_default {
            role.system_default = true;
            role.touch();
            self.store.save_role(&role).await?;
        }

        tracing::debug!(
            role = %role.name,
            created = plan.create,
            rules_added = plan.rules_to_add.len(),
            rules_removed = plan.rules_to_remove.len(),
            "Default role reconciled"
        );
        Ok(())
    }
}

fn links(role_id: Uuid, user_types: &[UserType]) -> Vec<RoleUserType> {
    user_types
        .iter()
        .map(|t| RoleUserType::new(role_id, *t))
        .collect()
}

fn validate_definitions(definitions: &[DefaultRoleDefinition]) -> ServiceResult<()> {
    let mut seen = HashSet::new();
    for definition in definitions {
        if definition.name.trim().is_empty() {
            return Err(ServiceError::Validation(
                "Default role name must not be empty".to_string(),
            ));
        }
        if !seen.insert(definition.name.as_str()) {
            return Err(ServiceError::Validation(format!(
                "Default role '{}' is declared more than once",
                definition.name
            )));
        }
        definition_to_rules(Uuid::nil(), &definition.permissions).map_err(|e| match e {
            ServiceError::Validation(msg) => {
                ServiceError::Validation(format!("Role '{}': {}", definition.name, msg))
            }
            other => other,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Relation, WILDCARD};
    use crate::services::memory::MemoryRoleStore;

    fn user_role(user_types: Vec<UserType>) -> DefaultRoleDefinition {
        DefaultRoleDefinition::new(
            "User",
            user_types,
            PermissionDefinition::new()
                .grant("Balance", "get", Relation::Own, [WILDCARD])
                .grant("Transaction", "get", Relation::Own, ["id", "amount"]),
        )
    }

    fn seller_role() -> DefaultRoleDefinition {
        DefaultRoleDefinition::new(
            "Seller",
            [UserType::LocalAdmin],
            PermissionDefinition::new().grant("Product", "create", Relation::Own, [WILDCARD]),
        )
    }

    fn setup() -> (Arc<MemoryRoleStore>, RoleSynchronizer) {
        let store = Arc::new(MemoryRoleStore::new());
        let sync = RoleSynchronizer::new(store.clone());
        (store, sync)
    }

    #[tokio::test]
    async fn test_first_run_creates_default_roles() {
        let (store, sync) = setup();
        let report = sync
            .run(&[user_role(vec![UserType::Member, UserType::Organ]), seller_role()])
            .await
            .unwrap();

        assert_eq!(report.roles_created, vec!["User", "Seller"]);
        assert_eq!(report.rules_added, 3);
        assert_eq!(report.user_types_added, 3);

        let role = store.find_role_by_name("User").await.unwrap().unwrap();
        assert!(role.system_default);
        assert_eq!(
            store.find_role_user_types(role.role_id).await.unwrap(),
            vec![UserType::Member, UserType::Organ]
        );
        assert_eq!(store.find_permissions(role.role_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let (store, sync) = setup();
        let definitions = vec![user_role(vec![UserType::Member]), seller_role()];
        sync.run(&definitions).await.unwrap();
        let writes = store.writes();
        let permissions = store.permission_count();

        let report = sync.run(&definitions).await.unwrap();

        assert!(report.is_empty());
        assert_eq!(store.writes(), writes);
        assert_eq!(store.permission_count(), permissions);
        assert_eq!(store.list_roles().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_attribute_order_does_not_cause_churn() {
        let (store, sync) = setup();
        sync.run(&[user_role(vec![UserType::Member])]).await.unwrap();

        // Same grant stored with attributes in a different order.
        let role = store.find_role_by_name("User").await.unwrap().unwrap();
        let reordered = PermissionRule::new(role.role_id, "Transaction", "get", Relation::Own, ["id", "amount"]);
        store.delete_permissions(&[reordered.clone()]).await.unwrap();
        store.save_permissions(&[reordered]).await.unwrap();
        let writes = store.writes();

        let report = sync.run(&[user_role(vec![UserType::Member])]).await.unwrap();

        assert!(report.is_empty());
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_changed_attributes_replace_rule() {
        let (store, sync) = setup();
        sync.run(&[user_role(vec![UserType::Member])]).await.unwrap();

        let changed = DefaultRoleDefinition::new(
            "User",
            [UserType::Member],
            PermissionDefinition::new()
                .grant("Balance", "get", Relation::Own, [WILDCARD])
                .grant("Transaction", "get", Relation::Own, ["id", "amount", "description"]),
        );
        let report = sync.run(&[changed]).await.unwrap();

        assert_eq!(report.rules_added, 1);
        assert_eq!(report.rules_removed, 1);
        let role = store.find_role_by_name("User").await.unwrap().unwrap();
        let rules = store.find_permissions(role.role_id).await.unwrap();
        assert_eq!(rules.len(), 2);
        let tx = rules.iter().find(|r| r.entity == "Transaction").unwrap();
        assert_eq!(tx.attribute_set().len(), 3);
    }

    #[tokio::test]
    async fn test_removed_user_type_deletes_only_that_link() {
        let (store, sync) = setup();
        sync.run(&[user_role(vec![UserType::Member, UserType::Organ]), seller_role()])
            .await
            .unwrap();

        let report = sync
            .run(&[user_role(vec![UserType::Member]), seller_role()])
            .await
            .unwrap();

        assert_eq!(report.user_types_removed, 1);
        assert_eq!(report.user_types_added, 0);
        let user = store.find_role_by_name("User").await.unwrap().unwrap();
        let seller = store.find_role_by_name("Seller").await.unwrap().unwrap();
        assert_eq!(store.find_role_user_types(user.role_id).await.unwrap(), vec![UserType::Member]);
        assert_eq!(
            store.find_role_user_types(seller.role_id).await.unwrap(),
            vec![UserType::LocalAdmin]
        );
    }

    #[tokio::test]
    async fn test_undeclared_default_role_is_retired() {
        let (store, sync) = setup();
        sync.run(&[user_role(vec![UserType::Member]), seller_role()])
            .await
            .unwrap();

        let report = sync.run(&[user_role(vec![UserType::Member])]).await.unwrap();

        assert_eq!(report.roles_retired, vec!["Seller"]);
        assert!(store.find_role_by_name("Seller").await.unwrap().is_none());
        assert_eq!(store.permission_count(), 2);
    }

    #[tokio::test]
    async fn test_administrator_roles_survive_sync() {
        let (store, sync) = setup();
        let custom = store.save_role(&Role::new("Treasurer")).await.unwrap();
        store
            .save_permissions(&[PermissionRule::new(custom.role_id, "Invoice", "get", Relation::All, [WILDCARD])])
            .await
            .unwrap();

        sync.run(&[user_role(vec![UserType::Member])]).await.unwrap();

        let treasurer = store.find_role_by_name("Treasurer").await.unwrap().unwrap();
        assert!(!treasurer.system_default);
        assert_eq!(store.find_permissions(treasurer.role_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_definition_aborts_before_any_write() {
        let (store, sync) = setup();
        let broken: PermissionDefinition =
            serde_json::from_value(serde_json::json!({"Balance": {"get": {"everyone": ["*"]}}}))
                .unwrap();
        let definitions = vec![
            user_role(vec![UserType::Member]),
            DefaultRoleDefinition::new("Broken", [UserType::Member], broken),
        ];

        let err = sync.run(&definitions).await.unwrap_err();

        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_definition_names_are_rejected() {
        let (_, sync) = setup();
        let err = sync
            .run(&[user_role(vec![UserType::Member]), user_role(vec![UserType::Organ])])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_store_failure_is_fatal() {
        let (store, sync) = setup();
        store.set_fail_writes(true);
        let result = sync.run(&[user_role(vec![UserType::Member])]).await;
        assert!(matches!(result, Err(ServiceError::Database(_))));
    }

    #[tokio::test]
    async fn test_plan_on_synced_store_is_noop() {
        let (_, sync) = setup();
        let definitions = vec![user_role(vec![UserType::Member])];
        sync.run(&definitions).await.unwrap();
        let plan = sync.plan(&definitions).await.unwrap();
        assert_eq!(plan.pending().count(), 0);
        assert_eq!(plan.declared_names, vec!["User"]);
    }
}
