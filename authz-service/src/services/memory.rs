//! In-process role store.
//!
//! Used by the test suites and for running the service without PostgreSQL.
//! Enforces the same identity constraints as the database schema.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::error::{ServiceError, ServiceResult};
use super::store::{NamedRule, RoleStore};
use crate::models::{AssignedRole, PermissionRule, Role, RoleUserType, UserType};

#[derive(Default)]
struct MemoryState {
    roles: BTreeMap<Uuid, Role>,
    permissions: Vec<PermissionRule>,
    user_types: BTreeSet<(Uuid, UserType)>,
    assignments: Vec<AssignedRole>,
}

#[derive(Default)]
pub struct MemoryRoleStore {
    state: Mutex<MemoryState>,
    writes: AtomicU64,
    fail_writes: AtomicBool,
    rule_index_delay_ms: AtomicU64,
}

impl MemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls that changed state.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent mutating call fail with a database error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay the next `load_rule_index` call by `delay` after it has read the
    /// rules, so it returns data that may already be stale.
    pub fn delay_next_rule_index(&self, delay: Duration) {
        self.rule_index_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of stored permission rules across all roles.
    pub fn permission_count(&self) -> usize {
        self.lock().map(|s| s.permissions.len()).unwrap_or_default()
    }

    /// Number of stored user type links across all roles.
    pub fn user_type_link_count(&self) -> usize {
        self.lock().map(|s| s.user_types.len()).unwrap_or_default()
    }

    fn lock(&self) -> ServiceResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }

    /// Lock for a write, failing if write failures are being simulated.
    fn lock_for_write(&self) -> ServiceResult<MutexGuard<'_, MemoryState>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ServiceError::Database(anyhow::anyhow!(
                "Simulated write failure"
            )));
        }
        self.lock()
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoleStore for MemoryRoleStore {
    async fn health_check(&self) -> ServiceResult<()> {
        self.lock().map(|_| ())
    }

    async fn find_role_by_name(&self, name: &str) -> ServiceResult<Option<Role>> {
        let state = self.lock()?;
        Ok(state.roles.values().find(|r| r.name == name).cloned())
    }

    async fn find_role_by_id(&self, role_id: Uuid) -> ServiceResult<Option<Role>> {
        Ok(self.lock()?.roles.get(&role_id).cloned())
    }

    async fn list_roles(&self) -> ServiceResult<Vec<Role>> {
        let state = self.lock()?;
        let mut roles: Vec<Role> = state.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn save_role(&self, role: &Role) -> ServiceResult<Role> {
        let mut state = self.lock_for_write()?;
        if state
            .roles
            .values()
            .any(|r| r.name == role.name && r.role_id != role.role_id)
        {
            return Err(ServiceError::Conflict(format!(
                "Role with name '{}' already exists",
                role.name
            )));
        }
        state.roles.insert(role.role_id, role.clone());
        self.record_write();
        Ok(role.clone())
    }

    async fn delete_role(&self, role_id: Uuid) -> ServiceResult<bool> {
        let mut state = self.lock_for_write()?;
        if state.roles.remove(&role_id).is_none() {
            return Ok(false);
        }
        state.permissions.retain(|p| p.role_id != role_id);
        state.user_types.retain(|(id, _)| *id != role_id);
        state.assignments.retain(|a| a.role_id != role_id);
        self.record_write();
        Ok(true)
    }

    async fn delete_roles_not_in(
        &self,
        names: &[String],
        system_default: bool,
    ) -> ServiceResult<Vec<Role>> {
        let mut state = self.lock_for_write()?;
        let doomed: Vec<Role> = state
            .roles
            .values()
            .filter(|r| r.system_default == system_default && !names.contains(&r.name))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Ok(doomed);
        }
        for role in &doomed {
            state.roles.remove(&role.role_id);
            state.permissions.retain(|p| p.role_id != role.role_id);
            state.user_types.retain(|(id, _)| *id != role.role_id);
            state.assignments.retain(|a| a.role_id != role.role_id);
        }
        self.record_write();
        Ok(doomed)
    }

    async fn find_permissions(&self, role_id: Uuid) -> ServiceResult<Vec<PermissionRule>> {
        let state = self.lock()?;
        Ok(state
            .permissions
            .iter()
            .filter(|p| p.role_id == role_id)
            .cloned()
            .collect())
    }

    async fn save_permissions(&self, rules: &[PermissionRule]) -> ServiceResult<()> {
        if rules.is_empty() {
            return Ok(());
        }
        let mut state = self.lock_for_write()?;
        for (i, rule) in rules.iter().enumerate() {
            if !state.roles.contains_key(&rule.role_id) {
                return Err(ServiceError::NotFound(format!(
                    "Role {} not found",
                    rule.role_id
                )));
            }
            let duplicate = state.permissions.iter().any(|p| p.same_key(rule))
                || rules[..i].iter().any(|p| p.same_key(rule));
            if duplicate {
                return Err(ServiceError::Conflict(format!(
                    "Permission {}.{}.{} already exists for role {}",
                    rule.entity, rule.action, rule.relation, rule.role_id
                )));
            }
        }
        state.permissions.extend(rules.iter().cloned());
        self.record_write();
        Ok(())
    }

    async fn delete_permissions(&self, rules: &[PermissionRule]) -> ServiceResult<()> {
        if rules.is_empty() {
            return Ok(());
        }
        let mut state = self.lock_for_write()?;
        let before = state.permissions.len();
        state
            .permissions
            .retain(|p| !rules.iter().any(|r| r.same_key(p)));
        if state.permissions.len() != before {
            self.record_write();
        }
        Ok(())
    }

    async fn load_rule_index(&self) -> ServiceResult<Vec<NamedRule>> {
        let rules: Vec<NamedRule> = {
            let state = self.lock()?;
            state
                .permissions
                .iter()
                .filter_map(|rule| {
                    state.roles.get(&rule.role_id).map(|role| NamedRule {
                        role_name: role.name.clone(),
                        rule: rule.clone(),
                    })
                })
                .collect()
        };

        let delay_ms = self.rule_index_delay_ms.swap(0, Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Ok(rules)
    }

    async fn find_role_user_types(&self, role_id: Uuid) -> ServiceResult<Vec<UserType>> {
        let state = self.lock()?;
        Ok(state
            .user_types
            .iter()
            .filter(|(id, _)| *id == role_id)
            .map(|(_, t)| *t)
            .collect())
    }

    async fn save_role_user_types(&self, links: &[RoleUserType]) -> ServiceResult<()> {
        if links.is_empty() {
            return Ok(());
        }
        let mut state = self.lock_for_write()?;
        for link in links {
            if !state.roles.contains_key(&link.role_id) {
                return Err(ServiceError::NotFound(format!(
                    "Role {} not found",
                    link.role_id
                )));
            }
        }
        for link in links {
            state.user_types.insert((link.role_id, link.user_type));
        }
        self.record_write();
        Ok(())
    }

    async fn delete_role_user_types(&self, links: &[RoleUserType]) -> ServiceResult<()> {
        if links.is_empty() {
            return Ok(());
        }
        let mut state = self.lock_for_write()?;
        let mut changed = false;
        for link in links {
            changed |= state.user_types.remove(&(link.role_id, link.user_type));
        }
        if changed {
            self.record_write();
        }
        Ok(())
    }

    async fn find_roles_by_user_type(&self, user_type: UserType) -> ServiceResult<Vec<Role>> {
        let state = self.lock()?;
        Ok(state
            .user_types
            .iter()
            .filter(|(_, t)| *t == user_type)
            .filter_map(|(id, _)| state.roles.get(id).cloned())
            .collect())
    }

    async fn find_assigned_roles(&self, user_id: Uuid) -> ServiceResult<Vec<Role>> {
        let state = self.lock()?;
        Ok(state
            .assignments
            .iter()
            .filter(|a| a.user_id == user_id)
            .filter_map(|a| state.roles.get(&a.role_id).cloned())
            .collect())
    }

    async fn save_assigned_role(&self, assignment: &AssignedRole) -> ServiceResult<bool> {
        let mut state = self.lock_for_write()?;
        if !state.roles.contains_key(&assignment.role_id) {
            return Err(ServiceError::NotFound(format!(
                "Role {} not found",
                assignment.role_id
            )));
        }
        if state
            .assignments
            .iter()
            .any(|a| a.user_id == assignment.user_id && a.role_id == assignment.role_id)
        {
            return Ok(false);
        }
        state.assignments.push(assignment.clone());
        self.record_write();
        Ok(true)
    }

    async fn delete_assigned_role(&self, user_id: Uuid, role_id: Uuid) -> ServiceResult<bool> {
        let mut state = self.lock_for_write()?;
        let before = state.assignments.len();
        state
            .assignments
            .retain(|a| !(a.user_id == user_id && a.role_id == role_id));
        let removed = state.assignments.len() != before;
        if removed {
            self.record_write();
        }
        Ok(removed)
    }
}
