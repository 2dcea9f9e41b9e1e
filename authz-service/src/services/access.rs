//! Access checker.
//!
//! Decides whether a set of roles may perform an action on an entity for a
//! set of attributes. Decisions are pure functions of an immutable rule
//! snapshot: no I/O happens inside a check, and refreshes swap the whole
//! snapshot at once.

use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::error::ServiceResult;
use super::metrics::{record_access_decision, record_snapshot_refresh};
use super::store::{NamedRule, RoleStore};
use crate::models::{Relation, WILDCARD};

/// Attributes covered for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coverage {
    /// No rule matched.
    Denied,
    /// A wildcard rule matched.
    Total,
    /// Union of the attribute sets of the matching rules.
    Partial(BTreeSet<String>),
}

impl Coverage {
    pub fn covers(&self, attribute: &str) -> bool {
        match self {
            Coverage::Denied => false,
            Coverage::Total => true,
            Coverage::Partial(set) => set.contains(attribute),
        }
    }

    /// Grant iff a rule matched and every requested attribute is covered.
    pub fn covers_all<S: AsRef<str>>(&self, attributes: &[S]) -> bool {
        match self {
            Coverage::Denied => false,
            _ => attributes.iter().all(|a| self.covers(a.as_ref())),
        }
    }
}

#[derive(Debug, Clone)]
struct Grant {
    role_name: String,
    relation: Relation,
    attributes: Vec<String>,
    wildcard: bool,
}

/// Immutable index of every permission rule, keyed by entity then action.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    grants: HashMap<String, HashMap<String, Vec<Grant>>>,
    rule_count: usize,
}

impl RuleSnapshot {
    pub fn from_rules(rules: impl IntoIterator<Item = NamedRule>) -> Self {
        let mut snapshot = RuleSnapshot::default();
        for NamedRule { role_name, rule } in rules {
            let wildcard = rule.is_wildcard();
            snapshot
                .grants
                .entry(rule.entity)
                .or_default()
                .entry(rule.action)
                .or_default()
                .push(Grant {
                    role_name,
                    relation: rule.relation,
                    attributes: rule.attributes,
                    wildcard,
                });
            snapshot.rule_count += 1;
        }
        snapshot
    }

    /// Number of rules in the snapshot.
    pub fn len(&self) -> usize {
        self.rule_count
    }

    pub fn is_empty(&self) -> bool {
        self.rule_count == 0
    }

    /// Attributes the roles may access for `action` on `entity` under `relation`.
    pub fn coverage<R: AsRef<str>>(
        &self,
        role_names: &[R],
        action: &str,
        relation: &str,
        entity: &str,
    ) -> Coverage {
        let Ok(requested) = relation.parse::<Relation>() else {
            return Coverage::Denied;
        };
        let Some(grants) = self.grants.get(entity).and_then(|actions| actions.get(action)) else {
            return Coverage::Denied;
        };

        let roles: HashSet<&str> = role_names.iter().map(|r| r.as_ref()).collect();
        let mut matched = false;
        let mut covered = BTreeSet::new();

        for grant in grants
            .iter()
            .filter(|g| roles.contains(g.role_name.as_str()) && g.relation.satisfies(requested))
        {
            if grant.wildcard {
                return Coverage::Total;
            }
            matched = true;
            covered.extend(grant.attributes.iter().cloned());
        }

        if matched {
            Coverage::Partial(covered)
        } else {
            Coverage::Denied
        }
    }
}

/// Runtime access decision function over a swappable rule snapshot.
pub struct AccessChecker {
    snapshot: RwLock<Arc<RuleSnapshot>>,
    /// Held across load and swap so a slower refresh cannot overwrite a newer one.
    refresh_guard: Mutex<()>,
}

impl Default for AccessChecker {
    fn default() -> Self {
        Self::new(RuleSnapshot::default())
    }
}

impl AccessChecker {
    pub fn new(snapshot: RuleSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            refresh_guard: Mutex::new(()),
        }
    }

    /// Build a checker from the current store contents.
    pub async fn load(store: &dyn RoleStore) -> ServiceResult<Self> {
        let checker = Self::default();
        checker.refresh(store).await?;
        Ok(checker)
    }

    /// Rebuild the snapshot from the store and swap it in.
    ///
    /// The new snapshot is built completely before the swap; readers see
    /// either the old or the new rule set, never a mix. Concurrent refreshes
    /// run one at a time, so the last one to finish read the latest rules.
    #[instrument(skip_all)]
    pub async fn refresh(&self, store: &dyn RoleStore) -> ServiceResult<usize> {
        let _guard = self.refresh_guard.lock().await;
        let rules = match store.load_rule_index().await {
            Ok(rules) => rules,
            Err(e) => {
                record_snapshot_refresh(false);
                return Err(e);
            }
        };
        let snapshot = RuleSnapshot::from_rules(rules);
        let count = snapshot.len();
        self.replace(snapshot);
        record_snapshot_refresh(true);
        debug!(rules = count, "Rule snapshot refreshed");
        Ok(count)
    }

    /// Swap in a new snapshot.
    pub fn replace(&self, snapshot: RuleSnapshot) {
        let snapshot = Arc::new(snapshot);
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = snapshot;
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Boolean gate. Unknown roles, relations or entities deny.
    pub fn can<R: AsRef<str>, A: AsRef<str>>(
        &self,
        role_names: &[R],
        action: &str,
        relation: &str,
        entity: &str,
        attributes: &[A],
    ) -> bool {
        let granted = self
            .covered_attributes(role_names, action, relation, entity)
            .covers_all(attributes);
        record_access_decision(granted);
        granted
    }

    pub fn covered_attributes<R: AsRef<str>>(
        &self,
        role_names: &[R],
        action: &str,
        relation: &str,
        entity: &str,
    ) -> Coverage {
        self.snapshot()
            .coverage(role_names, action, relation, entity)
    }

    /// Subset of `requested` the roles may access, in request order.
    pub fn visible_attributes<R: AsRef<str>, A: AsRef<str>>(
        &self,
        role_names: &[R],
        action: &str,
        relation: &str,
        entity: &str,
        requested: &[A],
    ) -> Vec<String> {
        let coverage = self.covered_attributes(role_names, action, relation, entity);
        requested
            .iter()
            .map(|a| a.as_ref())
            .filter(|a| *a != WILDCARD && coverage.covers(a))
            .map(str::to_string)
            .collect()
    }

    /// Strip a JSON record down to the fields the roles may see.
    ///
    /// Returns `None` when nothing is visible or the record is not an object
    /// and coverage is partial.
    pub fn filter_record<R: AsRef<str>>(
        &self,
        role_names: &[R],
        action: &str,
        relation: &str,
        entity: &str,
        record: &Value,
    ) -> Option<Value> {
        match self.covered_attributes(role_names, action, relation, entity) {
            Coverage::Denied => None,
            Coverage::Total => Some(record.clone()),
            Coverage::Partial(fields) => {
                let object = record.as_object()?;
                let filtered: Map<String, Value> = object
                    .iter()
                    .filter(|(k, _)| fields.contains(k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Some(Value::Object(filtered))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PermissionRule;
    use serde_json::json;
    use uuid::Uuid;

    fn named(role: &str, entity: &str, action: &str, relation: Relation, attrs: &[&str]) -> NamedRule {
        NamedRule {
            role_name: role.to_string(),
            rule: PermissionRule::new(Uuid::new_v4(), entity, action, relation, attrs.iter().copied()),
        }
    }

    fn checker() -> AccessChecker {
        AccessChecker::new(RuleSnapshot::from_rules(vec![
            named("User", "Balance", "get", Relation::Own, &["*"]),
            named("User", "Transaction", "get", Relation::Own, &["id", "amount"]),
            named("Organ", "Transaction", "get", Relation::Organ, &["id", "amount", "from"]),
            named("Auditor", "Transaction", "get", Relation::All, &["id", "createdAt"]),
            named("Admin", "Invoice", "update", Relation::All, &["*"]),
        ]))
    }

    #[test]
    fn test_wildcard_covers_any_field() {
        let checker = checker();
        for field in ["amount", "id", "anyField", "x"] {
            assert!(checker.can(&["User"], "get", "own", "Balance", &[field]));
        }
    }

    #[test]
    fn test_concrete_balance_scenario() {
        let checker = checker();
        assert!(checker.can(&["User"], "get", "own", "Balance", &["amount"]));
        assert!(!checker.can(&["User"], "get", "all", "Balance", &["amount"]));
    }

    #[test]
    fn test_all_relation_subsumes_own() {
        let checker = checker();
        assert!(checker.can(&["Auditor"], "get", "own", "Transaction", &["id"]));
        assert!(checker.can(&["Admin"], "update", "created", "Invoice", &["total"]));
    }

    #[test]
    fn test_own_does_not_satisfy_all() {
        let checker = checker();
        assert!(!checker.can(&["User"], "get", "all", "Transaction", &["id"]));
    }

    #[test]
    fn test_deny_by_default() {
        let checker = checker();
        let no_roles: [&str; 0] = [];
        assert!(!checker.can(&no_roles, "get", "own", "Balance", &["amount"]));
        assert!(!checker.can(&["UnknownRole"], "get", "own", "Balance", &["amount"]));
        assert!(!checker.can(&["User"], "delete", "own", "Balance", &["amount"]));
        assert!(!checker.can(&["User"], "get", "own", "Voucher", &["id"]));
        assert!(!checker.can(&["User"], "get", "mine", "Balance", &["amount"]));
    }

    #[test]
    fn test_empty_attribute_request_needs_a_matching_rule() {
        let checker = checker();
        let none: [&str; 0] = [];
        assert!(checker.can(&["User"], "get", "own", "Transaction", &none));
        assert!(!checker.can(&["User"], "get", "all", "Transaction", &none));
    }

    #[test]
    fn test_attributes_accumulate_across_roles_and_relations() {
        let checker = checker();
        // "from" only comes from Organ, "createdAt" only from Auditor's all-grant.
        assert!(!checker.can(&["User"], "get", "own", "Transaction", &["id", "createdAt"]));
        assert!(checker.can(&["User", "Auditor"], "get", "own", "Transaction", &["amount", "createdAt"]));
        assert!(!checker.can(&["User", "Organ"], "get", "own", "Transaction", &["from"]));
        assert!(checker.can(&["User", "Organ", "Auditor"], "get", "organ", "Transaction", &["from", "createdAt"]));
    }

    #[test]
    fn test_partial_attribute_request_denied() {
        let checker = checker();
        assert!(!checker.can(&["User"], "get", "own", "Transaction", &["id", "description"]));
        assert_eq!(
            checker.visible_attributes(&["User"], "get", "own", "Transaction", &["id", "description", "amount"]),
            vec!["id", "amount"]
        );
    }

    #[test]
    fn test_duplicate_role_names_do_not_change_outcome() {
        let checker = checker();
        assert!(checker.can(&["User", "User"], "get", "own", "Transaction", &["id"]));
        assert_eq!(
            checker.covered_attributes(&["User", "User"], "get", "own", "Transaction"),
            Coverage::Partial(["amount", "id"].iter().map(|s| s.to_string()).collect())
        );
    }

    #[test]
    fn test_filter_record() {
        let checker = checker();
        let record = json!({"id": 7, "amount": 250, "description": "beer", "from": 3});

        assert_eq!(
            checker.filter_record(&["User"], "get", "own", "Transaction", &record),
            Some(json!({"id": 7, "amount": 250}))
        );
        assert_eq!(
            checker.filter_record(&["User"], "get", "own", "Balance", &json!({"amount": 1})),
            Some(json!({"amount": 1}))
        );
        assert_eq!(
            checker.filter_record(&["Nobody"], "get", "own", "Transaction", &record),
            None
        );
    }

    #[test]
    fn test_replace_swaps_whole_snapshot() {
        let checker = checker();
        let before = checker.snapshot();
        checker.replace(RuleSnapshot::from_rules(vec![named(
            "User",
            "Balance",
            "get",
            Relation::All,
            &["amount"],
        )]));

        // Readers holding the old snapshot keep a consistent view.
        assert_eq!(before.len(), 5);
        assert_eq!(checker.snapshot().len(), 1);
        assert!(checker.can(&["User"], "get", "all", "Balance", &["amount"]));
        assert!(!checker.can(&["User"], "get", "own", "Transaction", &["id"]));
    }

    #[test]
    fn test_concurrent_reads_during_refresh() {
        let checker = Arc::new(checker());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let checker = checker.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if i == 0 {
                            checker.replace(RuleSnapshot::from_rules(vec![named(
                                "User",
                                "Balance",
                                "get",
                                Relation::Own,
                                &["*"],
                            )]));
                        }
                        assert!(checker.can(&["User"], "get", "own", "Balance", &["amount"]));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
