//! Rule codec.
//!
//! Converts between the human-authored nested permission definition
//! (entity -> action -> relation -> attribute set) and flat permission rules.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::error::{ServiceError, ServiceResult};
use crate::models::{PermissionRule, Relation};

type RelationMap = BTreeMap<String, BTreeSet<String>>;
type ActionMap = BTreeMap<String, RelationMap>;

/// Nested permission definition.
///
/// Serializes as `{"Balance": {"get": {"own": ["*"]}}}`. Relation keys stay
/// strings until flattened so that unknown keys surface as validation errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionDefinition(BTreeMap<String, ActionMap>);

impl PermissionDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: grant `action` on `entity` under `relation` for `attributes`.
    ///
    /// Attributes granted twice for the same leaf are merged.
    pub fn grant<I, S>(
        mut self,
        entity: impl Into<String>,
        action: impl Into<String>,
        relation: Relation,
        attributes: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .entry(entity.into())
            .or_default()
            .entry(action.into())
            .or_default()
            .entry(relation.as_str().to_string())
            .or_default()
            .extend(attributes.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of (entity, action, relation) leaves.
    pub fn leaf_count(&self) -> usize {
        self.0
            .values()
            .flat_map(|actions| actions.values())
            .map(|relations| relations.len())
            .sum()
    }

    /// Attribute set of a single leaf, if defined.
    pub fn attributes(&self, entity: &str, action: &str, relation: Relation) -> Option<&BTreeSet<String>> {
        self.0
            .get(entity)
            .and_then(|actions| actions.get(action))
            .and_then(|relations| relations.get(relation.as_str()))
    }

    /// Insert a raw leaf, keeping an existing one untouched.
    fn insert_first(&mut self, entity: &str, action: &str, relation: &str, attributes: BTreeSet<String>) {
        self.0
            .entry(entity.to_string())
            .or_default()
            .entry(action.to_string())
            .or_default()
            .entry(relation.to_string())
            .or_insert(attributes);
    }
}

/// Flatten a definition into one rule per (entity, action, relation) leaf.
pub fn definition_to_rules(
    role_id: Uuid,
    definition: &PermissionDefinition,
) -> ServiceResult<Vec<PermissionRule>> {
    let mut rules = Vec::with_capacity(definition.leaf_count());

    for (entity, actions) in &definition.0 {
        validate_name("entity", entity, Some(MAX_ENTITY_LEN))?;
        for (action, relations) in actions {
            validate_name("action", action, Some(MAX_ACTION_LEN))?;
            for (relation_key, attributes) in relations {
                let relation: Relation = relation_key.parse().map_err(|e: String| {
                    ServiceError::Validation(format!("{} (at {}.{})", e, entity, action))
                })?;
                if attributes.is_empty() {
                    return Err(ServiceError::Validation(format!(
                        "Empty attribute set for {}.{}.{}",
                        entity, action, relation
                    )));
                }
                for attribute in attributes {
                    validate_name("attribute", attribute, None)?;
                }
                // BTreeSet iteration yields the canonical sorted order.
                rules.push(PermissionRule::new(
                    role_id,
                    entity.as_str(),
                    action.as_str(),
                    relation,
                    attributes.iter().cloned(),
                ));
            }
        }
    }

    Ok(rules)
}

/// Group flat rules back into a nested definition.
///
/// The first rule seen for an (entity, action, relation) key wins.
pub fn rules_to_definition(rules: &[PermissionRule]) -> PermissionDefinition {
    let mut definition = PermissionDefinition::new();
    for rule in rules {
        definition.insert_first(
            &rule.entity,
            &rule.action,
            rule.relation.as_str(),
            rule.attributes.iter().cloned().collect(),
        );
    }
    definition
}

// Column widths of `permissions.entity` and `permissions.action`.
const MAX_ENTITY_LEN: usize = 128;
const MAX_ACTION_LEN: usize = 64;

fn validate_name(kind: &str, value: &str, max_len: Option<usize>) -> ServiceResult<()> {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return Err(ServiceError::Validation(format!(
            "Invalid {} name: {:?}",
            kind, value
        )));
    }
    if let Some(max_len) = max_len {
        if value.chars().count() > max_len {
            return Err(ServiceError::Validation(format!(
                "{} name must be at most {} characters",
                kind, max_len
            )));
        }
    }
    Ok(())
}
