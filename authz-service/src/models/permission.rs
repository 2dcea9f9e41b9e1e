//! Permission rule model - the atomic authorization fact.
//!
//! A rule grants `action` on `entity`, scoped to an ownership `relation`,
//! for a set of attributes. `"*"` grants every attribute.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Attribute name that covers every attribute of an entity.
pub const WILDCARD: &str = "*";

/// Ownership scope of a grant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    /// Records owned by the principal.
    Own,
    /// Records created by the principal.
    Created,
    /// Records owned by an organ the principal belongs to.
    Organ,
    /// Every record; subsumes all other relations.
    All,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Own => "own",
            Self::Created => "created",
            Self::Organ => "organ",
            Self::All => "all",
        }
    }

    /// Whether a grant with this relation satisfies a request for `requested`.
    pub fn satisfies(&self, requested: Relation) -> bool {
        *self == requested || *self == Relation::All
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Relation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "own" => Ok(Self::Own),
            "created" => Ok(Self::Created),
            "organ" => Ok(Self::Organ),
            "all" => Ok(Self::All),
            _ => Err(format!("Invalid relation: {}", s)),
        }
    }
}

/// Permission rule owned by a role.
///
/// Identity is `(role_id, entity, action, relation)`; `attributes` is payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PermissionRule {
    pub role_id: Uuid,
    pub entity: String,
    pub action: String,
    pub relation: Relation,
    pub attributes: Vec<String>,
}

impl PermissionRule {
    pub fn new<I, S>(
        role_id: Uuid,
        entity: impl Into<String>,
        action: impl Into<String>,
        relation: Relation,
        attributes: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role_id,
            entity: entity.into(),
            action: action.into(),
            relation,
            attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether both rules share the `(role_id, entity, action, relation)` identity.
    pub fn same_key(&self, other: &PermissionRule) -> bool {
        self.role_id == other.role_id
            && self.entity == other.entity
            && self.action == other.action
            && self.relation == other.relation
    }

    /// Key equality plus order-independent attribute equality.
    pub fn same_grant(&self, other: &PermissionRule) -> bool {
        self.same_key(other) && same_attributes(&self.attributes, &other.attributes)
    }

    /// Sorted, de-duplicated attribute set.
    pub fn attribute_set(&self) -> BTreeSet<&str> {
        self.attributes.iter().map(String::as_str).collect()
    }

    /// Whether this rule covers every attribute.
    pub fn is_wildcard(&self) -> bool {
        self.attributes.iter().any(|a| a == WILDCARD)
    }
}

/// Compare two attribute lists as sets.
pub(crate) fn same_attributes(a: &[String], b: &[String]) -> bool {
    let left: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let right: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    left == right
}
