//! Built-in role definitions.
//!
//! The platform ships a fixed, ordered set of system default roles. A JSON
//! file with the same shape can replace them at deploy time.

use std::path::Path;
use tracing::info;

use crate::models::{Relation, UserType, WILDCARD};
use crate::services::{DefaultRoleDefinition, PermissionDefinition, ServiceError, ServiceResult};

use UserType::*;

/// User types of real people who can buy things.
const BUYERS: [UserType; 6] = [Member, Voting, LocalUser, LocalAdmin, Invoice, AutomaticInvoice];

pub fn builtin_roles() -> Vec<DefaultRoleDefinition> {
    vec![
        DefaultRoleDefinition::new(
            "User",
            [Member, Organ, Voting, LocalUser, LocalAdmin, Invoice, AutomaticInvoice],
            PermissionDefinition::new()
                .grant("Balance", "get", Relation::Own, [WILDCARD])
                .grant("Transaction", "get", Relation::Own, [WILDCARD])
                .grant("Transfer", "get", Relation::Own, [WILDCARD])
                .grant("User", "get", Relation::Own, [WILDCARD])
                .grant("User", "update", Relation::Own, ["email", "acceptedToS", "extensiveDataProcessing"])
                .grant("Product", "get", Relation::All, [WILDCARD])
                .grant("Container", "get", Relation::All, [WILDCARD])
                .grant("PointOfSale", "get", Relation::All, [WILDCARD])
                .grant("Banner", "get", Relation::All, [WILDCARD]),
        ),
        DefaultRoleDefinition::new(
            "Buyer",
            BUYERS,
            PermissionDefinition::new().grant("Transaction", "create", Relation::Own, [WILDCARD]),
        ),
        DefaultRoleDefinition::new(
            "Authorized Buyer",
            [Member, Voting, LocalUser, LocalAdmin, AutomaticInvoice],
            PermissionDefinition::new()
                .grant("Transaction", "create", Relation::Created, [WILDCARD])
                .grant("Transaction", "get", Relation::Created, [WILDCARD]),
        ),
        DefaultRoleDefinition::new(
            "Invoice",
            [Invoice, AutomaticInvoice],
            PermissionDefinition::new().grant("Invoice", "get", Relation::Own, [WILDCARD]),
        ),
        DefaultRoleDefinition::new(
            "Organ",
            [Organ],
            PermissionDefinition::new()
                .grant("Balance", "get", Relation::Organ, [WILDCARD])
                .grant("Transaction", "get", Relation::Organ, [WILDCARD])
                .grant("Product", "create", Relation::Organ, [WILDCARD])
                .grant("Product", "update", Relation::Organ, ["name", "priceInclVat", "vat", "category", "alcoholPercentage"])
                .grant("Container", "update", Relation::Organ, ["name", "products", "public"])
                .grant("PointOfSale", "update", Relation::Organ, ["name", "containers", "useAuthentication"]),
        ),
        DefaultRoleDefinition::new(
            "Point of Sale",
            [PointOfSale],
            PermissionDefinition::new()
                .grant("Transaction", "create", Relation::Own, [WILDCARD])
                .grant("Transaction", "get", Relation::Created, [WILDCARD])
                .grant("PointOfSale", "get", Relation::Own, [WILDCARD])
                .grant("User", "get", Relation::All, ["id", "firstName", "lastName", "nickname", "type"]),
        ),
        DefaultRoleDefinition::new(
            "Auditor",
            Vec::<UserType>::new(),
            PermissionDefinition::new()
                .grant("Balance", "get", Relation::All, [WILDCARD])
                .grant("Transaction", "get", Relation::All, [WILDCARD])
                .grant("Transfer", "get", Relation::All, [WILDCARD])
                .grant("Invoice", "get", Relation::All, [WILDCARD])
                .grant("User", "get", Relation::All, ["id", "firstName", "lastName", "type", "active"]),
        ),
    ]
}

/// Definitions to synchronize: the file at `path` if given, the built-ins otherwise.
pub fn load_role_definitions(path: Option<&Path>) -> ServiceResult<Vec<DefaultRoleDefinition>> {
    let Some(path) = path else {
        return Ok(builtin_roles());
    };

    let raw = std::fs::read_to_string(path).map_err(|e| {
        ServiceError::Validation(format!(
            "Cannot read role definitions from {}: {}",
            path.display(),
            e
        ))
    })?;
    let definitions = parse_role_definitions(&raw)?;
    info!(
        path = %path.display(),
        roles = definitions.len(),
        "Loaded role definitions from file"
    );
    Ok(definitions)
}

pub fn parse_role_definitions(raw: &str) -> ServiceResult<Vec<DefaultRoleDefinition>> {
    serde_json::from_str(raw)
        .map_err(|e| ServiceError::Validation(format!("Invalid role definitions: {}", e)))
}
