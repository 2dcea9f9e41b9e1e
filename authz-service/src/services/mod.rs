//! Services module for authz-service.

pub mod access;
pub mod admin;
pub mod codec;
pub mod database;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod resolver;
pub mod store;
pub mod sync;

pub use access::{AccessChecker, Coverage, RuleSnapshot};
pub use admin::{RoleAdminService, RoleDetails};
pub use codec::{definition_to_rules, rules_to_definition, PermissionDefinition};
pub use database::Database;
pub use error::{ServiceError, ServiceResult};
pub use memory::MemoryRoleStore;
pub use metrics::{get_metrics, init_metrics};
pub use resolver::{Principal, RoleResolver};
pub use store::{NamedRule, RoleStore};
pub use sync::{DefaultRoleDefinition, RoleSynchronizer, SyncPlan, SyncReport};
