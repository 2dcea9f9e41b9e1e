//! Authz Service - role-based access control for the point-of-sale ledger.
//!
//! Synchronizes the built-in roles at startup, answers attribute-level access
//! checks from an in-memory rule snapshot, and exposes role administration.

pub mod config;
pub mod defaults;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

pub use startup::AppState;
