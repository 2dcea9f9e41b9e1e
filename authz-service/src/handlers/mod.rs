//! HTTP handlers for authz-service.

pub mod authz;
pub mod health;
pub mod roles;
