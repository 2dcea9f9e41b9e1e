//! Common test utilities for authz-service integration tests.
#![allow(dead_code)]

use authz_service::services::{
    Database, DefaultRoleDefinition, MemoryRoleStore, PermissionDefinition, RoleStore,
};
use authz_service::models::{Relation, UserType, WILDCARD};
use authz_service::startup::{build_router, AppState};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::{Arc, Once};
use tower::ServiceExt;

pub const TEST_ADMIN_KEY: &str = "test-admin-key";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,authz_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// The `User` role of the concrete Balance scenario plus a `Seller` role.
pub fn sample_definitions() -> Vec<DefaultRoleDefinition> {
    vec![
        DefaultRoleDefinition::new(
            "User",
            [UserType::Member, UserType::LocalUser],
            PermissionDefinition::new()
                .grant("Balance", "get", Relation::Own, [WILDCARD])
                .grant("Transaction", "get", Relation::Own, ["id", "amount", "createdAt"]),
        ),
        DefaultRoleDefinition::new(
            "Seller",
            [UserType::LocalAdmin],
            PermissionDefinition::new()
                .grant("Product", "create", Relation::Own, [WILDCARD])
                .grant("Product", "get", Relation::All, ["id", "name", "price"]),
        ),
    ]
}

/// Application state on a fresh in-memory store.
pub async fn spawn_state(definitions: &[DefaultRoleDefinition]) -> (Arc<MemoryRoleStore>, AppState) {
    init_tracing();
    let store = Arc::new(MemoryRoleStore::new());
    let (state, _) = AppState::initialize(store.clone(), definitions, TEST_ADMIN_KEY)
        .await
        .expect("Failed to initialize authorization");
    (store, state)
}

/// Router on a fresh in-memory store synchronized with `sample_definitions`.
pub async fn spawn_router() -> (Arc<MemoryRoleStore>, AppState, Router) {
    let (store, state) = spawn_state(&sample_definitions()).await;
    let router = build_router(state.clone());
    (store, state, router)
}

/// Connect to the test database and apply migrations.
pub async fn connect_postgres() -> Arc<dyn RoleStore> {
    init_tracing();

    let database_url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run PostgreSQL tests");
    let db = Database::new(&database_url, 2, 1)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");
    Arc::new(db)
}

/// Send a request through the router and decode the JSON body (`Value::Null` if empty).
pub async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    admin_key: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = admin_key {
        builder = builder.header("x-admin-api-key", key);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}
