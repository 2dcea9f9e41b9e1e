//! Application startup and lifecycle management.
//!
//! Default roles are synchronized and the rule snapshot loaded before the
//! listener is bound; any failure on that path aborts startup.

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::AuthzConfig;
use crate::defaults::load_role_definitions;
use crate::handlers::{authz, health, roles};
use crate::middleware::admin_key_middleware;
use crate::services::{
    init_metrics, AccessChecker, Database, DefaultRoleDefinition, MemoryRoleStore,
    RoleAdminService, RoleResolver, RoleStore, RoleSynchronizer, ServiceResult, SyncReport,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RoleStore>,
    pub checker: Arc<AccessChecker>,
    pub resolver: RoleResolver,
    pub admin: Arc<RoleAdminService>,
    pub admin_api_key: Arc<str>,
}

impl AppState {
    /// Synchronize `definitions` into `store`, then load the rule snapshot.
    pub async fn initialize(
        store: Arc<dyn RoleStore>,
        definitions: &[DefaultRoleDefinition],
        admin_api_key: &str,
    ) -> ServiceResult<(Self, SyncReport)> {
        let (checker, report) = initialize_authorization(store.clone(), definitions).await?;
        let state = Self {
            resolver: RoleResolver::new(store.clone()),
            admin: Arc::new(RoleAdminService::new(store.clone(), checker.clone())),
            checker,
            store,
            admin_api_key: Arc::from(admin_api_key),
        };
        Ok((state, report))
    }
}

/// Run the startup synchronization and build the access checker from the
/// synchronized store.
pub async fn initialize_authorization(
    store: Arc<dyn RoleStore>,
    definitions: &[DefaultRoleDefinition],
) -> ServiceResult<(Arc<AccessChecker>, SyncReport)> {
    let report = RoleSynchronizer::new(store.clone())
        .run(definitions)
        .await
        .inspect_err(|e| tracing::error!(error = %e, "Default role synchronization failed"))?;

    let checker = AccessChecker::load(store.as_ref())
        .await
        .inspect_err(|e| tracing::error!(error = %e, "Failed to load rule snapshot"))?;
    tracing::info!(rules = checker.snapshot().len(), "Rule snapshot loaded");

    Ok((Arc::new(checker), report))
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/roles", get(roles::list_roles).post(roles::create_role))
        .route(
            "/roles/:role_id",
            get(roles::get_role)
                .put(roles::update_role)
                .delete(roles::remove_role),
        )
        .route("/roles/:role_id/permissions", post(roles::add_permissions))
        .route(
            "/roles/:role_id/permissions/:entity/:action/:relation",
            delete(roles::remove_permission),
        )
        .route("/roles/:role_id/assignments", post(roles::assign_role))
        .route(
            "/roles/:role_id/assignments/:user_id",
            delete(roles::unassign_role),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_key_middleware,
        ));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        .route("/authz/check", post(authz::check))
        .route("/authz/resolve", post(authz::resolve))
        .nest("/admin", admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: AuthzConfig) -> Result<Self, AppError> {
        init_metrics();

        let store = Self::connect_store(&config).await?;
        let definitions = load_role_definitions(config.role_definitions_path.as_deref())?;
        Self::build_with_store(config, store, &definitions).await
    }

    /// Build the application on an existing store.
    pub async fn build_with_store(
        config: AuthzConfig,
        store: Arc<dyn RoleStore>,
        definitions: &[DefaultRoleDefinition],
    ) -> Result<Self, AppError> {
        let (state, _) = AppState::initialize(store, definitions, &config.admin_api_key).await?;

        let addr = config.common.bind_address();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Authz service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    async fn connect_store(config: &AuthzConfig) -> Result<Arc<dyn RoleStore>, AppError> {
        let Some(db_config) = &config.database else {
            tracing::warn!("DATABASE_URL not set - using the in-memory role store");
            return Ok(Arc::new(MemoryRoleStore::new()));
        };

        let db = Database::new(
            &db_config.url,
            db_config.max_connections,
            db_config.min_connections,
        )
        .await
        .inspect_err(|e| tracing::error!(error = %e, "Failed to connect to PostgreSQL"))?;

        db.run_migrations()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Failed to run migrations"))?;

        Ok(Arc::new(db))
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        tracing::info!(
            service = "authz-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
