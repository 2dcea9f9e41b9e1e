//! PostgreSQL role store for authz-service.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::error::{ServiceError, ServiceResult};
use super::metrics::DB_QUERY_DURATION;
use super::store::{NamedRule, RoleStore};
use crate::models::{AssignedRole, PermissionRule, Relation, Role, RoleUserType, UserType};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct NamedRuleRow {
    role_name: String,
    role_id: Uuid,
    entity: String,
    action: String,
    relation: Relation,
    attributes: Vec<String>,
}

impl From<NamedRuleRow> for NamedRule {
    fn from(row: NamedRuleRow) -> Self {
        NamedRule {
            role_name: row.role_name,
            rule: PermissionRule {
                role_id: row.role_id,
                entity: row.entity,
                action: row.action,
                relation: row.relation,
                attributes: row.attributes,
            },
        }
    }
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "authz-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> ServiceResult<Self> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| ServiceError::Database(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> ServiceResult<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ServiceError::Database(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

fn map_write_error(e: sqlx::Error, what: &str) -> ServiceError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            ServiceError::Conflict(format!("{} already exists", what))
        }
        sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
            ServiceError::NotFound(format!("{} references a missing role", what))
        }
        _ => ServiceError::Database(anyhow::anyhow!("Failed to write {}: {}", what, e)),
    }
}

#[async_trait]
impl RoleStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> ServiceResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ServiceError::Database(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Role Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn find_role_by_name(&self, name: &str) -> ServiceResult<Option<Role>> {
        let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(role)
    }

    #[instrument(skip(self))]
    async fn find_role_by_id(&self, role_id: Uuid) -> ServiceResult<Option<Role>> {
        let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE role_id = $1")
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(role)
    }

    #[instrument(skip(self))]
    async fn list_roles(&self) -> ServiceResult<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>("SELECT * FROM roles ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(roles)
    }

    #[instrument(skip(self, role), fields(role_id = %role.role_id, name = %role.name))]
    async fn save_role(&self, role: &Role) -> ServiceResult<Role> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_role"])
            .start_timer();

        let saved = sqlx::query_as::<_, Role>(
            r#"
            INSERT INTO roles (role_id, name, system_default, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (role_id) DO UPDATE
            SET name = EXCLUDED.name,
                system_default = EXCLUDED.system_default,
                updated_utc = EXCLUDED.updated_utc
            RETURNING role_id, name, system_default, created_utc, updated_utc
            "#,
        )
        .bind(role.role_id)
        .bind(&role.name)
        .bind(role.system_default)
        .bind(role.created_utc)
        .bind(role.updated_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error(e, &format!("Role '{}'", role.name)))?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self))]
    async fn delete_role(&self, role_id: Uuid) -> ServiceResult<bool> {
        let result = sqlx::query("DELETE FROM roles WHERE role_id = $1")
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, names), fields(declared = names.len()))]
    async fn delete_roles_not_in(
        &self,
        names: &[String],
        system_default: bool,
    ) -> ServiceResult<Vec<Role>> {
        let deleted = sqlx::query_as::<_, Role>(
            r#"
            DELETE FROM roles
            WHERE system_default = $1 AND NOT (name = ANY($2))
            RETURNING role_id, name, system_default, created_utc, updated_utc
            "#,
        )
        .bind(system_default)
        .bind(names)
        .fetch_all(&self.pool)
        .await?;
        Ok(deleted)
    }

    // -------------------------------------------------------------------------
    // Permission Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn find_permissions(&self, role_id: Uuid) -> ServiceResult<Vec<PermissionRule>> {
        let rules = sqlx::query_as::<_, PermissionRule>(
            r#"
            SELECT role_id, entity, action, relation, attributes
            FROM permissions
            WHERE role_id = $1
            ORDER BY entity, action, relation
            "#,
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    #[instrument(skip(self, rules), fields(count = rules.len()))]
    async fn save_permissions(&self, rules: &[PermissionRule]) -> ServiceResult<()> {
        if rules.is_empty() {
            return Ok(());
        }
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_permissions"])
            .start_timer();

        let mut tx = self.pool.begin().await?;
        for rule in rules {
            sqlx::query(
                r#"
                INSERT INTO permissions (role_id, entity, action, relation, attributes)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(rule.role_id)
            .bind(&rule.entity)
            .bind(&rule.action)
            .bind(rule.relation)
            .bind(&rule.attributes)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                map_write_error(
                    e,
                    &format!("Permission {}.{}.{}", rule.entity, rule.action, rule.relation),
                )
            })?;
        }
        tx.commit().await?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, rules), fields(count = rules.len()))]
    async fn delete_permissions(&self, rules: &[PermissionRule]) -> ServiceResult<()> {
        if rules.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for rule in rules {
            sqlx::query(
                r#"
                DELETE FROM permissions
                WHERE role_id = $1 AND entity = $2 AND action = $3 AND relation = $4
                "#,
            )
            .bind(rule.role_id)
            .bind(&rule.entity)
            .bind(&rule.action)
            .bind(rule.relation)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_rule_index(&self) -> ServiceResult<Vec<NamedRule>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_rule_index"])
            .start_timer();

        let rows = sqlx::query_as::<_, NamedRuleRow>(
            r#"
            SELECT r.name AS role_name, p.role_id, p.entity, p.action, p.relation, p.attributes
            FROM permissions p
            JOIN roles r ON r.role_id = p.role_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(rows.into_iter().map(NamedRule::from).collect())
    }

    // -------------------------------------------------------------------------
    // User Type Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn find_role_user_types(&self, role_id: Uuid) -> ServiceResult<Vec<UserType>> {
        let types = sqlx::query_scalar::<_, UserType>(
            "SELECT user_type FROM role_user_types WHERE role_id = $1 ORDER BY user_type",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(types)
    }

    #[instrument(skip(self, links), fields(count = links.len()))]
    async fn save_role_user_types(&self, links: &[RoleUserType]) -> ServiceResult<()> {
        if links.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for link in links {
            sqlx::query(
                r#"
                INSERT INTO role_user_types (role_id, user_type)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(link.role_id)
            .bind(link.user_type)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_write_error(e, &format!("User type link {}", link.user_type)))?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, links), fields(count = links.len()))]
    async fn delete_role_user_types(&self, links: &[RoleUserType]) -> ServiceResult<()> {
        if links.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for link in links {
            sqlx::query("DELETE FROM role_user_types WHERE role_id = $1 AND user_type = $2")
                .bind(link.role_id)
                .bind(link.user_type)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_roles_by_user_type(&self, user_type: UserType) -> ServiceResult<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>(
            r#"
            SELECT r.role_id, r.name, r.system_default, r.created_utc, r.updated_utc
            FROM roles r
            JOIN role_user_types t ON t.role_id = r.role_id
            WHERE t.user_type = $1
            ORDER BY r.name
            "#,
        )
        .bind(user_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    // -------------------------------------------------------------------------
    // Assignment Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn find_assigned_roles(&self, user_id: Uuid) -> ServiceResult<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>(
            r#"
            SELECT r.role_id, r.name, r.system_default, r.created_utc, r.updated_utc
            FROM roles r
            JOIN assigned_roles a ON a.role_id = r.role_id
            WHERE a.user_id = $1
            ORDER BY r.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    #[instrument(skip(self, assignment), fields(user_id = %assignment.user_id, role_id = %assignment.role_id))]
    async fn save_assigned_role(&self, assignment: &AssignedRole) -> ServiceResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO assigned_roles (user_id, role_id, created_utc)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(assignment.user_id)
        .bind(assignment.role_id)
        .bind(assignment.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "Role assignment"))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_assigned_role(&self, user_id: Uuid, role_id: Uuid) -> ServiceResult<bool> {
        let result = sqlx::query("DELETE FROM assigned_roles WHERE user_id = $1 AND role_id = $2")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
