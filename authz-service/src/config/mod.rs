//! Configuration module for authz-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AuthzConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// `None` runs the service on the in-memory role store.
    pub database: Option<DatabaseConfig>,
    pub admin_api_key: String,
    /// JSON file replacing the built-in default role definitions.
    pub role_definitions_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl AuthzConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let environment: Environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "dev".to_string())
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let is_prod = environment == Environment::Prod;

        let database = match env::var("DATABASE_URL") {
            Ok(url) => Some(DatabaseConfig {
                url,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2)?,
            }),
            Err(_) if is_prod => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "DATABASE_URL is required in production but not set"
                )))
            }
            Err(_) => None,
        };

        let config = AuthzConfig {
            common,
            environment,
            service_name: get_env("SERVICE_NAME", Some("authz-service"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database,
            admin_api_key: get_env("ADMIN_API_KEY", None, is_prod)?,
            role_definitions_path: env::var("ROLE_DEFINITIONS_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.admin_api_key.trim().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ADMIN_API_KEY must not be empty"
            )));
        }

        if let Some(db) = &self.database {
            if db.max_connections == 0 || db.min_connections > db.max_connections {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "DATABASE_MIN_CONNECTIONS must not exceed a non-zero DATABASE_MAX_CONNECTIONS"
                )));
            }
        }

        if self.environment == Environment::Prod && self.admin_api_key.len() < 32 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ADMIN_API_KEY must be at least 32 characters in production"
            )));
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env(key: &str, default: u32) -> Result<u32, AppError> {
    match env::var(key) {
        Ok(val) => val.parse().map_err(|e: std::num::ParseIntError| {
            AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
