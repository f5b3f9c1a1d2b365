use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::database::models::tenant::DEFAULT_PG_PORT;
use crate::database::models::{DbCoordinates, ResolvedPoolOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),

    #[error("Missing configuration: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub registry: RegistryConfig,
    pub admin: AdminConfig,
    pub pool: PoolConfig,
    pub api: ApiConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

/// Central registry database
#[derive(Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Takes precedence over the individual fields when set
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Privileged credentials used only to create tenant databases
#[derive(Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Default pool policy for tenant databases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub port: u16,
    pub enable_request_logging: bool,
    pub enable_cors: bool,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("jwt_expiry_hours", &self.jwt_expiry_hours)
            .finish_non_exhaustive()
    }
}

impl RegistryConfig {
    pub fn coordinates(&self) -> Result<DbCoordinates, ConfigError> {
        let Some(raw) = &self.url else {
            return Ok(DbCoordinates {
                host: self.host.clone(),
                port: self.port,
                user: self.user.clone(),
                password: self.password.clone(),
                database: self.database.clone(),
            });
        };

        let url = url::Url::parse(raw).map_err(|e| ConfigError::InvalidDatabaseUrl(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidDatabaseUrl("missing host".to_string()))?;
        let database = url.path().trim_start_matches('/');
        if database.is_empty() {
            return Err(ConfigError::InvalidDatabaseUrl("missing database name".to_string()));
        }

        Ok(DbCoordinates {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_PG_PORT),
            user: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
            database: database.to_string(),
        })
    }
}

impl AdminConfig {
    /// Server coordinates; the admin database attaches to the maintenance database
    pub fn coordinates(&self) -> DbCoordinates {
        DbCoordinates {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: crate::database::admin::MAINTENANCE_DB_NAME.to_string(),
        }
    }
}

impl PoolConfig {
    pub fn resolved(&self) -> ResolvedPoolOptions {
        let defaults = ResolvedPoolOptions::tenant_default();
        let max_connections = if self.max_connections == 0 {
            defaults.max_connections
        } else {
            self.max_connections
        };
        ResolvedPoolOptions {
            max_connections,
            min_connections: self.min_connections.min(max_connections),
            acquire_timeout: non_zero_ms(self.acquire_timeout_ms, defaults.acquire_timeout),
            idle_timeout: non_zero_ms(self.idle_timeout_ms, defaults.idle_timeout),
        }
    }
}

fn non_zero_ms(ms: u64, fallback: Duration) -> Duration {
    if ms == 0 {
        fallback
    } else {
        Duration::from_millis(ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let defaults = ResolvedPoolOptions::tenant_default();
        Self {
            max_connections: defaults.max_connections,
            min_connections: defaults.min_connections,
            acquire_timeout_ms: defaults.acquire_timeout.as_millis() as u64,
            idle_timeout_ms: defaults.idle_timeout.as_millis() as u64,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        Self::preset(environment).with_overrides(|key| env::var(key).ok())
    }

    pub fn preset(environment: Environment) -> Self {
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
    }

    /// Apply overrides from any key lookup; unparsable values keep the preset
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse_into<T: std::str::FromStr>(value: Option<String>, field: &mut T) {
            if let Some(parsed) = value.and_then(|v| v.parse().ok()) {
                *field = parsed;
            }
        }

        // Registry overrides
        if let Some(v) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.registry.url = Some(v);
        }
        if let Some(v) = lookup("REGISTRY_DB_HOST") {
            self.registry.host = v;
        }
        parse_into(lookup("REGISTRY_DB_PORT"), &mut self.registry.port);
        if let Some(v) = lookup("REGISTRY_DB_USER") {
            self.registry.user = v;
        }
        if let Some(v) = lookup("REGISTRY_DB_PASS") {
            self.registry.password = v;
        }
        if let Some(v) = lookup("REGISTRY_DB_NAME") {
            self.registry.database = v;
        }

        // Admin overrides
        if let Some(v) = lookup("ADMIN_DB_HOST") {
            self.admin.host = v;
        }
        parse_into(lookup("ADMIN_DB_PORT"), &mut self.admin.port);
        if let Some(v) = lookup("ADMIN_DB_USER") {
            self.admin.user = v;
        }
        if let Some(v) = lookup("ADMIN_DB_PASS") {
            self.admin.password = v;
        }

        // Tenant pool overrides
        parse_into(lookup("TENANT_POOL_MAX"), &mut self.pool.max_connections);
        parse_into(lookup("TENANT_POOL_MIN"), &mut self.pool.min_connections);
        parse_into(lookup("TENANT_POOL_ACQUIRE_TIMEOUT_MS"), &mut self.pool.acquire_timeout_ms);
        parse_into(lookup("TENANT_POOL_IDLE_TIMEOUT_MS"), &mut self.pool.idle_timeout_ms);

        // API overrides
        parse_into(lookup("PORT"), &mut self.api.port);
        parse_into(lookup("API_ENABLE_REQUEST_LOGGING"), &mut self.api.enable_request_logging);
        parse_into(lookup("API_ENABLE_CORS"), &mut self.api.enable_cors);

        // Security overrides
        if let Some(v) = lookup("JWT_SECRET") {
            self.security.jwt_secret = v;
        }
        parse_into(lookup("JWT_EXPIRY_HOURS"), &mut self.security.jwt_expiry_hours);

        self
    }

    /// Reject configurations that cannot run in the selected environment
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment != Environment::Development && self.security.jwt_secret.is_empty() {
            return Err(ConfigError::Missing("JWT_SECRET"));
        }
        if self.admin.user.is_empty() {
            return Err(ConfigError::Missing("ADMIN_DB_USER"));
        }
        self.registry.coordinates()?;
        Ok(())
    }

    fn local_database() -> (RegistryConfig, AdminConfig) {
        (
            RegistryConfig {
                url: None,
                host: "localhost".to_string(),
                port: DEFAULT_PG_PORT,
                user: "postgres".to_string(),
                password: String::new(),
                database: "tenant_registry".to_string(),
            },
            AdminConfig {
                host: "localhost".to_string(),
                port: DEFAULT_PG_PORT,
                user: "postgres".to_string(),
                password: String::new(),
            },
        )
    }

    fn development() -> Self {
        let (registry, admin) = Self::local_database();
        Self {
            environment: Environment::Development,
            registry,
            admin,
            pool: PoolConfig::default(),
            api: ApiConfig {
                port: 3000,
                enable_request_logging: true,
                enable_cors: true,
            },
            security: SecurityConfig {
                jwt_secret: "development-secret".to_string(),
                jwt_expiry_hours: 24 * 7, // 1 week
            },
        }
    }

    fn staging() -> Self {
        let (registry, admin) = Self::local_database();
        Self {
            environment: Environment::Staging,
            registry,
            admin,
            pool: PoolConfig::default(),
            api: ApiConfig {
                port: 3000,
                enable_request_logging: true,
                enable_cors: true,
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 24,
            },
        }
    }

    fn production() -> Self {
        let (registry, admin) = Self::local_database();
        Self {
            environment: Environment::Production,
            registry,
            admin,
            pool: PoolConfig::default(),
            api: ApiConfig {
                port: 3000,
                enable_request_logging: false,
                enable_cors: false,
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 4,
            },
        }
    }
}

// Global singleton config for the binaries - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

pub fn config() -> &'static AppConfig {
    &CONFIG
}
