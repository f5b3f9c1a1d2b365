use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_PG_PORT: u16 = 5432;

/// Name written on insert, before the generated id is known.
pub const PLACEHOLDER_DB_NAME: &str = "tenant_pending";

/// Deterministic physical database name for a tenant id.
pub fn database_name_for(id: Uuid) -> String {
    format!("tenant_{}", id.simple())
}

/// Raw connection coordinates for one physical database
#[derive(Clone, PartialEq, Eq)]
pub struct DbCoordinates {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DbCoordinates {
    /// Same server and credentials, different database
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for DbCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCoordinates")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Per-tenant pool overrides as stored in the registry.
///
/// Every key is optional; an unset (or zero `max`) key falls back to the
/// defaults handed to [`PoolOptions::resolve`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

impl PoolOptions {
    pub fn resolve(&self, defaults: &ResolvedPoolOptions) -> ResolvedPoolOptions {
        let max_connections = self
            .max
            .filter(|max| *max > 0)
            .unwrap_or(defaults.max_connections);
        let min_connections = self
            .min
            .unwrap_or(defaults.min_connections)
            .min(max_connections);

        ResolvedPoolOptions {
            max_connections,
            min_connections,
            acquire_timeout: self
                .acquire_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquire_timeout),
            idle_timeout: self
                .idle_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_timeout),
        }
    }
}

/// Fully-resolved pool settings handed to the pool builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPoolOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl ResolvedPoolOptions {
    /// Defaults for tenant database pools
    pub const fn tenant_default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 0,
            acquire_timeout: Duration::from_millis(60_000),
            idle_timeout: Duration::from_millis(30_000),
        }
    }

    /// Defaults for the central registry and administrative pools
    pub const fn registry_default() -> Self {
        Self {
            max_connections: 10,
            ..Self::tenant_default()
        }
    }
}

impl Default for ResolvedPoolOptions {
    fn default() -> Self {
        Self::tenant_default()
    }
}

/// One row of the central `tenants` registry table
#[derive(Clone, FromRow)]
pub struct TenantRecord {
    pub id: Uuid,
    pub name: String,
    pub db_host: String,
    pub db_port: i32,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub pool_options: Option<Json<PoolOptions>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantRecord {
    pub fn coordinates(&self) -> DbCoordinates {
        DbCoordinates {
            host: self.db_host.clone(),
            // The registry constrains db_port to 1..=65535
            port: u16::try_from(self.db_port).unwrap_or(DEFAULT_PG_PORT),
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            database: self.db_name.clone(),
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        self.pool_options.as_ref().map(|json| json.0).unwrap_or_default()
    }
}

impl fmt::Debug for TenantRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_user", &self.db_user)
            .field("db_name", &self.db_name)
            .field("pool_options", &self.pool_options())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Columns supplied on registry insert; `id` and timestamps come from the store
#[derive(Clone)]
pub struct NewTenantRecord {
    pub name: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub pool_options: Option<PoolOptions>,
}

/// Partial update; `None` leaves the column untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantUpdate {
    pub name: Option<String>,
    pub db_name: Option<String>,
    pub active: Option<bool>,
}

impl TenantUpdate {
    pub fn db_name(name: impl Into<String>) -> Self {
        Self {
            db_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn deactivate() -> Self {
        Self {
            active: Some(false),
            ..Default::default()
        }
    }
}

/// Client-safe view of a registry record (no credentials)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantInfo {
    pub id: Uuid,
    pub name: String,
    pub database: String,
    pub host: String,
    pub port: i32,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_options: Option<PoolOptions>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TenantRecord> for TenantInfo {
    fn from(record: &TenantRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            database: record.db_name.clone(),
            host: record.db_host.clone(),
            port: record.db_port,
            is_active: record.active,
            pool_options: record.pool_options.as_ref().map(|json| json.0),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_is_derived_from_id() {
        let id = Uuid::parse_str("1b4e28ba-2fa1-11d2-883f-0016d3cca427").unwrap();
        assert_eq!(database_name_for(id), "tenant_1b4e28ba2fa111d2883f0016d3cca427");
    }

    #[test]
    fn unset_pool_options_fall_back_to_defaults() {
        let resolved = PoolOptions::default().resolve(&ResolvedPoolOptions::tenant_default());
        assert_eq!(resolved, ResolvedPoolOptions::tenant_default());
        assert_eq!(resolved.max_connections, 5);
        assert_eq!(resolved.min_connections, 0);
        assert_eq!(resolved.acquire_timeout, Duration::from_secs(60));
        assert_eq!(resolved.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn zero_values_never_override_defaults() {
        let options = PoolOptions {
            max: Some(0),
            min: None,
            acquire_timeout_ms: Some(0),
            idle_timeout_ms: Some(0),
        };
        let resolved = options.resolve(&ResolvedPoolOptions::tenant_default());
        assert_eq!(resolved, ResolvedPoolOptions::tenant_default());
    }

    #[test]
    fn partial_overrides_keep_remaining_defaults() {
        let options: PoolOptions =
            serde_json::from_value(serde_json::json!({ "max": 20, "acquireTimeoutMs": 1500 })).unwrap();
        let resolved = options.resolve(&ResolvedPoolOptions::tenant_default());
        assert_eq!(resolved.max_connections, 20);
        assert_eq!(resolved.acquire_timeout, Duration::from_millis(1500));
        assert_eq!(resolved.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn min_is_clamped_to_max() {
        let options = PoolOptions {
            max: Some(2),
            min: Some(8),
            ..Default::default()
        };
        let resolved = options.resolve(&ResolvedPoolOptions::tenant_default());
        assert_eq!(resolved.min_connections, 2);
    }

    #[test]
    fn registry_default_only_raises_max() {
        let registry = ResolvedPoolOptions::registry_default();
        assert_eq!(registry.max_connections, 10);
        assert_eq!(registry.idle_timeout, ResolvedPoolOptions::tenant_default().idle_timeout);
    }

    #[test]
    fn coordinates_debug_redacts_password() {
        let coords = DbCoordinates {
            host: "db".into(),
            port: 5432,
            user: "acme".into(),
            password: "hunter2".into(),
            database: "tenant_x".into(),
        };
        let printed = format!("{:?}", coords);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }
}
