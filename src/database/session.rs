use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::database::models::{DbCoordinates, PoolOptions, ResolvedPoolOptions};

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Invalid database name: {0}")]
    InvalidDatabaseName(String),

    #[error("Connection failed: {0}")]
    Connect(String),
}

/// A pooled handle to one tenant's physical database.
///
/// Cloning is cheap and every clone shares the same pool; use
/// [`TenantSession::ptr_eq`] to tell whether two handles are the same session.
#[derive(Clone)]
pub struct TenantSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    tenant_id: Uuid,
    database: String,
    pool: PgPool,
    created_at: DateTime<Utc>,
}

impl TenantSession {
    pub fn new(tenant_id: Uuid, database: impl Into<String>, pool: PgPool) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                tenant_id,
                database: database.into(),
                pool,
                created_at: Utc::now(),
            }),
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        self.inner.tenant_id
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// False once the pool has been closed
    pub fn is_connected(&self) -> bool {
        !self.inner.pool.is_closed()
    }

    /// Close the pool, waiting for checked-out connections to come back
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }

    pub fn ptr_eq(&self, other: &TenantSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for TenantSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantSession")
            .field("tenant_id", &self.inner.tenant_id)
            .field("database", &self.inner.database)
            .field("connected", &self.is_connected())
            .field("created_at", &self.inner.created_at)
            .finish()
    }
}

/// Builds tenant sessions from raw coordinates. Never touches the registry.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Construct a session whose pool has not opened any connection yet
    fn build(
        &self,
        tenant_id: Uuid,
        coordinates: &DbCoordinates,
        options: &PoolOptions,
    ) -> Result<TenantSession, SessionError>;

    /// Prove the database is reachable by checking out one connection
    async fn connect(&self, session: &TenantSession) -> Result<(), SessionError>;
}

/// Postgres-backed factory applying the configured default pool policy
#[derive(Debug, Clone)]
pub struct PgSessionFactory {
    defaults: ResolvedPoolOptions,
}

impl PgSessionFactory {
    pub fn new(defaults: ResolvedPoolOptions) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &ResolvedPoolOptions {
        &self.defaults
    }

    pub fn connect_options(coordinates: &DbCoordinates) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&coordinates.host)
            .port(coordinates.port)
            .username(&coordinates.user)
            .password(&coordinates.password)
            .database(&coordinates.database)
    }

    /// Lazily-connecting pool; shared by the registry and admin connections too
    pub fn build_pool(coordinates: &DbCoordinates, options: &ResolvedPoolOptions) -> PgPool {
        PgPoolOptions::new()
            .max_connections(options.max_connections)
            .min_connections(options.min_connections)
            .acquire_timeout(options.acquire_timeout)
            .idle_timeout(options.idle_timeout)
            .connect_lazy_with(Self::connect_options(coordinates))
    }
}

impl Default for PgSessionFactory {
    fn default() -> Self {
        Self::new(ResolvedPoolOptions::tenant_default())
    }
}

#[async_trait]
impl SessionFactory for PgSessionFactory {
    fn build(
        &self,
        tenant_id: Uuid,
        coordinates: &DbCoordinates,
        options: &PoolOptions,
    ) -> Result<TenantSession, SessionError> {
        if !is_valid_db_name(&coordinates.database) {
            return Err(SessionError::InvalidDatabaseName(coordinates.database.clone()));
        }
        let resolved = options.resolve(&self.defaults);
        let pool = Self::build_pool(coordinates, &resolved);
        Ok(TenantSession::new(tenant_id, &coordinates.database, pool))
    }

    async fn connect(&self, session: &TenantSession) -> Result<(), SessionError> {
        session
            .pool()
            .acquire()
            .await
            .map(drop)
            .map_err(|e| SessionError::Connect(e.to_string()))
    }
}

/// Validate database names before they reach a connection string or DDL.
/// Accepts a leading letter or underscore followed by [a-zA-Z0-9_], at most 63 bytes.
pub fn is_valid_db_name(name: &str) -> bool {
    let mut chars = name.chars();
    let leading_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    leading_ok && name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
