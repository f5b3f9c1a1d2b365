use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::database::models::{NewTenantRecord, TenantRecord, TenantUpdate};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tenant not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Durable store of tenant records and their connection coordinates
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// Lookup restricted to `active = true`
    async fn find_active_by_id(&self, id: Uuid) -> Result<Option<TenantRecord>, RegistryError>;

    async fn list_active(&self) -> Result<Vec<TenantRecord>, RegistryError>;

    /// Lookup regardless of the active flag (administration only)
    async fn find_by_id(&self, id: Uuid) -> Result<Option<TenantRecord>, RegistryError>;

    /// Insert an active record and return it with its generated id
    async fn insert(&self, record: NewTenantRecord) -> Result<TenantRecord, RegistryError>;

    async fn update(&self, id: Uuid, update: TenantUpdate) -> Result<(), RegistryError>;

    async fn health_check(&self) -> Result<(), RegistryError>;
}

const TENANT_COLUMNS: &str = "id, name, db_host, db_port, db_user, db_password, db_name, \
                              pool_options, active, created_at, updated_at";

/// Registry backed by the `tenants` table in the central database
#[derive(Debug, Clone)]
pub struct PgTenantRegistry {
    pool: PgPool,
}

impl PgTenantRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the registry table if this is a fresh central database
    pub async fn ensure_schema(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id           UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name         TEXT NOT NULL,
                db_host      TEXT NOT NULL,
                db_port      INTEGER NOT NULL DEFAULT 5432 CHECK (db_port BETWEEN 1 AND 65535),
                db_user      TEXT NOT NULL,
                db_password  TEXT NOT NULL,
                db_name      TEXT NOT NULL,
                pool_options JSONB,
                active       BOOLEAN NOT NULL DEFAULT true,
                created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS tenants_active_idx ON tenants (id) WHERE active")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl TenantRegistry for PgTenantRegistry {
    async fn find_active_by_id(&self, id: Uuid) -> Result<Option<TenantRecord>, RegistryError> {
        let record = sqlx::query_as::<_, TenantRecord>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1 AND active = true"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_active(&self) -> Result<Vec<TenantRecord>, RegistryError> {
        let records = sqlx::query_as::<_, TenantRecord>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE active = true ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TenantRecord>, RegistryError> {
        let record = sqlx::query_as::<_, TenantRecord>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert(&self, record: NewTenantRecord) -> Result<TenantRecord, RegistryError> {
        let inserted = sqlx::query_as::<_, TenantRecord>(&format!(
            r#"
            INSERT INTO tenants (name, db_host, db_port, db_user, db_password, db_name, pool_options, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, true)
            RETURNING {TENANT_COLUMNS}
            "#
        ))
        .bind(&record.name)
        .bind(&record.db_host)
        .bind(i32::from(record.db_port))
        .bind(&record.db_user)
        .bind(&record.db_password)
        .bind(&record.db_name)
        .bind(record.pool_options.map(Json))
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn update(&self, id: Uuid, update: TenantUpdate) -> Result<(), RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET name = COALESCE($2, name),
                db_name = COALESCE($3, db_name),
                active = COALESCE($4, active),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.name)
        .bind(update.db_name)
        .bind(update.active)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id));
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
