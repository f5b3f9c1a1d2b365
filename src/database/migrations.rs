//! Tenant schema migrations.
//!
//! Every tenant database carries the same ordered migration set. Applied
//! names are recorded in `_migrations`, so re-running against a migrated
//! database applies nothing. Each migration runs in its own transaction under
//! a transaction-scoped advisory lock, which serializes concurrent runners
//! against the same database.

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use crate::database::session::TenantSession;

/// Arbitrary key shared by all migration runners
const MIGRATION_LOCK_KEY: i64 = 0x7465_6e61_6e74;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration {name} failed: {source}")]
    Failed {
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

pub const TENANT_MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_create_users",
        statements: &[r#"
            CREATE TABLE IF NOT EXISTS users (
                id            UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                email         TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                first_name    TEXT,
                last_name     TEXT,
                access        TEXT NOT NULL DEFAULT 'full',
                created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT now()
            )
        "#],
    },
    Migration {
        name: "0002_create_products",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS products (
                id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name        TEXT NOT NULL,
                sku         TEXT UNIQUE,
                price_cents BIGINT NOT NULL DEFAULT 0 CHECK (price_cents >= 0),
                description TEXT,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS products_created_at_idx ON products (created_at DESC)",
        ],
    },
];

/// Brings a tenant database up to the current schema
#[async_trait]
pub trait Migrator: Send + Sync {
    /// Returns the names applied by this run, in order
    async fn run_migrations(&self, session: &TenantSession) -> Result<Vec<String>, MigrationError>;
}

#[derive(Debug, Clone)]
pub struct SqlMigrator {
    migrations: &'static [Migration],
}

impl SqlMigrator {
    pub fn new(migrations: &'static [Migration]) -> Self {
        Self { migrations }
    }

    pub fn migrations(&self) -> &'static [Migration] {
        self.migrations
    }

    async fn ensure_bookkeeping(pool: &PgPool) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                name       TEXT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Apply one migration unless already recorded; true when applied
    async fn apply(pool: &PgPool, migration: &Migration) -> Result<bool, MigrationError> {
        let failed = |source| MigrationError::Failed {
            name: migration.name,
            source,
        };

        let mut tx = pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let applied: (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM _migrations WHERE name = $1)")
                .bind(migration.name)
                .fetch_one(&mut *tx)
                .await?;
        if applied.0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(failed)?;
        }

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(failed)?;
        Ok(true)
    }
}

impl Default for SqlMigrator {
    fn default() -> Self {
        Self::new(TENANT_MIGRATIONS)
    }
}

#[async_trait]
impl Migrator for SqlMigrator {
    async fn run_migrations(&self, session: &TenantSession) -> Result<Vec<String>, MigrationError> {
        let pool = session.pool();
        Self::ensure_bookkeeping(pool).await?;

        let mut applied = Vec::new();
        for migration in self.migrations {
            if Self::apply(pool, migration).await? {
                info!(
                    tenant_id = %session.tenant_id(),
                    database = %session.database(),
                    migration = migration.name,
                    "Applied migration"
                );
                applied.push(migration.name.to_string());
            }
        }
        Ok(applied)
    }
}
