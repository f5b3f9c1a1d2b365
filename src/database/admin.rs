use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use crate::database::models::{DbCoordinates, ResolvedPoolOptions};
use crate::database::session::{is_valid_db_name, PgSessionFactory};

/// Maintenance database the administrative connection attaches to
pub const MAINTENANCE_DB_NAME: &str = "postgres";

/// SQLSTATE 42P04: duplicate_database
const DUPLICATE_DATABASE: &str = "42P04";

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Invalid database name: {0}")]
    InvalidDatabaseName(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Privileged operations on the database server itself
#[async_trait]
pub trait AdminDatabase: Send + Sync {
    async fn database_exists(&self, name: &str) -> Result<bool, AdminError>;

    /// Create the database; an already-existing database is not an error
    async fn create_database(&self, name: &str) -> Result<(), AdminError>;
}

/// Administrative connection using its own credentials, never a tenant's
#[derive(Debug, Clone)]
pub struct PgAdminDatabase {
    pool: PgPool,
}

impl PgAdminDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lazily connect to the maintenance database of the given server
    pub fn connect_lazy(server: &DbCoordinates) -> Self {
        let coordinates = server.with_database(MAINTENANCE_DB_NAME);
        Self::new(PgSessionFactory::build_pool(
            &coordinates,
            &ResolvedPoolOptions::registry_default(),
        ))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Quote SQL identifier to prevent injection
    fn quote_identifier(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

#[async_trait]
impl AdminDatabase for PgAdminDatabase {
    async fn database_exists(&self, name: &str) -> Result<bool, AdminError> {
        let exists: (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists.0)
    }

    async fn create_database(&self, name: &str) -> Result<(), AdminError> {
        if !is_valid_db_name(name) {
            return Err(AdminError::InvalidDatabaseName(name.to_string()));
        }
        if self.database_exists(name).await? {
            return Ok(());
        }

        let query = format!("CREATE DATABASE {}", Self::quote_identifier(name));
        match sqlx::query(&query).execute(&self.pool).await {
            Ok(_) => {
                info!(database = %name, "Created database");
                Ok(())
            }
            // Lost a race with a concurrent create of the same name
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(DUPLICATE_DATABASE) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
