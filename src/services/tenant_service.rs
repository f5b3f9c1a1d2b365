use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::admin::AdminDatabase;
use crate::database::migrations::{MigrationError, Migrator};
use crate::database::models::tenant::{DEFAULT_PG_PORT, PLACEHOLDER_DB_NAME};
use crate::database::models::{
    database_name_for, DbCoordinates, NewTenantRecord, PoolOptions, TenantInfo, TenantRecord,
    TenantUpdate,
};
use crate::database::registry::{RegistryError, TenantRegistry};
use crate::database::router::{RouterError, TenantRouter};
use crate::database::session::SessionFactory;
use crate::services::user_bootstrap::{AdminUserRequest, UserBootstrap};

pub const STATUS_PROVISIONED: &str = "provisioned";

/// Where the tenant's physical database lives
#[derive(Clone, Deserialize)]
pub struct DatabaseTarget {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(alias = "pass")]
    pub password: String,
}

fn default_port() -> u16 {
    DEFAULT_PG_PORT
}

impl fmt::Debug for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
    pub database: DatabaseTarget,
    #[serde(default)]
    pub pool_options: Option<PoolOptions>,
    #[serde(default)]
    pub admin_user: Option<AdminUserRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantCreationResult {
    pub status: &'static str,
    pub id: Uuid,
    pub name: String,
    pub database: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    pub migrations: Vec<String>,
}

/// Provisioning stage that failed after the registry insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStep {
    AssignDatabaseName,
    CreateDatabase,
    Connect,
    Migrate,
    BootstrapAdmin,
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            ProvisioningStep::AssignDatabaseName => "assign database name",
            ProvisioningStep::CreateDatabase => "create database",
            ProvisioningStep::Connect => "connect",
            ProvisioningStep::Migrate => "migrate",
            ProvisioningStep::BootstrapAdmin => "bootstrap admin user",
        };
        f.write_str(step)
    }
}

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("Invalid tenant request: {0}")]
    InvalidRequest(String),

    #[error("Tenant not found: {0}")]
    NotFound(Uuid),

    #[error("Provisioning tenant '{tenant}' ({tenant_id}) failed at {step}: {cause}")]
    ProvisioningFailure {
        tenant: String,
        tenant_id: Uuid,
        step: ProvisioningStep,
        cause: String,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

struct StepFailure {
    step: ProvisioningStep,
    cause: String,
}

fn at<E: fmt::Display>(step: ProvisioningStep) -> impl FnOnce(E) -> StepFailure {
    move |e| StepFailure {
        step,
        cause: e.to_string(),
    }
}

struct Provisioned {
    database: String,
    migrations: Vec<String>,
    admin_token: Option<String>,
}

/// Creates tenants end to end and administers the registry
pub struct TenantService {
    registry: Arc<dyn TenantRegistry>,
    router: Arc<TenantRouter>,
    factory: Arc<dyn SessionFactory>,
    admin: Arc<dyn AdminDatabase>,
    migrator: Arc<dyn Migrator>,
    bootstrap: Option<Arc<dyn UserBootstrap>>,
}

impl TenantService {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        router: Arc<TenantRouter>,
        factory: Arc<dyn SessionFactory>,
        admin: Arc<dyn AdminDatabase>,
        migrator: Arc<dyn Migrator>,
    ) -> Self {
        Self {
            registry,
            router,
            factory,
            admin,
            migrator,
            bootstrap: None,
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: Arc<dyn UserBootstrap>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    /// Provision a new tenant. Any failure after the registry insert leaves the
    /// record behind with `active = false`.
    pub async fn create_tenant(&self, request: CreateTenantRequest) -> Result<TenantCreationResult, TenantError> {
        self.validate_request(&request)?;

        let record = self
            .registry
            .insert(NewTenantRecord {
                name: request.name.trim().to_string(),
                db_host: request.database.host.clone(),
                db_port: request.database.port,
                db_user: request.database.user.clone(),
                db_password: request.database.password.clone(),
                db_name: PLACEHOLDER_DB_NAME.to_string(),
                pool_options: request.pool_options,
            })
            .await?;
        info!(tenant_id = %record.id, name = %record.name, "Registered tenant");

        match self.provision(&record, &request).await {
            Ok(provisioned) => {
                info!(tenant_id = %record.id, database = %provisioned.database, "Tenant provisioned");
                Ok(TenantCreationResult {
                    status: STATUS_PROVISIONED,
                    id: record.id,
                    name: record.name,
                    database: provisioned.database,
                    created_at: record.created_at,
                    updated_at: record.updated_at,
                    admin_token: provisioned.admin_token,
                    migrations: provisioned.migrations,
                })
            }
            Err(failure) => {
                error!(
                    tenant_id = %record.id,
                    name = %record.name,
                    step = %failure.step,
                    cause = %failure.cause,
                    "Tenant provisioning failed"
                );
                self.mark_failed(record.id).await;
                Err(TenantError::ProvisioningFailure {
                    tenant: record.name,
                    tenant_id: record.id,
                    step: failure.step,
                    cause: failure.cause,
                })
            }
        }
    }

    async fn provision(&self, record: &TenantRecord, request: &CreateTenantRequest) -> Result<Provisioned, StepFailure> {
        let database = database_name_for(record.id);
        self.registry
            .update(record.id, TenantUpdate::db_name(&database))
            .await
            .map_err(at(ProvisioningStep::AssignDatabaseName))?;

        let exists = self
            .admin
            .database_exists(&database)
            .await
            .map_err(at(ProvisioningStep::CreateDatabase))?;
        if !exists {
            self.admin
                .create_database(&database)
                .await
                .map_err(at(ProvisioningStep::CreateDatabase))?;
        }

        let coordinates = DbCoordinates {
            host: request.database.host.clone(),
            port: request.database.port,
            user: request.database.user.clone(),
            password: request.database.password.clone(),
            database: database.clone(),
        };
        let session = self
            .factory
            .build(record.id, &coordinates, &request.pool_options.unwrap_or_default())
            .map_err(at(ProvisioningStep::Connect))?;

        // The provisioning session is private; the router builds its own on first use
        let migrated = match self.factory.connect(&session).await {
            Ok(()) => self
                .migrator
                .run_migrations(&session)
                .await
                .map_err(at(ProvisioningStep::Migrate)),
            Err(e) => Err(at(ProvisioningStep::Connect)(e)),
        };
        session.close().await;
        let migrations = migrated?;

        let admin_token = match &request.admin_user {
            Some(user) => Some(self.bootstrap_admin(record.id, user).await?),
            None => None,
        };

        Ok(Provisioned {
            database,
            migrations,
            admin_token,
        })
    }

    async fn bootstrap_admin(&self, tenant_id: Uuid, user: &AdminUserRequest) -> Result<String, StepFailure> {
        let bootstrap = self.bootstrap.as_ref().ok_or_else(|| StepFailure {
            step: ProvisioningStep::BootstrapAdmin,
            cause: "no user bootstrap configured".to_string(),
        })?;

        let user_id = bootstrap
            .create_admin_user(tenant_id, user)
            .await
            .map_err(at(ProvisioningStep::BootstrapAdmin))?;
        bootstrap
            .issue_token(tenant_id, user_id, &user.email)
            .await
            .map_err(at(ProvisioningStep::BootstrapAdmin))
    }

    async fn mark_failed(&self, tenant_id: Uuid) {
        if let Err(e) = self.registry.update(tenant_id, TenantUpdate::deactivate()).await {
            error!(%tenant_id, error = %e, "Failed to mark tenant inactive after provisioning failure");
        }
        // Bootstrap may have opened a router session before failing
        self.router.close_session(tenant_id).await;
    }

    fn validate_request(&self, request: &CreateTenantRequest) -> Result<(), TenantError> {
        let name = request.name.trim();
        if name.chars().count() < 2 {
            return Err(TenantError::InvalidRequest("Tenant name must be at least 2 characters".to_string()));
        }
        if name.chars().count() > 100 {
            return Err(TenantError::InvalidRequest("Tenant name must be less than 100 characters".to_string()));
        }

        let database = &request.database;
        if database.host.trim().is_empty() || database.user.trim().is_empty() {
            return Err(TenantError::InvalidRequest("Database host and user are required".to_string()));
        }
        if database.port == 0 {
            return Err(TenantError::InvalidRequest("Database port must be non-zero".to_string()));
        }

        if let Some(user) = &request.admin_user {
            if self.bootstrap.is_none() {
                return Err(TenantError::InvalidRequest("Admin user bootstrap is not available".to_string()));
            }
            let valid_email = user
                .email
                .split_once('@')
                .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
            if !valid_email {
                return Err(TenantError::InvalidRequest(format!("Invalid admin email: {}", user.email)));
            }
            if user.password.chars().count() < 6 {
                return Err(TenantError::InvalidRequest("Admin password must be at least 6 characters".to_string()));
            }
        }

        Ok(())
    }

    /// Active tenants, newest first
    pub async fn list_tenants(&self) -> Result<Vec<TenantInfo>, TenantError> {
        let records = self.registry.list_active().await?;
        Ok(records.iter().map(TenantInfo::from).collect())
    }

    /// Tenant details regardless of the active flag
    pub async fn get_tenant(&self, tenant_id: Uuid) -> Result<TenantInfo, TenantError> {
        self.registry
            .find_by_id(tenant_id)
            .await?
            .map(|record| TenantInfo::from(&record))
            .ok_or(TenantError::NotFound(tenant_id))
    }

    /// Mark the tenant inactive and drop its cached session
    pub async fn deactivate_tenant(&self, tenant_id: Uuid) -> Result<(), TenantError> {
        match self.registry.update(tenant_id, TenantUpdate::deactivate()).await {
            Ok(()) => {}
            Err(RegistryError::NotFound(id)) => return Err(TenantError::NotFound(id)),
            Err(e) => return Err(e.into()),
        }
        self.router.close_session(tenant_id).await;
        warn!(%tenant_id, "Tenant deactivated");
        Ok(())
    }

    /// Re-run the migration set against an active tenant
    pub async fn migrate_tenant(&self, tenant_id: Uuid) -> Result<Vec<String>, TenantError> {
        let session = self.router.get_session(tenant_id).await?;
        Ok(self.migrator.run_migrations(&session).await?)
    }
}
