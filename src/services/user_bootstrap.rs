use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::auth::{JwtError, JwtIssuer};
use crate::database::models::User;
use crate::database::repository::HandleError;
use crate::database::router::{RouterError, TenantRouter};

/// Access level granted to the bootstrap admin
pub const ADMIN_ACCESS: &str = "root";

#[derive(Clone, Serialize, Deserialize)]
pub struct AdminUserRequest {
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl std::fmt::Debug for AdminUserRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminUserRequest")
            .field("email", &self.email)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Token(#[from] JwtError),
}

/// Creates the first user of a freshly provisioned tenant and signs its token
#[async_trait]
pub trait UserBootstrap: Send + Sync {
    async fn create_admin_user(&self, tenant_id: Uuid, user: &AdminUserRequest) -> Result<Uuid, BootstrapError>;

    async fn issue_token(&self, tenant_id: Uuid, user_id: Uuid, email: &str) -> Result<String, BootstrapError>;
}

/// Writes the admin into the tenant's `users` table through the router
pub struct TenantUserBootstrap {
    router: Arc<TenantRouter>,
    issuer: JwtIssuer,
}

impl TenantUserBootstrap {
    pub fn new(router: Arc<TenantRouter>, issuer: JwtIssuer) -> Self {
        Self { router, issuer }
    }
}

#[async_trait]
impl UserBootstrap for TenantUserBootstrap {
    async fn create_admin_user(&self, tenant_id: Uuid, user: &AdminUserRequest) -> Result<Uuid, BootstrapError> {
        let users = self.router.handle::<User>(tenant_id).await?;

        let mut fields = Map::new();
        fields.insert("email".into(), json!(user.email));
        fields.insert("password_hash".into(), json!(password_digest(&user.password)));
        fields.insert("first_name".into(), json!(user.first_name));
        fields.insert("last_name".into(), json!(user.last_name));
        fields.insert("access".into(), Value::String(ADMIN_ACCESS.into()));

        let created = users.insert(&fields).await?;
        info!(%tenant_id, user_id = %created.id, "Created tenant admin user");
        Ok(created.id)
    }

    async fn issue_token(&self, tenant_id: Uuid, user_id: Uuid, email: &str) -> Result<String, BootstrapError> {
        Ok(self.issuer.issue(tenant_id, user_id, email, ADMIN_ACCESS)?)
    }
}

/// Salted SHA-256 digest in the form `sha256$<salt>$<hex>`
pub fn password_digest(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("sha256${}${}", salt, salted_hash(&salt, password))
}

pub fn verify_password(password: &str, digest: &str) -> bool {
    match digest.split('$').collect::<Vec<_>>().as_slice() {
        ["sha256", salt, hash] => salted_hash(salt, password) == *hash,
        _ => false,
    }
}

fn salted_hash(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}
