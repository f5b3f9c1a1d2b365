//! In-memory collaborators for exercising the router and provisioner
//! without a database server.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::JwtError;
use crate::database::admin::{AdminDatabase, AdminError};
use crate::database::migrations::{MigrationError, Migrator, TENANT_MIGRATIONS};
use crate::database::models::{
    database_name_for, DbCoordinates, NewTenantRecord, PoolOptions, TenantRecord, TenantUpdate,
};
use crate::database::registry::{RegistryError, TenantRegistry};
use crate::database::session::{PgSessionFactory, SessionError, SessionFactory, TenantSession};
use crate::services::user_bootstrap::{AdminUserRequest, BootstrapError, UserBootstrap};

/// Registry kept in a map, counting active lookups
#[derive(Default)]
pub struct InMemoryRegistry {
    records: Mutex<HashMap<Uuid, TenantRecord>>,
    active_reads: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an active tenant with its final database name
    pub async fn seed_active(&self, name: &str) -> TenantRecord {
        let record = self
            .insert(NewTenantRecord {
                name: name.to_string(),
                db_host: "127.0.0.1".to_string(),
                db_port: 5432,
                db_user: "tenant".to_string(),
                db_password: "tenant".to_string(),
                db_name: "tenant_pending".to_string(),
                pool_options: None,
            })
            .await
            .expect("seed insert");
        self.update(record.id, TenantUpdate::db_name(database_name_for(record.id)))
            .await
            .expect("seed update");
        self.record(record.id).expect("seeded record")
    }

    pub fn record(&self, id: Uuid) -> Option<TenantRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<TenantRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    pub fn active_reads(&self) -> usize {
        self.active_reads.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl TenantRegistry for InMemoryRegistry {
    async fn find_active_by_id(&self, id: Uuid) -> Result<Option<TenantRecord>, RegistryError> {
        self.active_reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.record(id).filter(|r| r.active))
    }

    async fn list_active(&self) -> Result<Vec<TenantRecord>, RegistryError> {
        self.check_available()?;
        let mut records: Vec<_> = self.all().into_iter().filter(|r| r.active).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TenantRecord>, RegistryError> {
        self.check_available()?;
        Ok(self.record(id))
    }

    async fn insert(&self, record: NewTenantRecord) -> Result<TenantRecord, RegistryError> {
        self.check_available()?;
        let now = Utc::now();
        let inserted = TenantRecord {
            id: Uuid::new_v4(),
            name: record.name,
            db_host: record.db_host,
            db_port: i32::from(record.db_port),
            db_user: record.db_user,
            db_password: record.db_password,
            db_name: record.db_name,
            pool_options: record.pool_options.map(Json),
            active: true,
            created_at: now,
            updated_at: now,
        };
        self.records.lock().unwrap().insert(inserted.id, inserted.clone());
        Ok(inserted)
    }

    async fn update(&self, id: Uuid, update: TenantUpdate) -> Result<(), RegistryError> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        if let Some(name) = update.name {
            record.name = name;
        }
        if let Some(db_name) = update.db_name {
            record.db_name = db_name;
        }
        if let Some(active) = update.active {
            record.active = active;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        self.check_available()
    }
}

/// Builds real lazy pools but fakes connectivity, counting both
pub struct CountingSessionFactory {
    inner: PgSessionFactory,
    builds: AtomicUsize,
    connects: AtomicUsize,
    connect_delay: Duration,
    connect_failure: Mutex<Option<String>>,
    built: Mutex<Vec<TenantSession>>,
}

impl CountingSessionFactory {
    pub fn new() -> Self {
        Self {
            inner: PgSessionFactory::default(),
            builds: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            connect_delay: Duration::ZERO,
            connect_failure: Mutex::new(None),
            built: Mutex::new(Vec::new()),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn failing_connect(self, message: &str) -> Self {
        self.set_connect_failure(Some(message.to_string()));
        self
    }

    pub fn set_connect_failure(&self, failure: Option<String>) {
        *self.connect_failure.lock().unwrap() = failure;
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every session built so far, in build order
    pub fn built(&self) -> Vec<TenantSession> {
        self.built.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionFactory for CountingSessionFactory {
    fn build(
        &self,
        tenant_id: Uuid,
        coordinates: &DbCoordinates,
        options: &PoolOptions,
    ) -> Result<TenantSession, SessionError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let session = self.inner.build(tenant_id, coordinates, options)?;
        self.built.lock().unwrap().push(session.clone());
        Ok(session)
    }

    async fn connect(&self, _session: &TenantSession) -> Result<(), SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let failure = self.connect_failure.lock().unwrap().clone();
        match failure {
            Some(message) => Err(SessionError::Connect(message)),
            None => Ok(()),
        }
    }
}

/// Set of database names standing in for a server
#[derive(Default)]
pub struct FakeAdminDatabase {
    databases: Mutex<HashSet<String>>,
    creates: AtomicUsize,
    create_failure: Mutex<Option<String>>,
    all_exist: bool,
}

impl FakeAdminDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server on which every database name is already present
    pub fn with_every_database_present() -> Self {
        Self {
            all_exist: true,
            ..Self::default()
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.all_exist || self.databases.lock().unwrap().contains(name)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn fail_creates_with(&self, message: &str) {
        *self.create_failure.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl AdminDatabase for FakeAdminDatabase {
    async fn database_exists(&self, name: &str) -> Result<bool, AdminError> {
        Ok(self.contains(name))
    }

    async fn create_database(&self, name: &str) -> Result<(), AdminError> {
        if let Some(message) = self.create_failure.lock().unwrap().clone() {
            return Err(AdminError::Sqlx(sqlx::Error::Protocol(message)));
        }
        if self.databases.lock().unwrap().insert(name.to_string()) {
            self.creates.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Records which databases have been migrated
#[derive(Default)]
pub struct FakeMigrator {
    migrated: Mutex<HashSet<String>>,
    runs: AtomicUsize,
    failure: Mutex<Option<String>>,
}

impl FakeMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn clear_failure(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Migrator for FakeMigrator {
    async fn run_migrations(&self, session: &TenantSession) -> Result<Vec<String>, MigrationError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(MigrationError::Failed {
                name: TENANT_MIGRATIONS[0].name,
                source: sqlx::Error::Protocol(message),
            });
        }
        if !self.migrated.lock().unwrap().insert(session.database().to_string()) {
            return Ok(Vec::new());
        }
        Ok(TENANT_MIGRATIONS.iter().map(|m| m.name.to_string()).collect())
    }
}

/// Hands out fresh user ids and opaque tokens
#[derive(Default)]
pub struct FakeUserBootstrap {
    users_created: AtomicUsize,
    fail_tokens: AtomicBool,
}

impl FakeUserBootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn users_created(&self) -> usize {
        self.users_created.load(Ordering::SeqCst)
    }

    pub fn fail_tokens(&self) {
        self.fail_tokens.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserBootstrap for FakeUserBootstrap {
    async fn create_admin_user(&self, _tenant_id: Uuid, _user: &AdminUserRequest) -> Result<Uuid, BootstrapError> {
        self.users_created.fetch_add(1, Ordering::SeqCst);
        Ok(Uuid::new_v4())
    }

    async fn issue_token(&self, tenant_id: Uuid, user_id: Uuid, _email: &str) -> Result<String, BootstrapError> {
        if self.fail_tokens.load(Ordering::SeqCst) {
            return Err(JwtError::InvalidSecret.into());
        }
        Ok(format!("token-{}-{}", tenant_id.simple(), user_id.simple()))
    }
}
