//! Tenant connection router.
//!
//! Maps tenant id to a live [`TenantSession`], building sessions lazily from
//! the registry. Initialization is single-flight: concurrent callers asking
//! for the same unseen tenant share one pending future, so exactly one pool is
//! built and every caller observes the same session or the same error.
//!
//! Lock order is `pending` then `sessions`. No lock is held across an await.

use futures::future::{self, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::database::registry::TenantRegistry;
use crate::database::repository::{Entity, Handle};
use crate::database::session::{SessionFactory, TenantSession};

/// Upper bound on waiting for a pool's connections to be returned at close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error)]
pub enum RouterError {
    #[error("Tenant not found: {0}")]
    TenantNotFound(Uuid),

    #[error("Connection to tenant {tenant_id} failed: {message}")]
    ConnectionFailure { tenant_id: Uuid, message: String },

    #[error("Tenant registry unavailable: {0}")]
    Registry(String),
}

type InitFuture = Shared<BoxFuture<'static, Result<TenantSession, RouterError>>>;

enum Lookup {
    Ready(TenantSession),
    Pending(InitFuture),
}

pub struct TenantRouter {
    registry: Arc<dyn TenantRegistry>,
    factory: Arc<dyn SessionFactory>,
    sessions: RwLock<HashMap<Uuid, TenantSession>>,
    pending: Mutex<HashMap<Uuid, InitFuture>>,
}

impl TenantRouter {
    pub fn new(registry: Arc<dyn TenantRegistry>, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            registry,
            factory,
            sessions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Cached session for the tenant, initializing it on first use
    pub async fn get_session(&self, tenant_id: Uuid) -> Result<TenantSession, RouterError> {
        loop {
            if let Some(session) = self.cached(tenant_id) {
                debug!(%tenant_id, "Tenant session cache hit");
                return Ok(session);
            }

            let init = match self.join_or_start(tenant_id) {
                Lookup::Ready(session) => return Ok(session),
                Lookup::Pending(init) => init,
            };

            let outcome = init.clone().await;
            if self.settle(tenant_id, &init, &outcome) {
                return outcome;
            }

            // Closed while initializing: discard the pool and resolve again
            if let Ok(session) = outcome {
                close_with_timeout(tenant_id, &session).await;
            }
            debug!(%tenant_id, "Tenant initialization abandoned by close; retrying");
        }
    }

    /// Entity-scoped handle over the tenant's session
    pub async fn handle<T: Entity>(&self, tenant_id: Uuid) -> Result<Handle<T>, RouterError> {
        let session = self.get_session(tenant_id).await?;
        Ok(Handle::new(session))
    }

    /// Close and evict one tenant's session; no-op when none is cached.
    /// An initialization still in flight is abandoned and never published.
    pub async fn close_session(&self, tenant_id: Uuid) {
        let session = {
            let mut pending = lock(&self.pending);
            if pending.remove(&tenant_id).is_some() {
                debug!(%tenant_id, "Abandoned in-flight tenant initialization");
            }
            write(&self.sessions).remove(&tenant_id)
        };
        if let Some(session) = session {
            if session.is_connected() {
                close_with_timeout(tenant_id, &session).await;
            }
            info!(%tenant_id, database = %session.database(), "Closed tenant database pool");
        }
    }

    /// Close every cached session concurrently and clear the cache
    pub async fn close_all(&self) {
        let sessions: Vec<(Uuid, TenantSession)> = {
            let mut pending = lock(&self.pending);
            pending.clear();
            write(&self.sessions).drain().collect()
        };
        if sessions.is_empty() {
            return;
        }

        let count = sessions.len();
        future::join_all(sessions.iter().map(|(tenant_id, session)| async move {
            if session.is_connected() {
                close_with_timeout(*tenant_id, session).await;
            }
        }))
        .await;

        info!(count, "Closed all tenant database pools");
    }

    /// Connected flag for every cached session; never initializes anything
    pub fn connection_status(&self) -> HashMap<Uuid, bool> {
        read(&self.sessions)
            .iter()
            .map(|(tenant_id, session)| (*tenant_id, session.is_connected()))
            .collect()
    }

    /// Connected session from the cache; a disconnected one is evicted
    fn cached(&self, tenant_id: Uuid) -> Option<TenantSession> {
        let stale = {
            let sessions = read(&self.sessions);
            match sessions.get(&tenant_id) {
                Some(session) if session.is_connected() => return Some(session.clone()),
                Some(session) => session.clone(),
                None => return None,
            }
        };

        let mut sessions = write(&self.sessions);
        if sessions.get(&tenant_id).is_some_and(|s| s.ptr_eq(&stale)) {
            sessions.remove(&tenant_id);
            warn!(%tenant_id, "Evicted disconnected tenant session");
        }
        None
    }

    /// Join an in-flight initialization or register a new one, atomically per tenant
    fn join_or_start(&self, tenant_id: Uuid) -> Lookup {
        let mut pending = lock(&self.pending);
        if let Some(init) = pending.get(&tenant_id) {
            debug!(%tenant_id, "Joining in-flight tenant initialization");
            return Lookup::Pending(init.clone());
        }

        // An initialization may have settled between the cache check and taking the lock
        if let Some(session) = read(&self.sessions)
            .get(&tenant_id)
            .filter(|s| s.is_connected())
        {
            return Lookup::Ready(session.clone());
        }

        let init = initialize(self.registry.clone(), self.factory.clone(), tenant_id)
            .boxed()
            .shared();
        pending.insert(tenant_id, init.clone());
        Lookup::Pending(init)
    }

    /// First waiter to finish publishes the outcome. Returns false when the
    /// initialization was abandoned by a close and its session must not be used.
    fn settle(
        &self,
        tenant_id: Uuid,
        init: &InitFuture,
        outcome: &Result<TenantSession, RouterError>,
    ) -> bool {
        let mut pending = lock(&self.pending);
        if pending.get(&tenant_id).is_some_and(|p| p.ptr_eq(init)) {
            pending.remove(&tenant_id);
            if let Ok(session) = outcome {
                write(&self.sessions).insert(tenant_id, session.clone());
            }
            return true;
        }

        // Either a peer waiter published it already, or a close abandoned it
        match outcome {
            Ok(session) => read(&self.sessions)
                .get(&tenant_id)
                .is_some_and(|s| s.ptr_eq(session)),
            Err(_) => true,
        }
    }
}

async fn initialize(
    registry: Arc<dyn TenantRegistry>,
    factory: Arc<dyn SessionFactory>,
    tenant_id: Uuid,
) -> Result<TenantSession, RouterError> {
    let record = registry
        .find_active_by_id(tenant_id)
        .await
        .map_err(|e| {
            error!(%tenant_id, error = %e, "Tenant registry lookup failed");
            RouterError::Registry(e.to_string())
        })?
        .ok_or_else(|| {
            warn!(%tenant_id, "Tenant not found or inactive");
            RouterError::TenantNotFound(tenant_id)
        })?;

    let connection_failure = |message: String| {
        error!(%tenant_id, database = %record.db_name, error = %message, "Tenant session initialization failed");
        RouterError::ConnectionFailure { tenant_id, message }
    };

    let session = factory
        .build(tenant_id, &record.coordinates(), &record.pool_options())
        .map_err(|e| connection_failure(e.to_string()))?;

    if let Err(e) = factory.connect(&session).await {
        session.close().await;
        return Err(connection_failure(e.to_string()));
    }

    info!(%tenant_id, database = %record.db_name, "Created tenant database pool");
    Ok(session)
}

async fn close_with_timeout(tenant_id: Uuid, session: &TenantSession) {
    if tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await.is_err() {
        warn!(%tenant_id, database = %session.database(), "Timed out closing tenant database pool");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{TenantUpdate, User};
    use crate::database::registry::TenantRegistry as _;
    use crate::testing::{CountingSessionFactory, InMemoryRegistry};
    use std::time::Duration;

    fn router(registry: &Arc<InMemoryRegistry>, factory: &Arc<CountingSessionFactory>) -> Arc<TenantRouter> {
        Arc::new(TenantRouter::new(registry.clone(), factory.clone()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_builds_one_pool() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        let factory = Arc::new(CountingSessionFactory::new().with_connect_delay(Duration::from_millis(50)));
        let router = router(&registry, &factory);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let router = router.clone();
                let tenant_id = tenant.id;
                tokio::spawn(async move { router.get_session(tenant_id).await })
            })
            .collect();

        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.unwrap().unwrap());
        }

        assert_eq!(factory.builds(), 1);
        assert_eq!(registry.active_reads(), 1);
        assert!(sessions.iter().all(|s| s.ptr_eq(&sessions[0])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_failure() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        let factory = Arc::new(
            CountingSessionFactory::new()
                .with_connect_delay(Duration::from_millis(50))
                .failing_connect("connection refused"),
        );
        let router = router(&registry, &factory);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let router = router.clone();
                let tenant_id = tenant.id;
                tokio::spawn(async move { router.get_session(tenant_id).await })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(
                err,
                RouterError::ConnectionFailure { tenant_id, ref message }
                    if tenant_id == tenant.id && message.contains("connection refused")
            ));
        }
        assert_eq!(factory.builds(), 1);
        assert!(router.connection_status().is_empty());
    }

    #[tokio::test]
    async fn failed_initialization_is_not_cached() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        let factory = Arc::new(CountingSessionFactory::new().failing_connect("down"));
        let router = router(&registry, &factory);

        assert!(router.get_session(tenant.id).await.is_err());

        factory.set_connect_failure(None);
        let session = router.get_session(tenant.id).await.unwrap();

        assert_eq!(session.tenant_id(), tenant.id);
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test]
    async fn cached_session_skips_registry() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        let factory = Arc::new(CountingSessionFactory::new());
        let router = router(&registry, &factory);

        let first = router.get_session(tenant.id).await.unwrap();
        let second = router.get_session(tenant.id).await.unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(registry.active_reads(), 1);
        assert_eq!(factory.builds(), 1);
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_found() {
        let registry = Arc::new(InMemoryRegistry::new());
        let factory = Arc::new(CountingSessionFactory::new());
        let router = router(&registry, &factory);
        let missing = Uuid::new_v4();

        let err = router.get_session(missing).await.unwrap_err();

        assert!(matches!(err, RouterError::TenantNotFound(id) if id == missing));
        assert_eq!(factory.builds(), 0);
    }

    #[tokio::test]
    async fn inactive_tenant_is_not_found_without_connecting() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        registry.update(tenant.id, TenantUpdate::deactivate()).await.unwrap();
        let factory = Arc::new(CountingSessionFactory::new());
        let router = router(&registry, &factory);

        let err = router.get_session(tenant.id).await.unwrap_err();

        assert!(matches!(err, RouterError::TenantNotFound(_)));
        assert_eq!(factory.builds(), 0);
        assert_eq!(factory.connects(), 0);
    }

    #[tokio::test]
    async fn registry_outage_is_reported_and_retried() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        let factory = Arc::new(CountingSessionFactory::new());
        let router = router(&registry, &factory);

        registry.set_unavailable(true);
        let err = router.get_session(tenant.id).await.unwrap_err();
        assert!(matches!(err, RouterError::Registry(_)));

        registry.set_unavailable(false);
        assert!(router.get_session(tenant.id).await.is_ok());
    }

    #[tokio::test]
    async fn close_session_is_idempotent() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        let factory = Arc::new(CountingSessionFactory::new());
        let router = router(&registry, &factory);

        router.close_session(Uuid::new_v4()).await;

        let session = router.get_session(tenant.id).await.unwrap();
        router.close_session(tenant.id).await;
        router.close_session(tenant.id).await;

        assert!(!session.is_connected());
        assert!(router.connection_status().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deactivation_during_initialization_is_not_published() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        let factory = Arc::new(CountingSessionFactory::new().with_connect_delay(Duration::from_millis(200)));
        let router = router(&registry, &factory);

        let in_flight = {
            let router = router.clone();
            let tenant_id = tenant.id;
            tokio::spawn(async move { router.get_session(tenant_id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.update(tenant.id, TenantUpdate::deactivate()).await.unwrap();
        router.close_session(tenant.id).await;

        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, RouterError::TenantNotFound(id) if id == tenant.id));

        let err = router.get_session(tenant.id).await.unwrap_err();
        assert!(matches!(err, RouterError::TenantNotFound(_)));
        assert!(router.connection_status().is_empty());

        // The pool built for the abandoned attempt was closed, not cached
        let built = factory.built();
        assert_eq!(built.len(), 1);
        assert!(!built[0].is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_during_initialization_rebuilds_for_active_tenant() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        let factory = Arc::new(CountingSessionFactory::new().with_connect_delay(Duration::from_millis(100)));
        let router = router(&registry, &factory);

        let in_flight = {
            let router = router.clone();
            let tenant_id = tenant.id;
            tokio::spawn(async move { router.get_session(tenant_id).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        router.close_session(tenant.id).await;

        let session = in_flight.await.unwrap().unwrap();

        assert!(session.is_connected());
        assert_eq!(factory.builds(), 2);
        assert_eq!(router.connection_status().get(&tenant.id), Some(&true));
        assert!(router.get_session(tenant.id).await.unwrap().ptr_eq(&session));
    }

    #[tokio::test]
    async fn registry_deactivation_applies_once_session_is_closed() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        let factory = Arc::new(CountingSessionFactory::new());
        let router = router(&registry, &factory);

        let cached = router.get_session(tenant.id).await.unwrap();
        registry.update(tenant.id, TenantUpdate::deactivate()).await.unwrap();

        // Cache hits do not consult the registry
        assert!(router.get_session(tenant.id).await.unwrap().ptr_eq(&cached));
        assert_eq!(registry.active_reads(), 1);

        router.close_session(tenant.id).await;

        let err = router.get_session(tenant.id).await.unwrap_err();
        assert!(matches!(err, RouterError::TenantNotFound(_)));
        assert_eq!(factory.builds(), 1);
    }

    #[tokio::test]
    async fn closed_session_is_rebuilt_on_next_lookup() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        let factory = Arc::new(CountingSessionFactory::new());
        let router = router(&registry, &factory);

        let first = router.get_session(tenant.id).await.unwrap();
        // Closed behind the router's back: the cache entry is stale
        first.close().await;
        assert_eq!(router.connection_status().get(&tenant.id), Some(&false));

        let second = router.get_session(tenant.id).await.unwrap();

        assert!(!first.ptr_eq(&second));
        assert!(second.is_connected());
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test]
    async fn close_all_closes_every_session() {
        let registry = Arc::new(InMemoryRegistry::new());
        let acme = registry.seed_active("Acme").await;
        let globex = registry.seed_active("Globex").await;
        let factory = Arc::new(CountingSessionFactory::new());
        let router = router(&registry, &factory);

        let a = router.get_session(acme.id).await.unwrap();
        let b = router.get_session(globex.id).await.unwrap();
        assert_eq!(router.connection_status().len(), 2);

        router.close_all().await;
        router.close_all().await;

        assert!(!a.is_connected());
        assert!(!b.is_connected());
        assert!(router.connection_status().is_empty());
    }

    #[tokio::test]
    async fn connection_status_never_initializes() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.seed_active("Acme").await;
        let factory = Arc::new(CountingSessionFactory::new());
        let router = router(&registry, &factory);

        assert!(router.connection_status().is_empty());
        assert_eq!(registry.active_reads(), 0);
        assert_eq!(factory.builds(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_handles_share_one_pool() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = registry.seed_active("Acme").await;
        let factory = Arc::new(CountingSessionFactory::new().with_connect_delay(Duration::from_millis(20)));
        let router = router(&registry, &factory);

        let (a, b) = tokio::join!(router.handle::<User>(tenant.id), router.handle::<User>(tenant.id));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.session().ptr_eq(b.session()));
        assert_eq!(factory.builds(), 1);
    }

    #[tokio::test]
    async fn distinct_tenants_get_distinct_sessions() {
        let registry = Arc::new(InMemoryRegistry::new());
        let acme = registry.seed_active("Acme").await;
        let globex = registry.seed_active("Globex").await;
        let factory = Arc::new(CountingSessionFactory::new());
        let router = router(&registry, &factory);

        let a = router.get_session(acme.id).await.unwrap();
        let b = router.get_session(globex.id).await.unwrap();

        assert!(!a.ptr_eq(&b));
        assert_eq!(a.database(), acme.db_name);
        assert_eq!(b.database(), globex.db_name);
    }
}
