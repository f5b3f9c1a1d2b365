use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::JwtIssuer;
use crate::config::{ApiConfig, AppConfig};
use crate::database::admin::PgAdminDatabase;
use crate::database::migrations::SqlMigrator;
use crate::database::models::ResolvedPoolOptions;
use crate::database::registry::{PgTenantRegistry, TenantRegistry};
use crate::database::router::TenantRouter;
use crate::database::session::PgSessionFactory;
use crate::handlers;
use crate::middleware::resolve_tenant_middleware;
use crate::services::tenant_service::TenantService;
use crate::services::user_bootstrap::TenantUserBootstrap;

/// Shared handles for every request
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<TenantRouter>,
    pub tenants: Arc<TenantService>,
    pub registry: Arc<dyn TenantRegistry>,
}

impl AppState {
    /// Wire the Postgres-backed registry, router and provisioner from config.
    /// Only the registry is contacted here; tenant pools open on first use.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let registry_coordinates = config.registry.coordinates()?;
        let registry_pool =
            PgSessionFactory::build_pool(&registry_coordinates, &ResolvedPoolOptions::registry_default());
        let registry = Arc::new(PgTenantRegistry::new(registry_pool));
        registry.ensure_schema().await?;
        tracing::info!(
            host = %registry_coordinates.host,
            database = %registry_coordinates.database,
            "Tenant registry ready"
        );

        let factory = Arc::new(PgSessionFactory::new(config.pool.resolved()));
        let router = Arc::new(TenantRouter::new(registry.clone(), factory.clone()));
        let admin = Arc::new(PgAdminDatabase::connect_lazy(&config.admin.coordinates()));
        let issuer = JwtIssuer::new(config.security.jwt_secret.clone(), config.security.jwt_expiry_hours);

        let tenants = TenantService::new(
            registry.clone(),
            router.clone(),
            factory,
            admin,
            Arc::new(SqlMigrator::default()),
        )
        .with_bootstrap(Arc::new(TenantUserBootstrap::new(router.clone(), issuer)));

        Ok(Self {
            router,
            tenants: Arc::new(tenants),
            registry,
        })
    }
}

pub fn app(state: AppState, config: &ApiConfig) -> Router {
    let mut app = Router::new()
        // Public
        .route("/", get(root))
        .route("/health", get(handlers::public::health))
        .merge(root_routes())
        .merge(tenant_routes(state.clone()))
        .with_state(state);

    // Global middleware
    if config.enable_cors {
        app = app.layer(CorsLayer::permissive());
    }
    if config.enable_request_logging {
        app = app.layer(TraceLayer::new_for_http());
    }
    app
}

fn root_routes() -> Router<AppState> {
    use handlers::root;

    Router::new()
        .route("/api/root/tenant", post(root::tenant_create).get(root::tenant_list))
        .route("/api/root/tenant/status", get(root::tenant_status))
        .route("/api/root/tenant/:id", get(root::tenant_show).delete(root::tenant_delete))
}

fn tenant_routes(state: AppState) -> Router<AppState> {
    use handlers::tenant;

    Router::new()
        .route(
            "/api/tenant/:tenant_id/users",
            get(tenant::users_list).post(tenant::users_create),
        )
        .route(
            "/api/tenant/:tenant_id/products",
            get(tenant::products_list).post(tenant::products_create),
        )
        .route(
            "/api/tenant/:tenant_id/products/:id",
            get(tenant::product_show).delete(tenant::product_delete),
        )
        // Path params are only visible to route-level middleware
        .route_layer(from_fn_with_state(state, resolve_tenant_middleware))
}

async fn root() -> axum::Json<Value> {
    axum::Json(json!({
        "success": true,
        "data": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "endpoints": {
                "health": "/health (public)",
                "root": "/api/root/tenant[/:id|/status] (tenant administration)",
                "tenant": "/api/tenant/:tenant_id/{users,products}[/:id] (routed data)",
            }
        }
    }))
}
