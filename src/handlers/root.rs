// handlers/root.rs - /api/root/tenant administration

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::api::AppState;
use crate::database::models::TenantInfo;
use crate::middleware::{ApiResponse, ApiResult};
use crate::services::tenant_service::{CreateTenantRequest, TenantCreationResult};

/**
 * POST /api/root/tenant - Provision a tenant
 *
 * ```json
 * {
 *   "name": "acme",
 *   "database": { "host": "db", "port": 5432, "user": "acme", "password": "..." },
 *   "pool_options": { "max": 10, "idleTimeoutMs": 30000 },
 *   "admin_user": { "email": "admin@acme.com", "password": "..." }
 * }
 * ```
 */
pub async fn tenant_create(
    State(state): State<AppState>,
    payload: Result<Json<CreateTenantRequest>, JsonRejection>,
) -> ApiResult<TenantCreationResult> {
    let Json(request) = payload?;
    let created = state.tenants.create_tenant(request).await?;
    Ok(ApiResponse::created(created))
}

/// GET /api/root/tenant - Active tenants, newest first
pub async fn tenant_list(State(state): State<AppState>) -> ApiResult<Vec<TenantInfo>> {
    Ok(ApiResponse::success(state.tenants.list_tenants().await?))
}

/// GET /api/root/tenant/:id
pub async fn tenant_show(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<TenantInfo> {
    Ok(ApiResponse::success(state.tenants.get_tenant(id).await?))
}

/// DELETE /api/root/tenant/:id - Deactivate and drop the cached session
pub async fn tenant_delete(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<()> {
    state.tenants.deactivate_tenant(id).await?;
    Ok(ApiResponse::no_content())
}

/// GET /api/root/tenant/status - Connected flag per cached tenant session
pub async fn tenant_status(State(state): State<AppState>) -> ApiResult<BTreeMap<Uuid, bool>> {
    let status = state.router.connection_status().into_iter().collect();
    Ok(ApiResponse::success(status))
}
