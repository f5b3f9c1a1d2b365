use axum::{
    extract::{Path, Request, State},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use uuid::Uuid;

use crate::api::AppState;
use crate::database::session::TenantSession;
use crate::error::ApiError;

/// Routed session for the tenant named in the path, injected by middleware
#[derive(Clone, Debug)]
pub struct TenantContext(pub TenantSession);

/// Resolves `:tenant_id` through the router so handlers never see an unknown,
/// inactive, or unreachable tenant
pub async fn resolve_tenant_middleware(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let raw = params
        .get("tenant_id")
        .ok_or_else(|| ApiError::bad_request("Missing tenant id"))?;
    let tenant_id: Uuid = raw
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid tenant id: {}", raw)))?;

    let session = state.router.get_session(tenant_id).await?;
    tracing::debug!(%tenant_id, database = %session.database(), "Tenant session resolved");

    request.extensions_mut().insert(TenantContext(session));
    Ok(next.run(request).await)
}
