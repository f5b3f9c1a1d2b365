// handlers/tenant.rs - /api/tenant/:tenant_id data routes
//
// The tenant session is resolved by `resolve_tenant_middleware` before any
// handler here runs.

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    Json,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::database::models::{Product, User};
use crate::database::repository::{Entity, Handle};
use crate::error::ApiError;
use crate::middleware::{ApiResponse, ApiResult, TenantContext};
use crate::services::user_bootstrap::password_digest;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

impl ListQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

fn handle<T: Entity>(TenantContext(session): TenantContext) -> Handle<T> {
    Handle::new(session)
}

fn object(payload: Result<Json<Value>, JsonRejection>) -> Result<Map<String, Value>, ApiError> {
    let Json(body) = payload?;
    match body {
        Value::Object(fields) => Ok(fields),
        _ => Err(ApiError::invalid_json("Request body must be a JSON object")),
    }
}

/// GET /api/tenant/:tenant_id/users
pub async fn users_list(
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<User>> {
    let users = handle::<User>(tenant).find_all(query.limit()).await?;
    Ok(ApiResponse::success(users))
}

/// POST /api/tenant/:tenant_id/users - `password` is stored as a digest
pub async fn users_create(
    Extension(tenant): Extension<TenantContext>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<User> {
    let mut fields = object(payload)?;
    if let Some(password) = fields.remove("password") {
        let password = password
            .as_str()
            .ok_or_else(|| ApiError::bad_request("password must be a string"))?;
        fields.insert("password_hash".into(), Value::String(password_digest(password)));
    }

    let user = handle::<User>(tenant).insert(&fields).await?;
    Ok(ApiResponse::created(user))
}

/// GET /api/tenant/:tenant_id/products
pub async fn products_list(
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Product>> {
    let products = handle::<Product>(tenant).find_all(query.limit()).await?;
    Ok(ApiResponse::success(products))
}

/// POST /api/tenant/:tenant_id/products
pub async fn products_create(
    Extension(tenant): Extension<TenantContext>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Product> {
    let fields = object(payload)?;
    let product = handle::<Product>(tenant).insert(&fields).await?;
    Ok(ApiResponse::created(product))
}

/// GET /api/tenant/:tenant_id/products/:id
pub async fn product_show(
    Extension(tenant): Extension<TenantContext>,
    Path((_tenant_id, id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Product> {
    handle::<Product>(tenant)
        .find_by_id(id)
        .await?
        .map(ApiResponse::success)
        .ok_or_else(|| ApiError::not_found(format!("Product not found: {}", id)))
}

/// DELETE /api/tenant/:tenant_id/products/:id
pub async fn product_delete(
    Extension(tenant): Extension<TenantContext>,
    Path((_tenant_id, id)): Path<(Uuid, Uuid)>,
) -> ApiResult<()> {
    if !handle::<Product>(tenant).delete(id).await? {
        return Err(ApiError::not_found(format!("Product not found: {}", id)));
    }
    Ok(ApiResponse::no_content())
}
