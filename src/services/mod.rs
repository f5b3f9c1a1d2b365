pub mod tenant_service;
pub mod user_bootstrap;

pub use tenant_service::{CreateTenantRequest, TenantCreationResult, TenantError, TenantService};
pub use user_bootstrap::{TenantUserBootstrap, UserBootstrap};
