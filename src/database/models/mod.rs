pub mod product;
pub mod tenant;
pub mod user;

pub use product::Product;
pub use tenant::{
    database_name_for, DbCoordinates, NewTenantRecord, PoolOptions, ResolvedPoolOptions,
    TenantInfo, TenantRecord, TenantUpdate,
};
pub use user::User;
