pub mod admin;
pub mod migrations;
pub mod models;
pub mod registry;
pub mod repository;
pub mod router;
pub mod session;

pub use admin::{AdminDatabase, AdminError, PgAdminDatabase};
pub use migrations::{MigrationError, Migrator, SqlMigrator};
pub use registry::{PgTenantRegistry, RegistryError, TenantRegistry};
pub use repository::{Entity, Handle, HandleError};
pub use router::{RouterError, TenantRouter};
pub use session::{PgSessionFactory, SessionError, SessionFactory, TenantSession};
