pub mod connection;
pub mod directory;
pub mod error;
pub mod migrator;
pub mod registry;
pub mod schema;

pub use connection::{
    ensure_database, open_pool, CredentialCipher, LocatorScheme, PoolSettings, RouterConfig,
    StoreLocator,
};
pub use directory::TenantDirectory;
pub use error::{DatabaseError, Result};
pub use migrator::{copy_plan, CopyStep, PurgeAuthorization, TierMigrator};
pub use registry::{
    ConnectionHandle, ConnectionRegistry, PgStoreOpener, RegistryStats, SchemaSnapshot,
    StoreOpener, TenantSource,
};
pub use schema::{
    catalog, column_migrations, ColumnKind, ColumnMigration, ColumnSpec, SchemaProvisioner,
    SchemaState, TableDef, Topology, DISCRIMINATOR,
};
