// Core modules
pub mod migration;
pub mod tenant;

// Re-export commonly used types
pub use migration::{MigrationJob, MigrationStatus, TableMigration, TableOutcome};
pub use tenant::{
    subdomain_is_valid, IsolationMode, NewTenant, SubscriptionTier, Tenant, TenantStatus,
};
