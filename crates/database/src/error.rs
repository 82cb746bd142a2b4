use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Invalid license key: {0}")]
    LicenseInvalid(String),

    #[error("Subdomain already taken: {0}")]
    SubdomainTaken(String),

    #[error("Tenant {tenant} is not active (status: {status})")]
    TenantInactive { tenant: String, status: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Schema provisioning failed for {locator}: {reason}")]
    SchemaProvisionFailed { locator: String, reason: String },

    #[error("Column evolution failed on {table}.{column}: {reason}")]
    ColumnEvolutionFailed {
        table: String,
        column: String,
        reason: String,
    },

    #[error("Migration of table {table} failed: {reason}")]
    MigrationTableFailed { table: String, reason: String },

    #[error("Tenant {0} is not in shared mode")]
    NotShared(Uuid),

    #[error("Tenant {0} is not isolated; refusing to touch shared rows")]
    NotIsolated(Uuid),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DatabaseError {
    pub fn tenant_not_found(key: impl std::fmt::Display) -> Self {
        Self::TenantNotFound(key.to_string())
    }

    pub fn provision_failed(locator: &str, source: &sqlx::Error) -> Self {
        Self::SchemaProvisionFailed {
            locator: locator.to_string(),
            reason: source.to_string(),
        }
    }

    /// Equivalent error handed to callers coalesced behind a single-flight
    /// open. `sqlx::Error` is not `Clone`, so the driver error collapses to
    /// its message.
    pub(crate) fn for_waiters(&self) -> Self {
        match self {
            Self::TenantNotFound(k) => Self::TenantNotFound(k.clone()),
            Self::LicenseInvalid(r) => Self::LicenseInvalid(r.clone()),
            Self::SubdomainTaken(s) => Self::SubdomainTaken(s.clone()),
            Self::TenantInactive { tenant, status } => Self::TenantInactive {
                tenant: tenant.clone(),
                status: status.clone(),
            },
            Self::ConnectionFailed(r) => Self::ConnectionFailed(r.clone()),
            Self::SchemaProvisionFailed { locator, reason } => Self::SchemaProvisionFailed {
                locator: locator.clone(),
                reason: reason.clone(),
            },
            Self::ColumnEvolutionFailed {
                table,
                column,
                reason,
            } => Self::ColumnEvolutionFailed {
                table: table.clone(),
                column: column.clone(),
                reason: reason.clone(),
            },
            Self::MigrationTableFailed { table, reason } => Self::MigrationTableFailed {
                table: table.clone(),
                reason: reason.clone(),
            },
            Self::NotShared(id) => Self::NotShared(*id),
            Self::NotIsolated(id) => Self::NotIsolated(*id),
            Self::InvalidInput(r) => Self::InvalidInput(r.clone()),
            Self::Sqlx(e) => Self::ConnectionFailed(e.to_string()),
            Self::Internal(r) => Self::Internal(r.clone()),
        }
    }
}

/// SQLSTATE 23505: unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "23505")
}

/// SQLSTATE 42701: column already exists. Two racing `ADD COLUMN`
/// statements make the loser hit this; it means the column is there.
pub(crate) fn is_duplicate_column(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "42701")
}

/// SQLSTATE 42P04: database already exists.
pub(crate) fn is_duplicate_database(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "42P04")
}

fn has_sqlstate(err: &sqlx::Error, code: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(code))
}
