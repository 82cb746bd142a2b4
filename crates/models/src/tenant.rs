use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// A tenant: one customer organization and the unit of data isolation.
///
/// Owned by the control-plane directory. `isolation_mode` moves from
/// `Shared` to `Isolated` exactly once (on tier upgrade) and never back.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,

    /// Globally unique; resolved from the request host by the router.
    pub subdomain: String,

    pub isolation_mode: IsolationMode,
    pub subscription_tier: SubscriptionTier,

    /// Database name backing this tenant: the shared store name for
    /// shared-mode tenants, `<prefix><tenant id>` for isolated ones.
    pub storage_locator: String,

    pub status: TenantStatus,

    // Optional per-tenant overrides for the dedicated store server.
    // Unset tenants use the platform-wide tenant-store settings.
    pub database_host: Option<String>,
    pub database_port: Option<i32>,
    pub database_user: Option<String>,
    #[serde(skip_serializing)]
    pub database_password_encrypted: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }

    pub fn is_shared(&self) -> bool {
        self.isolation_mode == IsolationMode::Shared
    }
}

/// Isolation mode for multi-tenancy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Rows live in the shared store, scoped by the tenant discriminator.
    Shared,
    /// A dedicated database holds this tenant's rows; no discriminator.
    Isolated,
}

impl Default for IsolationMode {
    fn default() -> Self {
        IsolationMode::Shared
    }
}

/// Subscription tier; `Free` tenants start shared, paid tiers qualify for
/// a dedicated store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Enterprise,
}

impl SubscriptionTier {
    /// Whether tenants on this tier are entitled to an isolated store.
    pub fn qualifies_for_isolation(&self) -> bool {
        !matches!(self, SubscriptionTier::Free)
    }
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        SubscriptionTier::Free
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Provisioning,
    Active,
    Suspended,
}

/// Create new tenant request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewTenant {
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    #[validate(length(min = 3, max = 63))]
    pub subdomain: String,

    pub subscription_tier: Option<SubscriptionTier>,
}

/// DNS-label rules: lowercase alphanumerics and hyphens, no leading or
/// trailing hyphen. Checked on top of the derived length bounds.
pub fn subdomain_is_valid(subdomain: &str) -> bool {
    subdomain.len() >= 3
        && subdomain.len() <= 63
        && subdomain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdomain_validation() {
        assert!(subdomain_is_valid("acme-coffee"));
        assert!(subdomain_is_valid("acme2"));

        assert!(!subdomain_is_valid("ac")); // too short
        assert!(!subdomain_is_valid("Acme")); // uppercase
        assert!(!subdomain_is_valid("-acme"));
        assert!(!subdomain_is_valid("acme-"));
        assert!(!subdomain_is_valid("acme.shop"));
    }

    #[test]
    fn test_new_tenant_length_bounds() {
        let request = NewTenant {
            name: "Acme Coffee".to_string(),
            subdomain: "ac".to_string(),
            subscription_tier: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_tier_isolation_entitlement() {
        assert!(!SubscriptionTier::Free.qualifies_for_isolation());
        assert!(SubscriptionTier::Pro.qualifies_for_isolation());
        assert!(SubscriptionTier::Enterprise.qualifies_for_isolation());
    }
}
