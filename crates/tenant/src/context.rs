// Tenant context for request handling

use serde::Serialize;
use till_models::Tenant;
use uuid::Uuid;

/// Per-request carrier handed to domain controllers alongside the acquired
/// store handle.
#[derive(Debug, Clone, Serialize)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub tenant: Option<Tenant>,
}

impl TenantContext {
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            tenant: None,
        }
    }

    pub fn with_tenant(tenant: Tenant) -> Self {
        Self {
            tenant_id: tenant.id,
            tenant: Some(tenant),
        }
    }
}
