use crate::context::TenantContext;
use crate::extractor::TenantExtractor;
use thiserror::Error;
use till_database::{DatabaseError, TenantDirectory};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Host does not map to a tenant: {0}")]
    UnroutableHost(String),

    #[error(transparent)]
    Directory(#[from] DatabaseError),
}

/// Maps an incoming request host to a tenant record: subdomain extraction
/// followed by a directory lookup. The request router calls this, then
/// `ConnectionRegistry::acquire(context.tenant_id)`.
#[derive(Clone)]
pub struct TenantResolver {
    extractor: TenantExtractor,
    directory: TenantDirectory,
}

impl TenantResolver {
    pub fn new(extractor: TenantExtractor, directory: TenantDirectory) -> Self {
        Self {
            extractor,
            directory,
        }
    }

    pub async fn resolve(&self, host: &str) -> Result<TenantContext, ResolveError> {
        let subdomain = self
            .extractor
            .subdomain(host)
            .ok_or_else(|| ResolveError::UnroutableHost(host.to_string()))?
            .to_ascii_lowercase();

        let tenant = self.directory.get_by_subdomain(&subdomain).await?;
        Ok(TenantContext::with_tenant(tenant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use till_database::{open_pool, RouterConfig};
    use till_models::NewTenant;
    use uuid::Uuid;

    #[tokio::test]
    #[ignore] // Only run with database available
    async fn test_resolve_routes_known_subdomain() {
        let config = RouterConfig::from_env();
        let pool = open_pool(&config.control_url, &config.control_pool)
            .await
            .expect("connect");
        let directory = TenantDirectory::new(pool, config.locators.clone());
        directory.ensure_control_schema().await.expect("schema");

        let subdomain = format!("res-{}", Uuid::new_v4().simple());
        let request = NewTenant {
            name: "Resolver Shop".to_string(),
            subdomain: subdomain.clone(),
            subscription_tier: None,
        };
        let tenant = directory
            .create(&request, "TILL-AB12-CD34-0040")
            .await
            .expect("create");

        let resolver = TenantResolver::new(TenantExtractor::new("till.example.com"), directory);

        let context = resolver
            .resolve(&format!("{subdomain}.till.example.com"))
            .await
            .expect("resolve");
        assert_eq!(context.tenant_id, tenant.id);

        let err = resolver.resolve("till.example.com").await.unwrap_err();
        assert!(matches!(err, ResolveError::UnroutableHost(_)));
    }
}
