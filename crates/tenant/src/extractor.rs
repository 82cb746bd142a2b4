//! Extracts the tenant subdomain from the request Host header.

/// Subdomains that can never belong to a tenant.
const RESERVED: &[&str] = &["www", "api", "admin", "app"];

#[derive(Debug, Clone)]
pub struct TenantExtractor {
    base_domain: String,
}

impl TenantExtractor {
    /// `base_domain` is the platform apex, e.g. `till.example.com`;
    /// tenants live one label below it (`acme.till.example.com`).
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into().to_ascii_lowercase(),
        }
    }

    /// Extract the tenant subdomain from a Host header value.
    ///
    /// Returns `None` for the apex itself, reserved subdomains, nested
    /// labels and hosts outside the platform domain.
    pub fn subdomain<'a>(&self, host: &'a str) -> Option<&'a str> {
        let host = host.split(':').next().unwrap_or(host);
        let host = host.strip_suffix('.').unwrap_or(host);

        if host.eq_ignore_ascii_case(&self.base_domain) {
            return None;
        }

        let suffix = format!(".{}", self.base_domain);
        if host.len() <= suffix.len() || !host.to_ascii_lowercase().ends_with(&suffix) {
            return None;
        }

        let prefix = &host[..host.len() - suffix.len()];
        if prefix.contains('.') {
            return None;
        }
        if RESERVED.iter().any(|r| prefix.eq_ignore_ascii_case(r)) {
            return None;
        }

        Some(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> TenantExtractor {
        TenantExtractor::new("till.example.com")
    }

    #[test]
    fn test_extracts_tenant_subdomain() {
        assert_eq!(extractor().subdomain("acme.till.example.com"), Some("acme"));
        assert_eq!(
            extractor().subdomain("acme.till.example.com:8443"),
            Some("acme")
        );
        assert_eq!(
            extractor().subdomain("Acme.Till.Example.Com"),
            Some("Acme")
        );
    }

    #[test]
    fn test_rejects_apex_and_reserved() {
        assert_eq!(extractor().subdomain("till.example.com"), None);
        assert_eq!(extractor().subdomain("www.till.example.com"), None);
        assert_eq!(extractor().subdomain("api.till.example.com"), None);
    }

    #[test]
    fn test_rejects_foreign_and_nested_hosts() {
        assert_eq!(extractor().subdomain("acme.other.example.com"), None);
        assert_eq!(extractor().subdomain("a.b.till.example.com"), None);
        assert_eq!(extractor().subdomain("eviltill.example.com"), None);
        assert_eq!(extractor().subdomain(""), None);
    }
}
