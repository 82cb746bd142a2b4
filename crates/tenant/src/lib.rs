// Tenant extraction and routing logic
// Resolves the tenant behind an incoming request host before any domain
// controller touches a store handle.

pub mod context;
pub mod extractor;
pub mod resolver;

pub use context::TenantContext;
pub use extractor::TenantExtractor;
pub use resolver::{ResolveError, TenantResolver};
