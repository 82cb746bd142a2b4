//! Tenant connection registry.
//!
//! Routes database access by tenant isolation mode: shared-mode tenants all
//! ride the one shared-store pool, isolated tenants get a dedicated pool
//! opened from their storage locator. Live handles are cached per tenant;
//! a cold acquire is single-flighted so concurrent callers trigger exactly
//! one physical open. Cached handles are health-checked on every acquire
//! and silently replaced when corrupted.
//!
//! The registry is an explicit object, constructed once at startup and
//! passed by reference. There is no module-level state.

use crate::connection::{
    ensure_database, open_pool, CredentialCipher, RouterConfig, StoreLocator,
};
use crate::directory::TenantDirectory;
use crate::error::{DatabaseError, Result};
use crate::schema::{catalog, SchemaProvisioner, Topology};
use moka::future::Cache;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use till_models::{IsolationMode, Tenant};
use uuid::Uuid;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where the registry looks tenants up. The control-plane directory is the
/// production source; tests substitute an in-memory map.
pub trait TenantSource: Send + Sync {
    fn tenant_by_id(&self, id: Uuid) -> BoxFuture<'_, Result<Tenant>>;
}

impl TenantSource for TenantDirectory {
    fn tenant_by_id(&self, id: Uuid) -> BoxFuture<'_, Result<Tenant>> {
        Box::pin(self.get_by_id(id))
    }
}

/// Physical pool opener. The production opener connects and verifies
/// liveness; tests count invocations and hand back lazy pools.
pub trait StoreOpener: Send + Sync {
    fn open<'a>(&'a self, locator: &'a StoreLocator) -> BoxFuture<'a, Result<PgPool>>;
}

/// Opens real Postgres pools and pings them before handing them out.
pub struct PgStoreOpener;

impl StoreOpener for PgStoreOpener {
    fn open<'a>(&'a self, locator: &'a StoreLocator) -> BoxFuture<'a, Result<PgPool>> {
        Box::pin(async move {
            let pool = PgPoolOptions::new()
                .max_connections(locator.pool.max_connections)
                .min_connections(locator.pool.min_connections)
                .acquire_timeout(locator.pool.acquire_timeout)
                .idle_timeout(locator.pool.idle_timeout)
                .connect_with(locator.connect_options())
                .await
                .map_err(|e| {
                    DatabaseError::ConnectionFailed(format!(
                        "Failed to connect to {}: {}",
                        locator.database, e
                    ))
                })?;

            // Liveness check before the pool is cached anywhere.
            sqlx::query("SELECT 1").execute(&pool).await.map_err(|e| {
                DatabaseError::ConnectionFailed(format!(
                    "Store {} is not answering: {}",
                    locator.database, e
                ))
            })?;

            tracing::info!(locator = %locator.database, "Opened store pool");
            Ok(pool)
        })
    }
}

/// The handle's view of what schema its store serves. Long-lived pooled
/// handles have been observed to lose this under concurrent
/// re-initialization; an empty slot marks the handle as corrupted.
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    pub topology: Topology,
    pub tables: Vec<&'static str>,
}

impl SchemaSnapshot {
    fn current(topology: Topology) -> Self {
        Self {
            topology,
            tables: catalog().iter().map(|t| t.name).collect(),
        }
    }
}

/// A live, cached connection to the store backing one tenant.
///
/// Owned exclusively by the registry: created lazily, destroyed on release
/// or detected corruption, recreated transparently with a bumped
/// generation.
pub struct ConnectionHandle {
    tenant_id: Uuid,
    mode: IsolationMode,
    locator: String,
    generation: u64,
    pool: PgPool,
    schema: RwLock<Option<SchemaSnapshot>>,
}

impl ConnectionHandle {
    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    /// Database name this handle is connected to. Every shared-mode tenant
    /// reports the same shared locator.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Incremented each time the registry replaces a corrupted or released
    /// handle for this tenant.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The pooled client. Everything downstream issues ordinary
    /// parameterized queries through this.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema_snapshot(&self) -> Option<SchemaSnapshot> {
        self.schema.read().ok().and_then(|s| s.clone())
    }

    /// A handle is healthy while its pool is open and its schema snapshot
    /// slot is populated.
    pub fn is_healthy(&self) -> bool {
        !self.pool.is_closed() && self.schema.read().map(|s| s.is_some()).unwrap_or(false)
    }

    #[cfg(test)]
    fn corrupt_schema_registry(&self) {
        if let Ok(mut slot) = self.schema.write() {
            *slot = None;
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("tenant_id", &self.tenant_id)
            .field("mode", &self.mode)
            .field("locator", &self.locator)
            .field("generation", &self.generation)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub cached_connections: u64,
    pub max_cache_size: u64,
    pub self_heals: u64,
}

/// Process-wide cache of live store handles keyed by tenant.
pub struct ConnectionRegistry {
    source: Arc<dyn TenantSource>,
    opener: Arc<dyn StoreOpener>,
    provisioner: SchemaProvisioner,
    config: RouterConfig,
    cipher: Option<CredentialCipher>,
    shared_pool: PgPool,
    cache: Cache<Uuid, Arc<ConnectionHandle>>,
    generations: Mutex<HashMap<Uuid, u64>>,
    self_heals: AtomicU64,
}

impl ConnectionRegistry {
    /// Assemble a registry from its parts. `shared_pool` is the singleton
    /// pool every shared-mode tenant rides.
    pub fn new(
        source: Arc<dyn TenantSource>,
        shared_pool: PgPool,
        opener: Arc<dyn StoreOpener>,
        config: RouterConfig,
    ) -> Result<Self> {
        let cipher = config
            .encryption_key
            .as_deref()
            .map(CredentialCipher::from_base64)
            .transpose()?;

        let cache = Cache::builder()
            .max_capacity(config.max_cached_connections)
            .time_to_live(config.connection_ttl)
            .build();

        Ok(Self {
            source,
            opener,
            provisioner: SchemaProvisioner::new(),
            config,
            cipher,
            shared_pool,
            cache,
            generations: Mutex::new(HashMap::new()),
            self_heals: AtomicU64::new(0),
        })
    }

    /// Open the control-plane and shared-store pools and wire up a
    /// production registry plus the directory it routes through.
    pub async fn connect(config: RouterConfig) -> Result<(Self, TenantDirectory)> {
        let control = open_pool(&config.control_url, &config.control_pool).await?;
        let shared = open_pool(&config.shared_url, &config.shared_pool).await?;

        let directory = TenantDirectory::new(control, config.locators.clone());
        let registry = Self::new(
            Arc::new(directory.clone()),
            shared,
            Arc::new(PgStoreOpener),
            config,
        )?;
        Ok((registry, directory))
    }

    /// Acquire the live handle for a tenant, opening one if needed.
    ///
    /// Cached handles are health-checked first; a corrupted handle is
    /// evicted and reopened transparently, so the caller never observes the
    /// corrupted instance. Cold opens are single-flighted per tenant key:
    /// concurrent callers all receive the same resulting handle from one
    /// physical open.
    pub async fn acquire(&self, tenant_id: Uuid) -> Result<Arc<ConnectionHandle>> {
        if let Some(handle) = self.cache.get(&tenant_id).await {
            if handle.is_healthy() {
                return Ok(handle);
            }
            tracing::warn!(
                tenant = %tenant_id,
                generation = handle.generation(),
                "Evicting corrupted connection handle, reopening"
            );
            self.cache.invalidate(&tenant_id).await;
            self.self_heals.fetch_add(1, Ordering::Relaxed);
        }

        self.cache
            .try_get_with(tenant_id, self.open_handle(tenant_id))
            .await
            .map_err(|e: Arc<DatabaseError>| e.for_waiters())
    }

    /// Administrative disconnect: evict the tenant's handle and close its
    /// dedicated pool. The shared singleton pool is never closed.
    pub async fn release(&self, tenant_id: Uuid) {
        if let Some(handle) = self.cache.get(&tenant_id).await {
            self.cache.invalidate(&tenant_id).await;
            if handle.mode() == IsolationMode::Isolated {
                handle.pool().close().await;
            }
            tracing::info!(tenant = %tenant_id, "Released connection handle");
        }
    }

    /// How many corrupted handles have been replaced since startup.
    pub fn self_heal_count(&self) -> u64 {
        self.self_heals.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            cached_connections: self.cache.entry_count(),
            max_cache_size: self.config.max_cached_connections,
            self_heals: self.self_heal_count(),
        }
    }

    /// The shared-store singleton pool, for platform-level operations that
    /// are already discriminator-scoped.
    pub fn shared_pool(&self) -> &PgPool {
        &self.shared_pool
    }

    pub(crate) fn provisioner(&self) -> &SchemaProvisioner {
        &self.provisioner
    }

    async fn open_handle(&self, tenant_id: Uuid) -> Result<Arc<ConnectionHandle>> {
        let tenant = self.source.tenant_by_id(tenant_id).await?;
        if !tenant.is_active() {
            return Err(DatabaseError::TenantInactive {
                tenant: tenant.subdomain.clone(),
                status: format!("{:?}", tenant.status).to_lowercase(),
            });
        }

        let (pool, locator, topology) = match tenant.isolation_mode {
            IsolationMode::Shared => (
                self.shared_pool.clone(),
                self.config.locators.shared_name.clone(),
                Topology::Shared,
            ),
            IsolationMode::Isolated => {
                let locator = self.store_locator(&tenant)?;
                if self.config.auto_provision {
                    ensure_database(&locator, &self.config.tenant_admin_db).await?;
                }
                let pool = self.opener.open(&locator).await?;
                (pool, locator.database, Topology::Isolated)
            }
        };

        if self.config.auto_provision {
            self.provisioner.ensure_schema(&pool, topology).await?;
        }

        let generation = self.next_generation(tenant_id);
        tracing::debug!(tenant = %tenant_id, locator = %locator, generation, "Opened handle");

        Ok(Arc::new(ConnectionHandle {
            tenant_id,
            mode: tenant.isolation_mode,
            locator,
            generation,
            pool,
            schema: RwLock::new(Some(SchemaSnapshot::current(topology))),
        }))
    }

    /// Open a dedicated pool for an explicit locator name, regardless of
    /// the tenant's current isolation mode. The tier migrator uses this to
    /// reach the target store while the tenant is still routed shared.
    pub(crate) async fn open_dedicated(&self, tenant: &Tenant, database: &str) -> Result<PgPool> {
        let mut locator = self.store_locator(tenant)?;
        locator.database = database.to_string();
        if self.config.auto_provision {
            ensure_database(&locator, &self.config.tenant_admin_db).await?;
        }
        self.opener.open(&locator).await
    }

    /// Resolve where a tenant's dedicated store lives: per-tenant overrides
    /// from the directory when present, platform defaults otherwise.
    fn store_locator(&self, tenant: &Tenant) -> Result<StoreLocator> {
        let password = match (&tenant.database_password_encrypted, &self.cipher) {
            (Some(encrypted), Some(cipher)) => Some(cipher.decrypt(encrypted)?),
            (Some(_), None) => {
                return Err(DatabaseError::Internal(format!(
                    "Tenant {} has encrypted store credentials but no encryption key is configured",
                    tenant.subdomain
                )))
            }
            (None, _) => self.config.tenant_password.clone(),
        };

        Ok(StoreLocator {
            database: tenant.storage_locator.clone(),
            host: tenant
                .database_host
                .clone()
                .unwrap_or_else(|| self.config.tenant_host.clone()),
            port: tenant
                .database_port
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(self.config.tenant_port),
            user: tenant
                .database_user
                .clone()
                .unwrap_or_else(|| self.config.tenant_user.clone()),
            password,
            pool: self.config.tenant_pool.clone(),
        })
    }

    fn next_generation(&self, tenant_id: Uuid) -> u64 {
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counter = generations.entry(tenant_id).or_insert(0);
        *counter += 1;
        *counter
    }
}
