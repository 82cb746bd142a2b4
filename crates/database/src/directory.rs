use crate::connection::{CredentialCipher, LocatorScheme};
use crate::error::{is_unique_violation, DatabaseError, Result};
use sea_query::{Alias, ColumnDef, Index, PostgresQueryBuilder, Table};
use sqlx::PgPool;
use till_models::{IsolationMode, NewTenant, SubscriptionTier, Tenant, TenantStatus};
use uuid::Uuid;
use validator::Validate;

const TENANT_COLUMNS: &str = "id, name, subdomain, isolation_mode, subscription_tier, \
     storage_locator, status, database_host, database_port, database_user, \
     database_password_encrypted, created_at, updated_at";

/// Control-plane record store for tenant identity, tier, isolation mode and
/// storage locator. Runs entirely against the control-plane pool; tenant
/// data never lives here.
#[derive(Clone)]
pub struct TenantDirectory {
    pool: PgPool,
    locators: LocatorScheme,
}

impl TenantDirectory {
    pub fn new(pool: PgPool, locators: LocatorScheme) -> Self {
        Self { pool, locators }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn locators(&self) -> &LocatorScheme {
        &self.locators
    }

    /// Create the control-plane tables (tenants, migration_jobs) if absent.
    /// Called once at startup by whoever owns the control pool.
    pub async fn ensure_control_schema(&self) -> Result<()> {
        for stmt in control_schema_ddl() {
            sqlx::query(&stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| DatabaseError::provision_failed("control", &e))?;
        }
        Ok(())
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Tenant> {
        let sql = format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1");
        sqlx::query_as::<_, Tenant>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::tenant_not_found(id))
    }

    pub async fn get_by_subdomain(&self, subdomain: &str) -> Result<Tenant> {
        let sql = format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE subdomain = $1");
        sqlx::query_as::<_, Tenant>(&sql)
            .bind(subdomain)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::tenant_not_found(subdomain))
    }

    /// Onboard a tenant. Fails with `LicenseInvalid` on a bad license proof
    /// and `SubdomainTaken` when the subdomain is already claimed.
    ///
    /// Free-tier tenants start in the shared store; qualifying tiers get
    /// their deterministic dedicated locator from day one.
    pub async fn create(&self, request: &NewTenant, license_key: &str) -> Result<Tenant> {
        verify_license(license_key)?;
        request
            .validate()
            .map_err(|e| DatabaseError::InvalidInput(e.to_string()))?;
        if !till_models::subdomain_is_valid(&request.subdomain) {
            return Err(DatabaseError::InvalidInput(format!(
                "subdomain '{}' is not a valid DNS label",
                request.subdomain
            )));
        }

        let tier = request.subscription_tier.unwrap_or_default();
        let id = Uuid::new_v4();
        let (mode, locator) = if tier.qualifies_for_isolation() {
            (IsolationMode::Isolated, self.locators.dedicated_locator(id))
        } else {
            (
                IsolationMode::Shared,
                self.locators.shared_locator().to_string(),
            )
        };

        let sql = format!(
            "INSERT INTO tenants (id, name, subdomain, isolation_mode, subscription_tier, \
             storage_locator, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW()) \
             RETURNING {TENANT_COLUMNS}"
        );
        let tenant = sqlx::query_as::<_, Tenant>(&sql)
            .bind(id)
            .bind(&request.name)
            .bind(&request.subdomain)
            .bind(mode)
            .bind(tier)
            .bind(&locator)
            .bind(TenantStatus::Active)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::SubdomainTaken(request.subdomain.clone())
                } else {
                    e.into()
                }
            })?;

        tracing::info!(
            tenant = %tenant.id,
            subdomain = %tenant.subdomain,
            mode = ?tenant.isolation_mode,
            "Created tenant"
        );
        Ok(tenant)
    }

    /// Flip a tenant from shared to isolated and point it at `locator`.
    ///
    /// The transition is monotonic: the predicate only matches shared-mode
    /// rows, so a repeated or concurrent flip is a no-op surfaced as
    /// `NotShared`.
    pub async fn mark_isolated(&self, id: Uuid, locator: &str) -> Result<Tenant> {
        let sql = format!(
            "UPDATE tenants \
             SET isolation_mode = $2, storage_locator = $3, updated_at = NOW() \
             WHERE id = $1 AND isolation_mode = $4 \
             RETURNING {TENANT_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, Tenant>(&sql)
            .bind(id)
            .bind(IsolationMode::Isolated)
            .bind(locator)
            .bind(IsolationMode::Shared)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(tenant) => {
                tracing::info!(tenant = %id, locator, "Tenant switched to isolated storage");
                Ok(tenant)
            }
            None => {
                // Distinguish a missing tenant from one already isolated.
                self.get_by_id(id).await?;
                Err(DatabaseError::NotShared(id))
            }
        }
    }

    pub async fn set_subscription_tier(&self, id: Uuid, tier: SubscriptionTier) -> Result<Tenant> {
        let sql = format!(
            "UPDATE tenants SET subscription_tier = $2, updated_at = NOW() \
             WHERE id = $1 RETURNING {TENANT_COLUMNS}"
        );
        sqlx::query_as::<_, Tenant>(&sql)
            .bind(id)
            .bind(tier)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::tenant_not_found(id))
    }

    pub async fn set_status(&self, id: Uuid, status: TenantStatus) -> Result<()> {
        let result = sqlx::query("UPDATE tenants SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::tenant_not_found(id));
        }
        tracing::info!(tenant = %id, status = ?status, "Tenant status changed");
        Ok(())
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Tenant>> {
        let sql = format!(
            "SELECT {TENANT_COLUMNS} FROM tenants ORDER BY created_at DESC LIMIT $1 OFFSET $2"
        );
        Ok(sqlx::query_as::<_, Tenant>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Record per-tenant dedicated-store overrides, encrypting the password
    /// before it touches the control plane.
    pub async fn configure_dedicated_store(
        &self,
        id: Uuid,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        cipher: &CredentialCipher,
    ) -> Result<Tenant> {
        let encrypted = cipher.encrypt(password)?;

        let sql = format!(
            "UPDATE tenants \
             SET database_host = $2, database_port = $3, database_user = $4, \
                 database_password_encrypted = $5, updated_at = NOW() \
             WHERE id = $1 RETURNING {TENANT_COLUMNS}"
        );
        let tenant = sqlx::query_as::<_, Tenant>(&sql)
            .bind(id)
            .bind(host)
            .bind(i32::from(port))
            .bind(user)
            .bind(&encrypted)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::tenant_not_found(id))?;

        tracing::info!(tenant = %id, host, port, "Configured dedicated store overrides");
        Ok(tenant)
    }
}

/// Offline license check: `TILL-XXXX-XXXX-NNNN`, where the last group is
/// the mod-97 weighted checksum of the two payload groups, zero-padded.
fn verify_license(key: &str) -> Result<()> {
    let key = key.trim().to_ascii_uppercase();
    let parts: Vec<&str> = key.split('-').collect();

    if parts.len() != 4 || parts[0] != "TILL" {
        return Err(DatabaseError::LicenseInvalid("malformed key".to_string()));
    }
    for group in &parts[1..3] {
        if group.len() != 4 || !group.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DatabaseError::LicenseInvalid("malformed key".to_string()));
        }
    }

    let payload = format!("{}{}", parts[1], parts[2]);
    let expected = license_checksum(&payload);
    let claimed: u32 = parts[3]
        .parse()
        .map_err(|_| DatabaseError::LicenseInvalid("malformed checksum".to_string()))?;

    if claimed != expected {
        return Err(DatabaseError::LicenseInvalid("checksum mismatch".to_string()));
    }
    Ok(())
}

fn license_checksum(payload: &str) -> u32 {
    payload
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let digit = c.to_ascii_lowercase().to_digit(36).unwrap_or(0);
            digit * (i as u32 + 1)
        })
        .sum::<u32>()
        % 97
}

/// DDL for the control-plane tables, compiled from typed definitions like
/// the tenant-store catalog.
fn control_schema_ddl() -> Vec<String> {
    let mut stmts = Vec::new();

    let mut tenants = Table::create();
    tenants
        .table(Alias::new("tenants"))
        .if_not_exists()
        .col(ColumnDef::new(Alias::new("id")).uuid().not_null().primary_key())
        .col(ColumnDef::new(Alias::new("name")).text().not_null())
        .col(ColumnDef::new(Alias::new("subdomain")).text().not_null())
        .col(ColumnDef::new(Alias::new("isolation_mode")).string().not_null())
        .col(ColumnDef::new(Alias::new("subscription_tier")).string().not_null())
        .col(ColumnDef::new(Alias::new("storage_locator")).text().not_null())
        .col(ColumnDef::new(Alias::new("status")).string().not_null())
        .col(ColumnDef::new(Alias::new("database_host")).text())
        .col(ColumnDef::new(Alias::new("database_port")).integer())
        .col(ColumnDef::new(Alias::new("database_user")).text())
        .col(ColumnDef::new(Alias::new("database_password_encrypted")).text())
        .col(
            ColumnDef::new(Alias::new("created_at"))
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(Alias::new("updated_at"))
                .timestamp_with_time_zone()
                .not_null(),
        );
    stmts.push(tenants.build(PostgresQueryBuilder));

    let mut subdomain_unique = Index::create();
    subdomain_unique
        .unique()
        .if_not_exists()
        .name("uq_tenants_subdomain")
        .table(Alias::new("tenants"))
        .col(Alias::new("subdomain"));
    stmts.push(subdomain_unique.build(PostgresQueryBuilder));

    let mut jobs = Table::create();
    jobs.table(Alias::new("migration_jobs"))
        .if_not_exists()
        .col(ColumnDef::new(Alias::new("id")).uuid().not_null().primary_key())
        .col(ColumnDef::new(Alias::new("tenant_id")).uuid().not_null())
        .col(ColumnDef::new(Alias::new("source_locator")).text().not_null())
        .col(ColumnDef::new(Alias::new("target_locator")).text().not_null())
        .col(ColumnDef::new(Alias::new("status")).string().not_null())
        .col(ColumnDef::new(Alias::new("tables")).json_binary().not_null())
        .col(
            ColumnDef::new(Alias::new("started_at"))
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(ColumnDef::new(Alias::new("finished_at")).timestamp_with_time_zone());
    stmts.push(jobs.build(PostgresQueryBuilder));

    let mut jobs_by_tenant = Index::create();
    jobs_by_tenant
        .if_not_exists()
        .name("idx_migration_jobs_tenant_id")
        .table(Alias::new("migration_jobs"))
        .col(Alias::new("tenant_id"));
    stmts.push(jobs_by_tenant.build(PostgresQueryBuilder));

    stmts
}
