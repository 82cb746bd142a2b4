//! Tier migration: moves one tenant's rows out of the shared store into a
//! freshly provisioned dedicated store, table by table, in foreign-key
//! dependency order.
//!
//! The copy pipeline is declarative: one generic routine executes an
//! ordered list of [`CopyStep`]s, which makes fault injection in tests a
//! matter of handing it a different plan. Each step reads rows scoped by
//! the tenant discriminator, strips the discriminator (the catalog columns
//! never include it) and inserts into the target inside one transaction
//! per table.
//!
//! Migration never deletes source rows. Tables are copied with
//! `ON CONFLICT DO NOTHING` on the primary key, so re-running a partially
//! failed job resumes naturally. Cleanup of the shared store is a separate,
//! explicitly authorized operation.

use crate::directory::TenantDirectory;
use crate::error::{DatabaseError, Result};
use crate::registry::ConnectionRegistry;
use crate::schema::{catalog, column_migrations, ColumnKind, ColumnSpec, Topology, DISCRIMINATOR};
use chrono::Utc;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{PgPool, Postgres, Row};
use std::sync::Arc;
use till_models::{IsolationMode, MigrationJob, MigrationStatus, TableMigration, TableOutcome};
use uuid::Uuid;

/// One table in the copy pipeline.
#[derive(Debug, Clone)]
pub struct CopyStep {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
}

/// The full pipeline in catalog (dependency) order. The column lists are
/// the catalog columns plus ledger-added ones and never contain the
/// discriminator, which is how the discriminator gets stripped on the way
/// to the target.
pub fn copy_plan() -> Vec<CopyStep> {
    catalog()
        .iter()
        .map(|table| {
            let mut columns = table.columns.to_vec();
            columns.extend(
                column_migrations()
                    .iter()
                    .filter(|m| m.table == table.name)
                    .map(|m| m.column),
            );
            CopyStep {
                table: table.name.to_string(),
                columns,
            }
        })
        .collect()
}

/// Operator sign-off for destroying a tenant's shared-store rows.
#[derive(Debug, Clone)]
pub struct PurgeAuthorization {
    pub operator: String,
    pub confirm_tenant_id: Uuid,
}

/// Moves a tenant from the shared store to a dedicated store on tier
/// upgrade. Long-lived background operation; handles are acquired through
/// the registry and nothing holds the registry locked while rows move.
pub struct TierMigrator {
    registry: Arc<ConnectionRegistry>,
    directory: TenantDirectory,
}

impl TierMigrator {
    pub fn new(registry: Arc<ConnectionRegistry>, directory: TenantDirectory) -> Self {
        Self {
            registry,
            directory,
        }
    }

    /// Run a tier migration for `tenant_id`.
    ///
    /// The tenant must currently be shared. On full success the tenant is
    /// flipped to isolated and its registry entry evicted so the next
    /// acquire routes to the dedicated store. Any per-table failure leaves
    /// the tenant shared and the job `PartiallyFailed`, listing the failed
    /// tables for an operator re-run. Source rows are never deleted here.
    pub async fn migrate(&self, tenant_id: Uuid) -> Result<MigrationJob> {
        let tenant = self.directory.get_by_id(tenant_id).await?;
        if tenant.isolation_mode != IsolationMode::Shared {
            return Err(DatabaseError::NotShared(tenant_id));
        }

        let target_locator = self.directory.locators().dedicated_locator(tenant_id);
        let mut job = MigrationJob {
            id: Uuid::new_v4(),
            tenant_id,
            source_locator: tenant.storage_locator.clone(),
            target_locator: target_locator.clone(),
            status: MigrationStatus::Running,
            tables: copy_plan()
                .iter()
                .map(|step| TableMigration {
                    table: step.table.clone(),
                    outcome: TableOutcome::Pending,
                })
                .collect(),
            started_at: Utc::now(),
            finished_at: None,
        };
        self.insert_job(&job).await?;
        tracing::info!(tenant = %tenant_id, job = %job.id, target = %target_locator, "Tier migration started");

        // Provision the target before touching any data. A failure here is
        // fatal for the run; the job records it and the error surfaces.
        let target = match self.registry.open_dedicated(&tenant, &target_locator).await {
            Ok(pool) => pool,
            Err(e) => return self.abort_job(job, e).await,
        };
        if let Err(e) = self
            .registry
            .provisioner()
            .ensure_schema(&target, Topology::Isolated)
            .await
        {
            target.close().await;
            return self.abort_job(job, e).await;
        }

        let source = match self.registry.acquire(tenant_id).await {
            Ok(handle) => handle,
            Err(e) => {
                target.close().await;
                return self.abort_job(job, e).await;
            }
        };

        job.tables = run_copy(source.pool(), &target, tenant_id, &copy_plan()).await;
        target.close().await;

        job.status = overall_status(&job.tables);
        if job.status == MigrationStatus::Succeeded {
            self.directory.mark_isolated(tenant_id, &target_locator).await?;
            self.registry.release(tenant_id).await;
            tracing::info!(
                tenant = %tenant_id,
                job = %job.id,
                rows = job.rows_copied(),
                "Tier migration succeeded; tenant now isolated"
            );
        } else {
            tracing::error!(
                tenant = %tenant_id,
                job = %job.id,
                failed_tables = ?job.failed_tables(),
                "Tier migration partially failed; tenant stays shared, re-run after fixing"
            );
        }

        job.finished_at = Some(Utc::now());
        self.update_job(&job).await?;
        Ok(job)
    }

    /// Delete a tenant's rows from the shared store, newest dependencies
    /// first. Refuses to run unless the tenant is already isolated and the
    /// authorization names the same tenant.
    pub async fn purge_source_rows(
        &self,
        tenant_id: Uuid,
        auth: &PurgeAuthorization,
    ) -> Result<u64> {
        if auth.confirm_tenant_id != tenant_id {
            return Err(DatabaseError::InvalidInput(
                "purge authorization does not name this tenant".to_string(),
            ));
        }

        let tenant = self.directory.get_by_id(tenant_id).await?;
        if tenant.isolation_mode != IsolationMode::Isolated {
            return Err(DatabaseError::NotIsolated(tenant_id));
        }

        let shared = self.registry.shared_pool();
        let mut deleted = 0u64;
        for step in copy_plan().iter().rev() {
            let sql = format!(
                "DELETE FROM {} WHERE {} = $1",
                step.table, DISCRIMINATOR
            );
            let result = sqlx::query(&sql).bind(tenant_id).execute(shared).await?;
            deleted += result.rows_affected();
        }

        tracing::warn!(
            tenant = %tenant_id,
            operator = %auth.operator,
            rows = deleted,
            "Purged tenant rows from shared store"
        );
        Ok(deleted)
    }

    /// Most recent migration job for a tenant, for operator inspection.
    pub async fn latest_job(&self, tenant_id: Uuid) -> Result<Option<MigrationJob>> {
        Ok(sqlx::query_as::<_, MigrationJob>(
            "SELECT id, tenant_id, source_locator, target_locator, status, tables, \
             started_at, finished_at \
             FROM migration_jobs WHERE tenant_id = $1 \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(self.directory.pool())
        .await?)
    }

    async fn abort_job(&self, mut job: MigrationJob, cause: DatabaseError) -> Result<MigrationJob> {
        job.status = MigrationStatus::PartiallyFailed;
        job.finished_at = Some(Utc::now());
        self.update_job(&job).await?;
        tracing::error!(job = %job.id, error = %cause, "Tier migration aborted before copy");
        Err(cause)
    }

    async fn insert_job(&self, job: &MigrationJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO migration_jobs \
             (id, tenant_id, source_locator, target_locator, status, tables, started_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(job.id)
        .bind(job.tenant_id)
        .bind(&job.source_locator)
        .bind(&job.target_locator)
        .bind(job.status)
        .bind(sqlx::types::Json(&job.tables))
        .bind(job.started_at)
        .execute(self.directory.pool())
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &MigrationJob) -> Result<()> {
        sqlx::query(
            "UPDATE migration_jobs SET status = $2, tables = $3, finished_at = $4 WHERE id = $1",
        )
        .bind(job.id)
        .bind(job.status)
        .bind(sqlx::types::Json(&job.tables))
        .bind(job.finished_at)
        .execute(self.directory.pool())
        .await?;
        Ok(())
    }
}

/// Execute a copy plan, best-effort and non-aborting: a failed table is
/// logged and recorded, and the pipeline moves on to the remaining tables.
pub(crate) async fn run_copy(
    source: &PgPool,
    target: &PgPool,
    tenant_id: Uuid,
    plan: &[CopyStep],
) -> Vec<TableMigration> {
    let mut outcomes = Vec::with_capacity(plan.len());
    for step in plan {
        match copy_table(source, target, tenant_id, step).await {
            Ok(rows_copied) => {
                tracing::info!(table = %step.table, rows = rows_copied, "Copied table");
                outcomes.push(TableMigration {
                    table: step.table.clone(),
                    outcome: TableOutcome::Succeeded { rows_copied },
                });
            }
            Err(e) => {
                let err = DatabaseError::MigrationTableFailed {
                    table: step.table.clone(),
                    reason: e.to_string(),
                };
                tracing::error!(table = %step.table, error = %err, "Table copy failed, continuing");
                outcomes.push(TableMigration {
                    table: step.table.clone(),
                    outcome: TableOutcome::Failed {
                        reason: e.to_string(),
                    },
                });
            }
        }
    }
    outcomes
}

/// Copy one table's rows for one tenant. All inserts for the table run in a
/// single target-side transaction: a table lands either whole or not at
/// all, and earlier tables are unaffected by later failures.
async fn copy_table(
    source: &PgPool,
    target: &PgPool,
    tenant_id: Uuid,
    step: &CopyStep,
) -> Result<u64> {
    let rows = sqlx::query(&build_select(step))
        .bind(tenant_id)
        .fetch_all(source)
        .await?;

    if rows.is_empty() {
        return Ok(0);
    }

    let insert = build_insert(step);
    let mut tx = target.begin().await?;
    for row in &rows {
        let mut query = sqlx::query(&insert);
        for (index, column) in step.columns.iter().enumerate() {
            query = bind_column(query, row, index, column.kind)?;
        }
        query.execute(&mut *tx).await?;
    }
    tx.commit().await?;

    Ok(rows.len() as u64)
}

fn column_list(step: &CopyStep) -> String {
    step.columns
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Discriminator-scoped read from the shared store. Only catalog columns
/// are selected, so the discriminator never travels to the target.
fn build_select(step: &CopyStep) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} = $1",
        column_list(step),
        step.table,
        DISCRIMINATOR
    )
}

fn build_insert(step: &CopyStep) -> String {
    let placeholders = (1..=step.columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (id) DO NOTHING",
        step.table,
        column_list(step),
        placeholders
    )
}

/// Decode a column from the source row and rebind it for the target,
/// typed by the catalog. Everything goes through `Option` so NULLs copy
/// as NULLs.
fn bind_column<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    row: &PgRow,
    index: usize,
    kind: ColumnKind,
) -> Result<sqlx::query::Query<'q, Postgres, PgArguments>> {
    let query = match kind {
        ColumnKind::Uuid => query.bind(row.try_get::<Option<Uuid>, _>(index)?),
        ColumnKind::Text => query.bind(row.try_get::<Option<String>, _>(index)?),
        ColumnKind::Integer => query.bind(row.try_get::<Option<i32>, _>(index)?),
        ColumnKind::BigInt => query.bind(row.try_get::<Option<i64>, _>(index)?),
        ColumnKind::Boolean => query.bind(row.try_get::<Option<bool>, _>(index)?),
        ColumnKind::TimestampTz => {
            query.bind(row.try_get::<Option<chrono::DateTime<Utc>>, _>(index)?)
        }
        ColumnKind::Json => query.bind(row.try_get::<Option<serde_json::Value>, _>(index)?),
    };
    Ok(query)
}

fn overall_status(tables: &[TableMigration]) -> MigrationStatus {
    if tables
        .iter()
        .all(|t| matches!(t.outcome, TableOutcome::Succeeded { .. }))
    {
        MigrationStatus::Succeeded
    } else {
        MigrationStatus::PartiallyFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_plan_follows_catalog_order() {
        let plan = copy_plan();
        let names: Vec<&str> = plan.iter().map(|s| s.table.as_str()).collect();
        let expected: Vec<&str> = catalog().iter().map(|t| t.name).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_copy_plan_strips_discriminator() {
        for step in copy_plan() {
            assert!(step.columns.iter().all(|c| c.name != DISCRIMINATOR));
        }
    }

    #[test]
    fn test_select_is_discriminator_scoped() {
        let plan = copy_plan();
        let customers = &plan[0];
        let sql = build_select(customers);
        assert_eq!(
            sql,
            "SELECT id, name, email, phone, created_at, loyalty_points \
             FROM customers WHERE tenant_id = $1"
        );
    }

    #[test]
    fn test_insert_is_conflict_tolerant() {
        let plan = copy_plan();
        let customers = &plan[0];
        let sql = build_insert(customers);
        assert_eq!(
            sql,
            "INSERT INTO customers (id, name, email, phone, created_at, loyalty_points) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (id) DO NOTHING"
        );
    }

    #[test]
    fn test_overall_status() {
        let ok = TableMigration {
            table: "customers".to_string(),
            outcome: TableOutcome::Succeeded { rows_copied: 1 },
        };
        let bad = TableMigration {
            table: "invoices".to_string(),
            outcome: TableOutcome::Failed {
                reason: "boom".to_string(),
            },
        };

        assert_eq!(
            overall_status(&[ok.clone(), ok.clone()]),
            MigrationStatus::Succeeded
        );
        assert_eq!(
            overall_status(&[ok, bad]),
            MigrationStatus::PartiallyFailed
        );
    }

    mod live {
        use super::*;
        use crate::connection::RouterConfig;
        use crate::directory::TenantDirectory;
        use crate::registry::ConnectionRegistry;
        use crate::schema::SchemaProvisioner;
        use std::sync::Arc;
        use till_models::NewTenant;

        async fn setup() -> (Arc<ConnectionRegistry>, TenantDirectory) {
            let config = RouterConfig::from_env();
            let (registry, directory) = ConnectionRegistry::connect(config)
                .await
                .expect("connect");
            directory.ensure_control_schema().await.expect("control schema");
            SchemaProvisioner::new()
                .ensure_schema(registry.shared_pool(), Topology::Shared)
                .await
                .expect("shared schema");
            (Arc::new(registry), directory)
        }

        fn license() -> &'static str {
            // TILL-AB12-CD34 with its mod-97 checksum.
            "TILL-AB12-CD34-0040"
        }

        async fn seed_tenant(directory: &TenantDirectory) -> Uuid {
            let request = NewTenant {
                name: "Roundtrip Shop".to_string(),
                subdomain: format!("shop-{}", Uuid::new_v4().simple()),
                subscription_tier: None,
            };
            directory.create(&request, license()).await.expect("create").id
        }

        async fn seed_rows(shared: &PgPool, tenant_id: Uuid) {
            for n in 0..3 {
                sqlx::query(
                    "INSERT INTO customers (id, tenant_id, name, email, created_at) \
                     VALUES ($1, $2, $3, $4, NOW())",
                )
                .bind(Uuid::new_v4())
                .bind(tenant_id)
                .bind(format!("Customer {n}"))
                .bind(format!("c{n}@example.com"))
                .execute(shared)
                .await
                .expect("seed customer");
            }
            sqlx::query(
                "INSERT INTO products \
                 (id, tenant_id, sku, name, unit_price_cents, tax_rate_bps, active, created_at) \
                 VALUES ($1, $2, 'SKU-1', 'Espresso', 350, 900, TRUE, NOW())",
            )
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .execute(shared)
            .await
            .expect("seed product");
        }

        #[tokio::test]
        #[ignore] // Only run with database available
        async fn test_migration_roundtrip() {
            let (registry, directory) = setup().await;
            let tenant_id = seed_tenant(&directory).await;
            seed_rows(registry.shared_pool(), tenant_id).await;

            let migrator = TierMigrator::new(Arc::clone(&registry), directory.clone());
            let job = migrator.migrate(tenant_id).await.expect("migrate");
            assert_eq!(job.status, MigrationStatus::Succeeded);

            // Tenant now routes isolated; rows are all there, undiscriminated.
            let tenant = directory.get_by_id(tenant_id).await.expect("reload");
            assert_eq!(tenant.isolation_mode, IsolationMode::Isolated);

            let handle = registry.acquire(tenant_id).await.expect("acquire");
            assert_eq!(handle.locator(), tenant.storage_locator);

            let customers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM customers")
                .fetch_one(handle.pool())
                .await
                .expect("count");
            assert_eq!(customers, 3);

            // Source rows were not deleted.
            let source_customers: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM customers WHERE tenant_id = $1")
                    .bind(tenant_id)
                    .fetch_one(registry.shared_pool())
                    .await
                    .expect("source count");
            assert_eq!(source_customers, 3);

            // A second migration attempt is refused: the flip is monotonic.
            let err = migrator.migrate(tenant_id).await.unwrap_err();
            assert!(matches!(err, DatabaseError::NotShared(_)));

            // Purge is a separate, authorized step.
            let deleted = migrator
                .purge_source_rows(
                    tenant_id,
                    &PurgeAuthorization {
                        operator: "ops@till".to_string(),
                        confirm_tenant_id: tenant_id,
                    },
                )
                .await
                .expect("purge");
            assert_eq!(deleted, 4);
        }

        #[tokio::test]
        #[ignore] // Only run with database available
        async fn test_failed_tables_do_not_roll_back_earlier_ones() {
            let (registry, directory) = setup().await;
            let tenant_id = seed_tenant(&directory).await;
            seed_rows(registry.shared_pool(), tenant_id).await;

            let tenant = directory.get_by_id(tenant_id).await.expect("tenant");
            let target_locator = directory.locators().dedicated_locator(tenant_id);
            let target = registry
                .open_dedicated(&tenant, &target_locator)
                .await
                .expect("target");
            SchemaProvisioner::new()
                .ensure_schema(&target, Topology::Isolated)
                .await
                .expect("target schema");

            // Fault injection: break the plan from the second step onward.
            let mut plan = copy_plan();
            plan.truncate(3);
            plan[1].table = "missing_a".to_string();
            plan[2].table = "missing_b".to_string();

            let outcomes = run_copy(registry.shared_pool(), &target, tenant_id, &plan).await;

            assert!(matches!(
                outcomes[0].outcome,
                TableOutcome::Succeeded { rows_copied: 3 }
            ));
            assert!(matches!(outcomes[1].outcome, TableOutcome::Failed { .. }));
            assert!(matches!(outcomes[2].outcome, TableOutcome::Failed { .. }));

            // The table copied before the fault keeps its rows.
            let customers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM customers")
                .fetch_one(&target)
                .await
                .expect("count");
            assert_eq!(customers, 3);

            target.close().await;
        }
    }
}
