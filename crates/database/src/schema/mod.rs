//! Schema provisioning: compiles the declarative catalog into DDL and
//! applies it idempotently to a locator's database.
//!
//! There is no global DDL lock. Concurrent first-time provisioning of the
//! same tenant can race two attempts; every statement here is either
//! `IF NOT EXISTS` or treats the duplicate-object SQLSTATE as success, so
//! both racers converge on the same structure.

pub mod catalog;

pub use catalog::{
    catalog, column_migrations, table_def, ColumnKind, ColumnMigration, ColumnSpec, TableDef,
    DISCRIMINATOR,
};

use crate::error::{is_duplicate_column, DatabaseError, Result};
use sea_query::{Alias, ColumnDef, ForeignKey, Index, PostgresQueryBuilder, Table};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashSet};

/// Physical layout of a store: whether tables carry the tenant
/// discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Multi-tenant store; every table gains `tenant_id` plus an index,
    /// and unique constraints are scoped by tenant.
    Shared,
    /// Single-tenant store; no discriminator anywhere.
    Isolated,
}

impl Topology {
    pub fn has_discriminator(self) -> bool {
        self == Topology::Shared
    }
}

impl From<till_models::IsolationMode> for Topology {
    fn from(mode: till_models::IsolationMode) -> Self {
        match mode {
            till_models::IsolationMode::Shared => Topology::Shared,
            till_models::IsolationMode::Isolated => Topology::Isolated,
        }
    }
}

/// Tracks which migration-ledger table records applied column additions.
const LEDGER_TABLE: &str = "schema_ledger";

/// Structural snapshot of a locator: which catalog tables exist with which
/// columns, and which forward migrations the ledger records as applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaState {
    /// table name → ordered column names
    pub tables: BTreeMap<String, Vec<String>>,
    pub applied_migrations: Vec<i64>,
}

/// Idempotent DDL executor for tenant stores.
#[derive(Debug, Clone, Default)]
pub struct SchemaProvisioner;

impl SchemaProvisioner {
    pub fn new() -> Self {
        Self
    }

    /// Bring a store up to the current catalog. Safe on every cold access
    /// and on warm reuse; never drops or rewrites existing structure.
    ///
    /// A failed table creation is fatal for this locator and surfaced as
    /// `SchemaProvisionFailed`. Failed column additions are logged and
    /// skipped; the ledger row is withheld so a later call retries them.
    pub async fn ensure_schema(&self, pool: &PgPool, topology: Topology) -> Result<()> {
        let locator = locator_name(pool);

        for table in catalog() {
            for stmt in build_table_ddl(table, topology) {
                sqlx::query(&stmt).execute(pool).await.map_err(|e| {
                    tracing::error!(
                        locator = %locator,
                        table = table.name,
                        error = %e,
                        "Table provisioning failed"
                    );
                    DatabaseError::provision_failed(&locator, &e)
                })?;
            }
        }

        self.ensure_ledger(pool, &locator).await?;
        self.apply_pending_migrations(pool).await?;

        tracing::debug!(locator = %locator, topology = ?topology, "Schema ensured");
        Ok(())
    }

    /// Add a column if the live structure does not already have it.
    ///
    /// Returns `Ok(true)` when the column was added, `Ok(false)` when it was
    /// already present. Losing an ADD COLUMN race (SQLSTATE 42701) counts as
    /// already present, not as failure.
    pub async fn ensure_column(
        &self,
        pool: &PgPool,
        table: &str,
        column: &ColumnSpec,
    ) -> Result<bool> {
        if self.column_exists(pool, table, column.name).await? {
            return Ok(false);
        }

        let stmt = build_add_column(table, column);
        match sqlx::query(&stmt).execute(pool).await {
            Ok(_) => {
                tracing::info!(table, column = column.name, "Added column");
                Ok(true)
            }
            Err(e) if is_duplicate_column(&e) => Ok(false),
            Err(e) => Err(DatabaseError::ColumnEvolutionFailed {
                table: table.to_string(),
                column: column.name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Walk the ordered column-migration ledger and apply every entry this
    /// locator has not recorded yet, exactly once each.
    ///
    /// Per-entry failures are an intentionally tolerated degradation:
    /// logged, skipped, retried on the next provisioning pass. Ledger
    /// read/write failures are fatal.
    pub async fn apply_pending_migrations(&self, pool: &PgPool) -> Result<()> {
        let applied: HashSet<i64> =
            sqlx::query_scalar::<_, i64>("SELECT migration_id FROM schema_ledger")
                .fetch_all(pool)
                .await?
                .into_iter()
                .collect();

        for migration in column_migrations() {
            if applied.contains(&migration.id) {
                continue;
            }

            match self
                .ensure_column(pool, migration.table, &migration.column)
                .await
            {
                Ok(_) => {
                    sqlx::query(
                        "INSERT INTO schema_ledger (migration_id, table_name, column_name, applied_at) \
                         VALUES ($1, $2, $3, NOW()) ON CONFLICT (migration_id) DO NOTHING",
                    )
                    .bind(migration.id)
                    .bind(migration.table)
                    .bind(migration.column.name)
                    .execute(pool)
                    .await?;
                }
                Err(e @ DatabaseError::ColumnEvolutionFailed { .. }) => {
                    tracing::warn!(
                        migration_id = migration.id,
                        table = migration.table,
                        column = migration.column.name,
                        error = %e,
                        "Column evolution failed; skipping, will retry on next provisioning pass"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Read back the structural state of a locator: catalog tables, their
    /// columns, and the applied-migration set.
    pub async fn schema_state(&self, pool: &PgPool) -> Result<SchemaState> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_name, column_name FROM information_schema.columns \
             WHERE table_schema = 'public' ORDER BY table_name, ordinal_position",
        )
        .fetch_all(pool)
        .await?;

        let catalog_names: HashSet<&str> = catalog().iter().map(|t| t.name).collect();
        let mut tables: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (table, column) in rows {
            if catalog_names.contains(table.as_str()) {
                tables.entry(table).or_default().push(column);
            }
        }

        let applied_migrations = sqlx::query_scalar::<_, i64>(
            "SELECT migration_id FROM schema_ledger ORDER BY migration_id",
        )
        .fetch_all(pool)
        .await?;

        Ok(SchemaState {
            tables,
            applied_migrations,
        })
    }

    async fn ensure_ledger(&self, pool: &PgPool, locator: &str) -> Result<()> {
        let stmt = Table::create()
            .table(Alias::new(LEDGER_TABLE))
            .if_not_exists()
            .col(
                ColumnDef::new(Alias::new("migration_id"))
                    .big_integer()
                    .not_null()
                    .primary_key(),
            )
            .col(ColumnDef::new(Alias::new("table_name")).text().not_null())
            .col(ColumnDef::new(Alias::new("column_name")).text().not_null())
            .col(
                ColumnDef::new(Alias::new("applied_at"))
                    .timestamp_with_time_zone()
                    .not_null(),
            )
            .build(PostgresQueryBuilder);

        sqlx::query(&stmt)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::provision_failed(locator, &e))?;
        Ok(())
    }

    async fn column_exists(&self, pool: &PgPool, table: &str, column: &str) -> Result<bool> {
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 AND column_name = $2",
        )
        .bind(table)
        .bind(column)
        .fetch_optional(pool)
        .await?;
        Ok(found.is_some())
    }
}

fn locator_name(pool: &PgPool) -> String {
    pool.connect_options()
        .get_database()
        .unwrap_or("unknown")
        .to_string()
}

/// Columns a table has under a topology: the authored catalog columns,
/// with the discriminator injected right after the primary key for shared
/// stores.
pub fn effective_columns(table: &TableDef, topology: Topology) -> Vec<ColumnSpec> {
    let mut columns: Vec<ColumnSpec> = Vec::with_capacity(table.columns.len() + 1);
    columns.push(table.columns[0]);
    if topology.has_discriminator() {
        columns.push(ColumnSpec::required(DISCRIMINATOR, ColumnKind::Uuid));
    }
    columns.extend_from_slice(&table.columns[1..]);
    columns
}

/// Compile one catalog table into its DDL statements for a topology:
/// `CREATE TABLE IF NOT EXISTS`, then one `CREATE [UNIQUE] INDEX IF NOT
/// EXISTS` per unique set and (shared only) the discriminator index.
pub fn build_table_ddl(table: &TableDef, topology: Topology) -> Vec<String> {
    let mut stmts = Vec::new();

    let mut create = Table::create();
    create.table(Alias::new(table.name)).if_not_exists();

    for column in effective_columns(table, topology) {
        let mut def = ColumnDef::new(Alias::new(column.name));
        match column.kind {
            ColumnKind::Uuid => def.uuid(),
            ColumnKind::Text => def.text(),
            ColumnKind::Integer => def.integer(),
            ColumnKind::BigInt => def.big_integer(),
            ColumnKind::Boolean => def.boolean(),
            ColumnKind::TimestampTz => def.timestamp_with_time_zone(),
            ColumnKind::Json => def.json_binary(),
        };
        if !column.nullable {
            def.not_null();
        }
        if column.name == "id" {
            def.primary_key();
        }
        create.col(&mut def);
    }

    for fk in table.foreign_keys {
        create.foreign_key(
            ForeignKey::create()
                .from(Alias::new(table.name), Alias::new(fk.column))
                .to(Alias::new(fk.references), Alias::new("id")),
        );
    }

    stmts.push(create.build(PostgresQueryBuilder));

    for unique in table.uniques {
        let mut index = Index::create();
        index
            .unique()
            .if_not_exists()
            .name(&unique_index_name(table.name, unique, topology))
            .table(Alias::new(table.name));
        if topology.has_discriminator() {
            index.col(Alias::new(DISCRIMINATOR));
        }
        for column in *unique {
            index.col(Alias::new(*column));
        }
        stmts.push(index.build(PostgresQueryBuilder));
    }

    if topology.has_discriminator() {
        let mut index = Index::create();
        index
            .if_not_exists()
            .name(&format!("idx_{}_{}", table.name, DISCRIMINATOR))
            .table(Alias::new(table.name))
            .col(Alias::new(DISCRIMINATOR));
        stmts.push(index.build(PostgresQueryBuilder));
    }

    stmts
}

fn unique_index_name(table: &str, columns: &[&str], topology: Topology) -> String {
    // Shared and isolated variants get distinct names so a locator is
    // unambiguous about which shape it carries.
    let scope = if topology.has_discriminator() {
        "tenant"
    } else {
        "global"
    };
    format!("uq_{}_{}_{}", table, columns.join("_"), scope)
}

fn build_add_column(table: &str, column: &ColumnSpec) -> String {
    let mut def = ColumnDef::new(Alias::new(column.name));
    match column.kind {
        ColumnKind::Uuid => def.uuid(),
        ColumnKind::Text => def.text(),
        ColumnKind::Integer => def.integer(),
        ColumnKind::BigInt => def.big_integer(),
        ColumnKind::Boolean => def.boolean(),
        ColumnKind::TimestampTz => def.timestamp_with_time_zone(),
        ColumnKind::Json => def.json_binary(),
    };
    if !column.nullable {
        def.not_null();
    }

    Table::alter()
        .table(Alias::new(table))
        .add_column(&mut def)
        .build(PostgresQueryBuilder)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn products() -> &'static TableDef {
        table_def("products").unwrap()
    }

    #[test]
    fn test_shared_ddl_carries_discriminator() {
        let stmts = build_table_ddl(products(), Topology::Shared);
        let create = &stmts[0];

        assert!(create.contains("IF NOT EXISTS"));
        assert!(create.contains("\"tenant_id\" uuid NOT NULL"));

        // Tenant-scoped uniqueness and the discriminator index.
        assert!(stmts
            .iter()
            .any(|s| s.contains("uq_products_sku_tenant") && s.contains("\"tenant_id\", \"sku\"")));
        assert!(stmts.iter().any(|s| s.contains("idx_products_tenant_id")));
    }

    #[test]
    fn test_isolated_ddl_has_no_discriminator() {
        let stmts = build_table_ddl(products(), Topology::Isolated);
        for stmt in &stmts {
            assert!(
                !stmt.contains(DISCRIMINATOR),
                "isolated DDL leaked the discriminator: {stmt}"
            );
        }
        assert!(stmts.iter().any(|s| s.contains("uq_products_sku_global")));
    }

    #[test]
    fn test_foreign_keys_rendered() {
        let stmts = build_table_ddl(table_def("invoice_lines").unwrap(), Topology::Isolated);
        assert!(stmts[0].contains("REFERENCES \"invoices\" (\"id\")"));
        assert!(stmts[0].contains("REFERENCES \"products\" (\"id\")"));
    }

    #[test]
    fn test_effective_columns_orders_discriminator_after_id() {
        let shared = effective_columns(products(), Topology::Shared);
        assert_eq!(shared[0].name, "id");
        assert_eq!(shared[1].name, DISCRIMINATOR);

        let isolated = effective_columns(products(), Topology::Isolated);
        assert!(isolated.iter().all(|c| c.name != DISCRIMINATOR));
        assert_eq!(isolated.len(), products().columns.len());
    }

    #[test]
    fn test_add_column_statement() {
        let stmt = build_add_column("products", &ColumnSpec::optional("barcode", ColumnKind::Text));
        assert!(stmt.contains("ALTER TABLE \"products\""));
        assert!(stmt.contains("ADD COLUMN \"barcode\" text"));
    }

    #[tokio::test]
    #[ignore] // Only run with database available
    async fn test_ensure_schema_is_idempotent() {
        let config = crate::connection::RouterConfig::from_env();
        let pool = crate::connection::open_pool(&config.shared_url, &config.shared_pool)
            .await
            .expect("connect");

        let provisioner = SchemaProvisioner::new();
        provisioner
            .ensure_schema(&pool, Topology::Shared)
            .await
            .expect("first ensure");
        let first = provisioner.schema_state(&pool).await.expect("state");

        provisioner
            .ensure_schema(&pool, Topology::Shared)
            .await
            .expect("second ensure");
        let second = provisioner.schema_state(&pool).await.expect("state");

        assert_eq!(first, second);
        assert_eq!(
            second.applied_migrations,
            column_migrations().iter().map(|m| m.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    #[ignore] // Only run with database available
    async fn test_ensure_column_is_idempotent() {
        let config = crate::connection::RouterConfig::from_env();
        let pool = crate::connection::open_pool(&config.shared_url, &config.shared_pool)
            .await
            .expect("connect");

        let provisioner = SchemaProvisioner::new();
        provisioner
            .ensure_schema(&pool, Topology::Shared)
            .await
            .expect("ensure");

        let column = ColumnSpec::optional("gift_note", ColumnKind::Text);
        let added = provisioner
            .ensure_column(&pool, "invoices", &column)
            .await
            .expect("first add");
        let again = provisioner
            .ensure_column(&pool, "invoices", &column)
            .await
            .expect("second add");

        assert!(added);
        assert!(!again);
    }
}
