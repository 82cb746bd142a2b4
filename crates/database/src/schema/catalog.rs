//! Declarative schema catalog for the commerce domain.
//!
//! One parametric template serves both topologies: the shared store gets a
//! `tenant_id` discriminator column (plus index, and discriminator-prefixed
//! unique constraints) on every table; isolated stores get none. The table
//! list is foreign-key ordered, and the tier migrator copies tables in
//! exactly this order.

/// The tenant discriminator column, present only in shared-store tables.
pub const DISCRIMINATOR: &str = "tenant_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Uuid,
    Text,
    Integer,
    BigInt,
    Boolean,
    TimestampTz,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl ColumnSpec {
    pub const fn required(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            nullable: false,
        }
    }

    pub const fn optional(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForeignKeyRef {
    pub column: &'static str,
    pub references: &'static str,
}

/// One table in the catalog. `columns` always starts with the `id` uuid
/// primary key; `uniques` lists unique column sets as authored for the
/// isolated topology (the shared topology prefixes each with the
/// discriminator so tenants cannot collide).
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
    pub uniques: &'static [&'static [&'static str]],
    pub foreign_keys: &'static [ForeignKeyRef],
}

use ColumnKind::{BigInt, Boolean, Integer, Json, TimestampTz, Uuid};

const CUSTOMERS: TableDef = TableDef {
    name: "customers",
    columns: &[
        ColumnSpec::required("id", Uuid),
        ColumnSpec::required("name", ColumnKind::Text),
        ColumnSpec::optional("email", ColumnKind::Text),
        ColumnSpec::optional("phone", ColumnKind::Text),
        ColumnSpec::required("created_at", TimestampTz),
    ],
    uniques: &[],
    foreign_keys: &[],
};

const STAFF: TableDef = TableDef {
    name: "staff",
    columns: &[
        ColumnSpec::required("id", Uuid),
        ColumnSpec::required("name", ColumnKind::Text),
        ColumnSpec::required("email", ColumnKind::Text),
        ColumnSpec::required("role", ColumnKind::Text),
        ColumnSpec::required("active", Boolean),
        ColumnSpec::required("created_at", TimestampTz),
    ],
    uniques: &[&["email"]],
    foreign_keys: &[],
};

const PRODUCTS: TableDef = TableDef {
    name: "products",
    columns: &[
        ColumnSpec::required("id", Uuid),
        ColumnSpec::required("sku", ColumnKind::Text),
        ColumnSpec::required("name", ColumnKind::Text),
        ColumnSpec::optional("description", ColumnKind::Text),
        ColumnSpec::required("unit_price_cents", BigInt),
        ColumnSpec::required("tax_rate_bps", Integer),
        ColumnSpec::required("active", Boolean),
        ColumnSpec::required("created_at", TimestampTz),
    ],
    uniques: &[&["sku"]],
    foreign_keys: &[],
};

const INVENTORY_LEVELS: TableDef = TableDef {
    name: "inventory_levels",
    columns: &[
        ColumnSpec::required("id", Uuid),
        ColumnSpec::required("product_id", Uuid),
        ColumnSpec::required("quantity", BigInt),
        ColumnSpec::optional("reorder_point", BigInt),
        ColumnSpec::required("updated_at", TimestampTz),
    ],
    uniques: &[&["product_id"]],
    foreign_keys: &[ForeignKeyRef {
        column: "product_id",
        references: "products",
    }],
};

const BOOKINGS: TableDef = TableDef {
    name: "bookings",
    columns: &[
        ColumnSpec::required("id", Uuid),
        ColumnSpec::optional("customer_id", Uuid),
        ColumnSpec::optional("staff_id", Uuid),
        ColumnSpec::required("starts_at", TimestampTz),
        ColumnSpec::required("ends_at", TimestampTz),
        ColumnSpec::required("status", ColumnKind::Text),
        ColumnSpec::required("created_at", TimestampTz),
    ],
    uniques: &[],
    foreign_keys: &[
        ForeignKeyRef {
            column: "customer_id",
            references: "customers",
        },
        ForeignKeyRef {
            column: "staff_id",
            references: "staff",
        },
    ],
};

const INVOICES: TableDef = TableDef {
    name: "invoices",
    columns: &[
        ColumnSpec::required("id", Uuid),
        ColumnSpec::optional("customer_id", Uuid),
        ColumnSpec::optional("booking_id", Uuid),
        ColumnSpec::required("number", ColumnKind::Text),
        ColumnSpec::required("total_cents", BigInt),
        ColumnSpec::required("status", ColumnKind::Text),
        ColumnSpec::required("issued_at", TimestampTz),
    ],
    uniques: &[&["number"]],
    foreign_keys: &[
        ForeignKeyRef {
            column: "customer_id",
            references: "customers",
        },
        ForeignKeyRef {
            column: "booking_id",
            references: "bookings",
        },
    ],
};

const INVOICE_LINES: TableDef = TableDef {
    name: "invoice_lines",
    columns: &[
        ColumnSpec::required("id", Uuid),
        ColumnSpec::required("invoice_id", Uuid),
        ColumnSpec::optional("product_id", Uuid),
        ColumnSpec::required("description", ColumnKind::Text),
        ColumnSpec::required("quantity", Integer),
        ColumnSpec::required("unit_price_cents", BigInt),
        ColumnSpec::required("line_total_cents", BigInt),
    ],
    uniques: &[],
    foreign_keys: &[
        ForeignKeyRef {
            column: "invoice_id",
            references: "invoices",
        },
        ForeignKeyRef {
            column: "product_id",
            references: "products",
        },
    ],
};

const PAYMENTS: TableDef = TableDef {
    name: "payments",
    columns: &[
        ColumnSpec::required("id", Uuid),
        ColumnSpec::required("invoice_id", Uuid),
        ColumnSpec::required("method", ColumnKind::Text),
        ColumnSpec::required("amount_cents", BigInt),
        ColumnSpec::optional("reference", ColumnKind::Text),
        ColumnSpec::optional("metadata", Json),
        ColumnSpec::required("received_at", TimestampTz),
    ],
    uniques: &[],
    foreign_keys: &[ForeignKeyRef {
        column: "invoice_id",
        references: "invoices",
    }],
};

/// The full catalog in foreign-key dependency order: every table appears
/// after every table it references.
pub const CATALOG: &[TableDef] = &[
    CUSTOMERS,
    STAFF,
    PRODUCTS,
    INVENTORY_LEVELS,
    BOOKINGS,
    INVOICES,
    INVOICE_LINES,
    PAYMENTS,
];

pub fn catalog() -> &'static [TableDef] {
    CATALOG
}

pub fn table_def(name: &str) -> Option<&'static TableDef> {
    CATALOG.iter().find(|t| t.name == name)
}

/// One entry in the versioned forward-migration ledger: a column added to
/// the catalog after tables already shipped. Ids are strictly increasing
/// and never reused.
#[derive(Debug, Clone, Copy)]
pub struct ColumnMigration {
    pub id: i64,
    pub table: &'static str,
    pub column: ColumnSpec,
}

/// Ordered ledger of column additions. Provisioning applies the entries a
/// locator has not recorded yet, in order, exactly once each.
pub const COLUMN_MIGRATIONS: &[ColumnMigration] = &[
    ColumnMigration {
        id: 1,
        table: "products",
        column: ColumnSpec::optional("barcode", ColumnKind::Text),
    },
    ColumnMigration {
        id: 2,
        table: "customers",
        column: ColumnSpec::optional("loyalty_points", BigInt),
    },
    ColumnMigration {
        id: 3,
        table: "bookings",
        column: ColumnSpec::optional("notes", ColumnKind::Text),
    },
];

pub fn column_migrations() -> &'static [ColumnMigration] {
    COLUMN_MIGRATIONS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_is_dependency_ordered() {
        let mut seen: HashSet<&str> = HashSet::new();
        for table in catalog() {
            for fk in table.foreign_keys {
                assert!(
                    seen.contains(fk.references),
                    "{} references {} before it is defined",
                    table.name,
                    fk.references
                );
            }
            seen.insert(table.name);
        }
    }

    #[test]
    fn test_every_table_has_uuid_primary_key_first() {
        for table in catalog() {
            let id = &table.columns[0];
            assert_eq!(id.name, "id", "{} must lead with id", table.name);
            assert_eq!(id.kind, ColumnKind::Uuid);
            assert!(!id.nullable);
        }
    }

    #[test]
    fn test_foreign_key_columns_exist() {
        for table in catalog() {
            for fk in table.foreign_keys {
                assert!(
                    table.columns.iter().any(|c| c.name == fk.column),
                    "{}.{} missing",
                    table.name,
                    fk.column
                );
            }
        }
    }

    #[test]
    fn test_no_table_declares_the_discriminator() {
        // The discriminator is injected by topology, never authored.
        for table in catalog() {
            assert!(table.columns.iter().all(|c| c.name != DISCRIMINATOR));
        }
    }

    #[test]
    fn test_migration_ids_are_strictly_increasing() {
        let ids: Vec<i64> = column_migrations().iter().map(|m| m.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_migrations_target_catalog_tables_and_fresh_columns() {
        for migration in column_migrations() {
            let table = table_def(migration.table).expect("unknown table in ledger");
            assert!(
                table.columns.iter().all(|c| c.name != migration.column.name),
                "{}.{} is already in the base catalog",
                migration.table,
                migration.column.name
            );
        }
    }
}
