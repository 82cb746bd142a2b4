use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One tier-migration run for a tenant: shared store → dedicated store.
///
/// Terminal states are `Succeeded` and `PartiallyFailed`; a job is never
/// retried automatically. Re-running migration creates a new job.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MigrationJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub source_locator: String,
    pub target_locator: String,
    pub status: MigrationStatus,

    /// Per-table outcomes, in the order the copy pipeline ran them.
    #[sqlx(json)]
    pub tables: Vec<TableMigration>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationJob {
    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| matches!(t.outcome, TableOutcome::Failed { .. }))
            .map(|t| t.table.as_str())
            .collect()
    }

    pub fn rows_copied(&self) -> u64 {
        self.tables
            .iter()
            .map(|t| match t.outcome {
                TableOutcome::Succeeded { rows_copied } => rows_copied,
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Running,
    Succeeded,
    PartiallyFailed,
}

impl MigrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallyFailed)
    }
}

/// Outcome of one table in the copy pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableMigration {
    pub table: String,
    pub outcome: TableOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TableOutcome {
    Pending,
    Succeeded { rows_copied: u64 },
    Failed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with(outcomes: Vec<(&str, TableOutcome)>) -> MigrationJob {
        MigrationJob {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            source_locator: "till_shared".to_string(),
            target_locator: "till_tenant_x".to_string(),
            status: MigrationStatus::Running,
            tables: outcomes
                .into_iter()
                .map(|(table, outcome)| TableMigration {
                    table: table.to_string(),
                    outcome,
                })
                .collect(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    #[test]
    fn test_failed_tables_and_row_totals() {
        let job = job_with(vec![
            ("customers", TableOutcome::Succeeded { rows_copied: 10 }),
            (
                "invoices",
                TableOutcome::Failed {
                    reason: "connection reset".to_string(),
                },
            ),
            ("payments", TableOutcome::Pending),
        ]);

        assert_eq!(job.failed_tables(), vec!["invoices"]);
        assert_eq!(job.rows_copied(), 10);
    }

    #[test]
    fn test_outcome_serialization_shape() {
        let outcome = TableOutcome::Succeeded { rows_copied: 3 };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["state"], "succeeded");
        assert_eq!(json["rows_copied"], 3);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!MigrationStatus::Pending.is_terminal());
        assert!(!MigrationStatus::Running.is_terminal());
        assert!(MigrationStatus::Succeeded.is_terminal());
        assert!(MigrationStatus::PartiallyFailed.is_terminal());
    }
}
