//! Corrective mutations of the schema history.
//!
//! Repair runs three steps, each against a freshly reconciled view:
//!
//! 1. remove rows of failed migrations
//! 2. append a DELETE row for every applied migration that no longer resolves
//! 3. overwrite description, type and checksum of applied versioned
//!    migrations whose resolved counterpart changed
//!
//! Running repair on a consistent history writes nothing.

use tracing::info;

use crate::error::MigrateResult;
use crate::history::{NewAppliedMigration, RowUpdate, SchemaHistory};
use crate::info::{MigrationInfoSet, ReconcileOptions, reconcile};
use crate::lock::HistoryLock;
use crate::migration::{MigrationType, ResolvedMigration};
use crate::retry::RetryPolicy;
use crate::version::MigrationVersion;

/// A history row touched by repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairedEntry {
    /// Version of the affected row, `None` for repeatables.
    pub version: Option<MigrationVersion>,
    /// Description the row carries after repair.
    pub description: String,
    /// Rank of the affected row, not of any DELETE row appended for it.
    pub installed_rank: i32,
}

/// Result of a repair run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Number of failed rows removed.
    pub removed_failed: usize,
    /// Rows marked deleted because their migration vanished.
    pub deleted: Vec<RepairedEntry>,
    /// Rows realigned with their resolved migration.
    pub aligned: Vec<RepairedEntry>,
}

impl RepairReport {
    /// Whether repair wrote anything.
    pub fn has_changes(&self) -> bool {
        self.removed_failed > 0 || !self.deleted.is_empty() || !self.aligned.is_empty()
    }

    /// Get a summary of the result.
    pub fn summary(&self) -> String {
        if !self.has_changes() {
            return "Repair of schema history not necessary. No changes made.".to_string();
        }
        format!(
            "Repair: {} failed removed, {} marked deleted, {} realigned",
            self.removed_failed,
            self.deleted.len(),
            self.aligned.len()
        )
    }
}

/// Run all three repair steps while holding the lock.
pub async fn repair<H: SchemaHistory + 'static>(
    history: &H,
    lock: &HistoryLock<H>,
    retry: &RetryPolicy,
    resolved: &[ResolvedMigration],
    installed_by: &str,
) -> MigrateResult<RepairReport> {
    if !history.exists().await? {
        info!("Schema history does not exist. Nothing to repair.");
        return Ok(RepairReport::default());
    }

    let report = lock
        .with_lock(move || async move {
            let removed_failed = retry
                .run("remove failed migrations", || history.remove_failed())
                .await?;

            let set = view(history, retry, resolved).await?;
            let deleted = mark_missing_deleted(history, retry, &set, installed_by).await?;

            let set = view(history, retry, resolved).await?;
            let aligned = align(history, retry, &set).await?;

            Ok(RepairReport {
                removed_failed,
                deleted,
                aligned,
            })
        })
        .await?;

    info!(
        removed_failed = report.removed_failed,
        deleted = report.deleted.len(),
        aligned = report.aligned.len(),
        "{}",
        report.summary()
    );
    Ok(report)
}

async fn view<H: SchemaHistory>(
    history: &H,
    retry: &RetryPolicy,
    resolved: &[ResolvedMigration],
) -> MigrateResult<MigrationInfoSet> {
    let rows = retry.run("read schema history", || history.read()).await?;
    reconcile(resolved, &rows, &ReconcileOptions::default())
}

async fn mark_missing_deleted<H: SchemaHistory>(
    history: &H,
    retry: &RetryPolicy,
    set: &MigrationInfoSet,
    installed_by: &str,
) -> MigrateResult<Vec<RepairedEntry>> {
    let mut marked = Vec::new();
    for info in set.all().iter().filter(|i| i.state().is_missing()) {
        let Some(row) = info.applied() else { continue };
        let marker = NewAppliedMigration {
            version: row.version.clone(),
            description: row.description.clone(),
            migration_type: MigrationType::Delete,
            script: row.script.clone(),
            checksum: None,
            installed_by: installed_by.to_string(),
            execution_time: 0,
            success: true,
        };
        retry
            .run("mark migration deleted", || history.append(marker.clone()))
            .await?;
        info!(
            script = %row.script,
            installed_rank = row.installed_rank,
            "Marked missing migration as deleted"
        );
        marked.push(RepairedEntry {
            version: row.version.clone(),
            description: row.description.clone(),
            installed_rank: row.installed_rank,
        });
    }
    Ok(marked)
}

async fn align<H: SchemaHistory>(
    history: &H,
    retry: &RetryPolicy,
    set: &MigrationInfoSet,
) -> MigrateResult<Vec<RepairedEntry>> {
    let mut aligned = Vec::new();
    for info in set.all() {
        let (Some(row), Some(resolved)) = (info.applied(), info.resolved()) else {
            continue;
        };
        if !row.success || row.is_synthetic() || row.version.is_none() || info.is_deleted() {
            continue;
        }
        let drifted = row.checksum != resolved.checksum
            || row.description != resolved.description
            || row.migration_type != resolved.migration_type;
        if !drifted {
            continue;
        }

        let update = RowUpdate {
            description: resolved.description.clone(),
            migration_type: resolved.migration_type,
            checksum: resolved.checksum,
        };
        retry
            .run("align migration", || history.update_row(row.installed_rank, update.clone()))
            .await?;
        info!(
            script = %resolved.script,
            installed_rank = row.installed_rank,
            "Realigned applied migration"
        );
        aligned.push(RepairedEntry {
            version: row.version.clone(),
            description: resolved.description.clone(),
            installed_rank: row.installed_rank,
        });
    }
    Ok(aligned)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dialect::Dialect;
    use crate::info::MigrationState;
    use crate::lock::LockSettings;
    use crate::memory::InMemorySchemaHistory;
    use crate::migration::SqlScriptExecutor;
    use crate::retry::RetrySettings;

    fn sql(version: &str, checksum: i32) -> ResolvedMigration {
        ResolvedMigration::versioned(
            MigrationVersion::parse(version).unwrap(),
            format!("Migration {}", version),
            format!("V{}__m.sql", version),
            Arc::new(SqlScriptExecutor::new("SELECT 1")),
        )
        .with_checksum(checksum)
    }

    fn row(version: &str, checksum: i32, success: bool) -> NewAppliedMigration {
        NewAppliedMigration {
            version: Some(MigrationVersion::parse(version).unwrap()),
            description: format!("Migration {}", version),
            migration_type: MigrationType::Sql,
            script: format!("V{}__m.sql", version),
            checksum: Some(checksum),
            installed_by: "test".to_string(),
            execution_time: 1,
            success,
        }
    }

    struct Fixture {
        history: Arc<InMemorySchemaHistory>,
        lock: HistoryLock<InMemorySchemaHistory>,
        retry: RetryPolicy,
    }

    impl Fixture {
        async fn new(rows: Vec<NewAppliedMigration>) -> Self {
            let history = Arc::new(InMemorySchemaHistory::new());
            history.create_if_missing().await.unwrap();
            for r in rows {
                history.append(r).await.unwrap();
            }
            let retry = RetryPolicy::new(Dialect::GENERIC, RetrySettings::default());
            let lock =
                HistoryLock::new(Arc::clone(&history), LockSettings::default(), retry.clone());
            Self {
                history,
                lock,
                retry,
            }
        }

        async fn repair(&self, resolved: &[ResolvedMigration]) -> RepairReport {
            repair(self.history.as_ref(), &self.lock, &self.retry, resolved, "repairer")
                .await
                .unwrap()
        }

        async fn states(&self, resolved: &[ResolvedMigration]) -> Vec<MigrationState> {
            let rows = self.history.read().await.unwrap();
            reconcile(resolved, &rows, &ReconcileOptions::default())
                .unwrap()
                .all()
                .iter()
                .map(|i| i.state())
                .collect()
        }
    }

    #[tokio::test]
    async fn test_removes_failed_rows() {
        let f = Fixture::new(vec![row("1", 1, true), row("2", 2, false)]).await;
        let resolved = [sql("1", 1), sql("2", 2)];

        let report = f.repair(&resolved).await;
        assert_eq!(report.removed_failed, 1);
        assert_eq!(
            f.states(&resolved).await,
            vec![MigrationState::Success, MigrationState::Pending]
        );
    }

    #[tokio::test]
    async fn test_marks_missing_as_deleted() {
        let f = Fixture::new(vec![row("1", 1, true), row("2", 2, true), row("3", 3, true)]).await;
        let resolved = [sql("1", 1), sql("3", 3)];

        let report = f.repair(&resolved).await;
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0].installed_rank, 2);

        let rows = f.history.rows();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3].migration_type, MigrationType::Delete);
        assert_eq!(rows[3].installed_rank, 4);
        assert_eq!(rows[3].installed_by, "repairer");
        assert_eq!(
            f.states(&resolved).await,
            vec![
                MigrationState::Success,
                MigrationState::Deleted,
                MigrationState::Success,
                MigrationState::Success,
            ]
        );
    }

    #[tokio::test]
    async fn test_aligns_checksum_description_and_type() {
        let f = Fixture::new(vec![row("1", 1, true), row("2", 2, true)]).await;
        let mut changed = sql("2", 20);
        changed.description = "Renamed".to_string();
        let resolved = [sql("1", 1), changed.with_type(MigrationType::Code)];

        let report = f.repair(&resolved).await;
        assert_eq!(report.aligned.len(), 1);

        let rows = f.history.rows();
        assert_eq!(rows[1].checksum, Some(20));
        assert_eq!(rows[1].description, "Renamed");
        assert_eq!(rows[1].migration_type, MigrationType::Code);
        assert_eq!(rows[1].installed_rank, 2);
        assert_eq!(rows[1].version, Some(MigrationVersion::parse("2").unwrap()));
    }

    #[tokio::test]
    async fn test_idempotent() {
        let f = Fixture::new(vec![row("1", 1, true), row("2", 2, false), row("3", 3, true)]).await;
        let resolved = [sql("1", 10), sql("2", 2)];

        let first = f.repair(&resolved).await;
        assert!(first.has_changes());
        let snapshot = f.history.rows();

        let second = f.repair(&resolved).await;
        assert!(!second.has_changes(), "{second:?}");
        assert_eq!(f.history.rows(), snapshot);
        assert!(second.summary().contains("not necessary"));
        assert!(!f.history.is_locked());
    }

    #[tokio::test]
    async fn test_missing_table_is_a_no_op() {
        let history = Arc::new(InMemorySchemaHistory::new());
        let retry = RetryPolicy::new(Dialect::GENERIC, RetrySettings::default());
        let lock = HistoryLock::new(Arc::clone(&history), LockSettings::default(), retry.clone());
        let report = repair(history.as_ref(), &lock, &retry, &[], "x").await.unwrap();
        assert!(!report.has_changes());
        assert!(!history.exists().await.unwrap());
    }
}
