//! Baseline: adopt an existing database by seeding the history with a marker.

use tracing::info;

use crate::error::{MigrateResult, MigrationError};
use crate::history::{NewAppliedMigration, SchemaHistory};
use crate::lock::HistoryLock;
use crate::migration::MigrationType;
use crate::retry::RetryPolicy;
use crate::version::MigrationVersion;

/// Default description of the baseline marker.
pub const DEFAULT_BASELINE_DESCRIPTION: &str = "<< Baseline >>";

/// Result of a baseline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineReport {
    /// Baseline version.
    pub version: MigrationVersion,
    /// Description of the marker row.
    pub description: String,
    /// Whether the history table had to be created.
    pub created_table: bool,
    /// Rank of the marker row, `None` if an identical marker was already present.
    pub installed_rank: Option<i32>,
}

impl BaselineReport {
    /// Whether a marker row was written.
    pub fn baselined(&self) -> bool {
        self.installed_rank.is_some()
    }

    /// Get a summary of the result.
    pub fn summary(&self) -> String {
        if self.baselined() {
            format!("Successfully baselined schema with version: {}", self.version)
        } else {
            format!("Schema is already baselined with version: {}", self.version)
        }
    }
}

/// Write a BASELINE marker at `version`.
///
/// Fails with `Precondition` without touching the history when it already
/// tracks real migrations or carries a different baseline marker.
pub async fn baseline<H: SchemaHistory + 'static>(
    history: &H,
    lock: &HistoryLock<H>,
    retry: &RetryPolicy,
    version: &MigrationVersion,
    description: &str,
    installed_by: &str,
) -> MigrateResult<BaselineReport> {
    if version.is_empty() || version.is_latest() {
        return Err(MigrationError::precondition(format!(
            "'{}' is not a valid baseline version",
            version
        )));
    }

    let created_table = !history.exists().await?;
    if created_table {
        retry
            .run("create schema history", || history.create_if_missing())
            .await?;
        info!(table = history.table(), "Created schema history table");
    }

    let installed_rank = lock
        .with_lock(move || async move {
            let rows = retry.run("read schema history", || history.read()).await?;
            let rows: Vec<_> = rows.into_iter().filter(|r| !r.is_lock()).collect();

            let existing = rows
                .iter()
                .find(|r| r.migration_type == MigrationType::Baseline);
            if let Some(marker) = existing {
                if marker.version.as_ref() == Some(version) && marker.description == description {
                    return Ok(None);
                }
                return Err(MigrationError::precondition(format!(
                    "unable to baseline {} with ({}, {}) because it already has a baseline \
                     ({}, {})",
                    history.table(),
                    version,
                    description,
                    marker.version.as_ref().map(|v| v.to_string()).unwrap_or_default(),
                    marker.description
                )));
            }

            let schema_marker_at_zero = rows.iter().any(|r| {
                r.migration_type == MigrationType::Schema
                    && r.version.as_ref().is_some_and(is_zero)
            });
            if schema_marker_at_zero && is_zero(version) {
                return Err(MigrationError::precondition(
                    "unable to baseline with version 0 as this version was used for schema \
                     creation",
                ));
            }

            if let Some(real) = rows.iter().find(|r| !r.is_synthetic()) {
                return Err(MigrationError::precondition(format!(
                    "{} already tracks migrations (first: {}), refusing to baseline",
                    history.table(),
                    real.script
                )));
            }

            let row = retry
                .run("append baseline marker", || {
                    history.append(NewAppliedMigration {
                        version: Some(version.clone()),
                        description: description.to_string(),
                        migration_type: MigrationType::Baseline,
                        script: description.to_string(),
                        checksum: None,
                        installed_by: installed_by.to_string(),
                        execution_time: 0,
                        success: true,
                    })
                })
                .await?;
            Ok(Some(row.installed_rank))
        })
        .await?;

    let report = BaselineReport {
        version: version.clone(),
        description: description.to_string(),
        created_table,
        installed_rank,
    };
    info!(version = %version, "{}", report.summary());
    Ok(report)
}

fn is_zero(version: &MigrationVersion) -> bool {
    !version.parts().is_empty() && version.parts().iter().all(|p| *p == 0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dialect::Dialect;
    use crate::lock::LockSettings;
    use crate::memory::InMemorySchemaHistory;
    use crate::retry::RetrySettings;

    struct Fixture {
        history: Arc<InMemorySchemaHistory>,
        lock: HistoryLock<InMemorySchemaHistory>,
        retry: RetryPolicy,
    }

    impl Fixture {
        fn new() -> Self {
            let history = Arc::new(InMemorySchemaHistory::new());
            let retry = RetryPolicy::new(Dialect::GENERIC, RetrySettings::default());
            let lock =
                HistoryLock::new(Arc::clone(&history), LockSettings::default(), retry.clone());
            Self {
                history,
                lock,
                retry,
            }
        }

        async fn baseline(
            &self,
            version: &str,
            description: &str,
        ) -> MigrateResult<BaselineReport> {
            baseline(
                self.history.as_ref(),
                &self.lock,
                &self.retry,
                &MigrationVersion::parse(version).unwrap(),
                description,
                "tester",
            )
            .await
        }

        async fn append(&self, version: &str, migration_type: MigrationType) {
            self.history.create_if_missing().await.unwrap();
            self.history
                .append(NewAppliedMigration {
                    version: Some(MigrationVersion::parse(version).unwrap()),
                    description: "existing".to_string(),
                    migration_type,
                    script: "existing".to_string(),
                    checksum: None,
                    installed_by: "tester".to_string(),
                    execution_time: 0,
                    success: true,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_baseline_on_absent_table() {
        let f = Fixture::new();
        let report = f.baseline("2", DEFAULT_BASELINE_DESCRIPTION).await.unwrap();

        assert!(report.created_table);
        assert_eq!(report.installed_rank, Some(1));
        let rows = f.history.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].migration_type, MigrationType::Baseline);
        assert_eq!(rows[0].version, Some(MigrationVersion::parse("2").unwrap()));
        assert_eq!(rows[0].installed_by, "tester");
        assert!(!f.history.is_locked());
    }

    #[tokio::test]
    async fn test_same_marker_is_a_no_op() {
        let f = Fixture::new();
        f.baseline("2", DEFAULT_BASELINE_DESCRIPTION).await.unwrap();
        let again = f.baseline("2", DEFAULT_BASELINE_DESCRIPTION).await.unwrap();
        assert!(!again.baselined());
        assert!(again.summary().contains("already baselined"));
        assert_eq!(f.history.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_different_marker_is_rejected() {
        let f = Fixture::new();
        f.baseline("2", DEFAULT_BASELINE_DESCRIPTION).await.unwrap();
        let err = f.baseline("3", DEFAULT_BASELINE_DESCRIPTION).await.unwrap_err();
        assert!(matches!(err, MigrationError::Precondition(_)));
        assert_eq!(f.history.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_real_migrations_are_rejected() {
        let f = Fixture::new();
        f.append("1", MigrationType::Sql).await;
        let err = f.baseline("2", DEFAULT_BASELINE_DESCRIPTION).await.unwrap_err();
        assert!(matches!(err, MigrationError::Precondition(_)));
        assert_eq!(f.history.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_synthetic_only_history_proceeds() {
        let f = Fixture::new();
        f.append("0", MigrationType::Schema).await;
        let report = f.baseline("5", DEFAULT_BASELINE_DESCRIPTION).await.unwrap();
        assert!(!report.created_table);
        assert_eq!(report.installed_rank, Some(2));
    }

    #[tokio::test]
    async fn test_version_zero_clashes_with_schema_marker() {
        let f = Fixture::new();
        f.append("0", MigrationType::Schema).await;
        let err = f.baseline("0", DEFAULT_BASELINE_DESCRIPTION).await.unwrap_err();
        assert!(err.to_string().contains("schema creation"));
    }
}
