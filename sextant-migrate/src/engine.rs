//! The migrator: one entry point per verb.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::baseline::{BaselineReport, baseline};
use crate::callback::{Callback, CallbackContext, Callbacks, Event};
use crate::config::MigrationConfig;
use crate::connection::MigrationConnection;
use crate::error::{MigrateResult, MigrationError};
use crate::file::SqlDirectorySource;
use crate::history::SchemaHistory;
use crate::info::{MigrationInfoSet, MigrationState, reconcile};
use crate::lock::HistoryLock;
use crate::migrate::{Coordinator, MigrateReport};
use crate::migration::{MigrationType, ResolvedMigration};
use crate::repair::{RepairReport, repair};
use crate::resolution::CompositeResolver;
use crate::retry::RetryPolicy;
use crate::source::MigrationSource;
use crate::validate::{ValidationViolation, validate};
use crate::version::MigrationVersion;

/// One line of `info` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRow {
    /// `Versioned`, `Repeatable`, or empty for rows the engine wrote.
    pub category: String,
    /// Version, `None` for repeatables.
    pub version: Option<MigrationVersion>,
    /// Description.
    pub description: String,
    /// Kind of migration or row.
    pub migration_type: MigrationType,
    /// When it was applied, if it was.
    pub installed_on: Option<DateTime<Utc>>,
    /// Reconciled state.
    pub state: MigrationState,
}

/// Result of `info`.
#[derive(Debug, Clone)]
pub struct InfoReport {
    /// The reconciled view.
    pub infos: MigrationInfoSet,
    /// Version of the latest applied migration.
    pub schema_version: Option<MigrationVersion>,
}

impl InfoReport {
    /// One row per entry, in display order.
    pub fn rows(&self) -> Vec<InfoRow> {
        self.infos
            .all()
            .iter()
            .map(|i| InfoRow {
                category: if i.migration_type().is_synthetic() {
                    String::new()
                } else if i.version().is_some() {
                    "Versioned".to_string()
                } else {
                    "Repeatable".to_string()
                },
                version: i.version().cloned(),
                description: i.description().to_string(),
                migration_type: i.migration_type(),
                installed_on: i.installed_on(),
                state: i.state(),
            })
            .collect()
    }

    /// Number of entries in `state`.
    pub fn count(&self, state: MigrationState) -> usize {
        self.infos.all().iter().filter(|i| i.state() == state).count()
    }

    /// Get a summary of the result.
    pub fn summary(&self) -> String {
        let version = self
            .schema_version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "<< Empty Schema >>".to_string());
        format!(
            "Schema version: {}, {} applied, {} pending, {} failed",
            version,
            self.infos.applied().len(),
            self.infos.pending().len(),
            self.infos.failed().len()
        )
    }
}

/// Result of `validate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidateReport {
    /// Number of resolved migrations the history was checked against.
    pub validated_count: usize,
    /// Inconsistencies found, empty when the history is valid.
    pub violations: Vec<ValidationViolation>,
}

impl ValidateReport {
    /// Whether the history is consistent.
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Turn violations into a `ValidationFailed` error.
    pub fn into_result(self) -> MigrateResult<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(MigrationError::ValidationFailed(self.violations))
        }
    }

    /// Get a summary of the result.
    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!("Successfully validated {} migrations", self.validated_count)
        } else {
            format!(
                "Validation failed with {} violation(s): {}",
                self.violations.len(),
                self.violations[0].message
            )
        }
    }
}

/// Runs the migration verbs against one history and connection.
///
/// ```rust,ignore
/// let migrator = Migrator::new(history, connection, MigrationConfig::new().locations(["db"]))
///     .with_source(CodeMigrationSource::new().register(BackfillUsers));
/// let report = migrator.migrate().await?;
/// println!("{}", report.summary());
/// ```
pub struct Migrator<H: SchemaHistory + 'static, C: MigrationConnection> {
    history: Arc<H>,
    connection: C,
    resolver: CompositeResolver,
    config: MigrationConfig,
    lock: HistoryLock<H>,
    retry: RetryPolicy,
    callbacks: Callbacks,
}

impl<H: SchemaHistory + 'static, C: MigrationConnection> Migrator<H, C> {
    /// Create a migrator that reads SQL migrations from the configured locations.
    pub fn new(history: H, connection: C, config: MigrationConfig) -> Self {
        let history = Arc::new(history);
        let retry = RetryPolicy::new(connection.dialect(), config.retry.clone());
        let lock = HistoryLock::new(Arc::clone(&history), config.lock.clone(), retry.clone());
        let mut resolver = CompositeResolver::new();
        if !config.locations.is_empty() {
            resolver =
                resolver.with_source(SqlDirectorySource::with_locations(config.locations.clone()));
        }
        Self {
            history,
            connection,
            resolver,
            config,
            lock,
            retry,
            callbacks: Callbacks::new(),
        }
    }

    /// Register a lifecycle callback. SQL callbacks in the configured
    /// locations are picked up without registration.
    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks = self.callbacks.with(callback);
        self
    }

    /// Add a migration source.
    pub fn with_source(mut self, source: impl MigrationSource + 'static) -> Self {
        self.resolver = self.resolver.with_source(source);
        self
    }

    /// The schema history.
    pub fn history(&self) -> &H {
        &self.history
    }

    /// The connection migrations run on.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// The configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Owner id this migrator writes into the lock row.
    pub fn lock_owner(&self) -> &str {
        self.lock.owner()
    }

    /// Resolve migrations from every source.
    pub async fn resolve(&self) -> MigrateResult<Vec<ResolvedMigration>> {
        self.resolver.resolve().await
    }

    /// Registered callbacks followed by SQL callbacks from the locations.
    pub async fn callbacks(&self) -> MigrateResult<Callbacks> {
        let mut callbacks = self.callbacks.clone();
        if !self.config.locations.is_empty() {
            let scripts = SqlDirectorySource::with_locations(self.config.locations.clone())
                .callbacks()
                .await?;
            callbacks.extend(
                scripts
                    .into_iter()
                    .map(|c| Arc::new(c) as Arc<dyn Callback>),
            );
        }
        Ok(callbacks)
    }

    /// Run `work` between `before` and `after`, firing `on_error` instead of
    /// `after` when it fails.
    async fn around<T, Fut>(
        &self,
        callbacks: &Callbacks,
        [before, after, on_error]: [Event; 3],
        work: Fut,
    ) -> MigrateResult<T>
    where
        Fut: Future<Output = MigrateResult<T>>,
    {
        let context = CallbackContext::new(&self.connection);
        callbacks.fire(before, &context).await?;
        match work.await {
            Ok(value) => {
                callbacks.fire(after, &context).await?;
                Ok(value)
            }
            Err(err) => {
                callbacks.fire_quietly(on_error, &context).await;
                Err(err)
            }
        }
    }

    async fn current_view(
        &self,
        resolved: &[ResolvedMigration],
    ) -> MigrateResult<MigrationInfoSet> {
        let history = self.history.as_ref();
        let rows = self.retry.run("read schema history", || history.read()).await?;
        reconcile(resolved, &rows, &self.config.migrate_options().reconcile_options())
    }

    /// Reconcile resolved migrations with the history.
    pub async fn info(&self) -> MigrateResult<InfoReport> {
        let callbacks = self.callbacks().await?;
        let work = async {
            let resolved = self.resolve().await?;
            let infos = self.current_view(&resolved).await?;
            let schema_version = infos.current().and_then(|i| i.version().cloned());
            Ok::<_, MigrationError>(InfoReport {
                infos,
                schema_version,
            })
        };
        let events = [Event::BeforeInfo, Event::AfterInfo, Event::AfterInfoError];
        let report = self.around(&callbacks, events, work).await?;
        info!("{}", report.summary());
        Ok(report)
    }

    /// Check the history against resolved migrations.
    ///
    /// Violations are part of the report. Callbacks see them as a failed
    /// validate.
    pub async fn validate(&self) -> MigrateResult<ValidateReport> {
        let started = Instant::now();
        let callbacks = self.callbacks().await?;
        let context = CallbackContext::new(&self.connection);
        callbacks.fire(Event::BeforeValidate, &context).await?;

        let outcome = async {
            let resolved = self.resolve().await?;
            let infos = self.current_view(&resolved).await?;
            let violations = validate(&infos, &self.config.validate_options());
            Ok::<_, MigrationError>(ValidateReport {
                validated_count: resolved.len(),
                violations,
            })
        }
        .await;

        let report = match outcome {
            Ok(report) if report.is_valid() => {
                callbacks.fire(Event::AfterValidate, &context).await?;
                report
            }
            Ok(report) => {
                callbacks
                    .fire_quietly(Event::AfterValidateError, &context)
                    .await;
                report
            }
            Err(err) => {
                callbacks
                    .fire_quietly(Event::AfterValidateError, &context)
                    .await;
                return Err(err);
            }
        };

        if report.is_valid() {
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "{}",
                report.summary()
            );
        } else {
            for violation in &report.violations {
                warn!(script = %violation.script, "{}", violation.message);
            }
        }
        Ok(report)
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> MigrateResult<MigrateReport> {
        let callbacks = self.callbacks().await?;
        let resolved = self.resolve().await?;
        let options = self.config.migrate_options();
        Coordinator::new(
            self.history.as_ref(),
            &self.lock,
            &self.connection,
            &self.retry,
            &options,
        )
        .with_callbacks(&callbacks)
        .run(&resolved)
        .await
    }

    /// Remove failed rows, mark vanished migrations deleted, realign checksums.
    pub async fn repair(&self) -> MigrateResult<RepairReport> {
        let callbacks = self.callbacks().await?;
        let installed_by = self.config.effective_installed_by();
        let work = async {
            let resolved = self.resolve().await?;
            repair(
                self.history.as_ref(),
                &self.lock,
                &self.retry,
                &resolved,
                &installed_by,
            )
            .await
        };
        let events = [Event::BeforeRepair, Event::AfterRepair, Event::AfterRepairError];
        self.around(&callbacks, events, work).await
    }

    /// Seed the history with the configured baseline marker.
    pub async fn baseline(&self) -> MigrateResult<BaselineReport> {
        let callbacks = self.callbacks().await?;
        let installed_by = self.config.effective_installed_by();
        let work = baseline(
            self.history.as_ref(),
            &self.lock,
            &self.retry,
            &self.config.baseline_version,
            &self.config.baseline_description,
            &installed_by,
        );
        let events = [
            Event::BeforeBaseline,
            Event::AfterBaseline,
            Event::AfterBaselineError,
        ];
        self.around(&callbacks, events, work).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::memory::{InMemorySchemaHistory, MemoryConnection};
    use crate::source::{CodeMigration, CodeMigrationSource};
    use crate::validate::ViolationKind;

    struct Step {
        version: &'static str,
        description: String,
        sql: &'static str,
    }

    #[async_trait]
    impl CodeMigration for Step {
        fn version(&self) -> Option<MigrationVersion> {
            MigrationVersion::parse(self.version).ok()
        }

        fn description(&self) -> &str {
            &self.description
        }

        async fn migrate(&self, connection: &dyn MigrationConnection) -> MigrateResult<()> {
            connection.execute_batch(self.sql).await
        }
    }

    fn migrator(
        history: InMemorySchemaHistory,
        steps: Vec<Step>,
    ) -> Migrator<InMemorySchemaHistory, MemoryConnection> {
        let mut source = CodeMigrationSource::new();
        for step in steps {
            source = source.register(step);
        }
        let config = MigrationConfig::new()
            .locations(Vec::<String>::new())
            .installed_by("tester");
        let connection = MemoryConnection::new().with_history(history.clone());
        Migrator::new(history, connection, config).with_source(source)
    }

    struct Recorder {
        seen: Arc<Mutex<Vec<Event>>>,
    }

    #[async_trait]
    impl Callback for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn supports(&self, event: Event) -> bool {
            event != Event::BeforeEachMigrate && event != Event::AfterEachMigrate
        }

        async fn handle(&self, event: Event, _context: &CallbackContext<'_>) -> MigrateResult<()> {
            self.seen.lock().push(event);
            Ok(())
        }
    }

    fn steps(versions: &[&'static str]) -> Vec<Step> {
        versions
            .iter()
            .map(|v| Step {
                version: *v,
                description: format!("step {}", v),
                sql: "CREATE TABLE t (id INT)",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_info_on_fresh_database() {
        let m = migrator(InMemorySchemaHistory::new(), steps(&["1", "2"]));
        let report = m.info().await.unwrap();
        assert_eq!(report.schema_version, None);
        assert_eq!(report.count(MigrationState::Pending), 2);
        assert!(report.summary().contains("<< Empty Schema >>"));
        assert_eq!(report.rows()[0].category, "Versioned");
    }

    #[tokio::test]
    async fn test_migrate_then_info() {
        let m = migrator(InMemorySchemaHistory::new(), steps(&["1", "2"]));
        let report = m.migrate().await.unwrap();
        assert_eq!(report.applied_count(), 2);

        let info = m.info().await.unwrap();
        assert_eq!(info.schema_version, Some(MigrationVersion::parse("2").unwrap()));
        assert_eq!(info.count(MigrationState::Success), 2);
        assert_eq!(m.history().rows()[0].installed_by, "tester");
        assert_eq!(m.connection().commits(), 2);
    }

    #[tokio::test]
    async fn test_validate_reports_missing_migration() {
        let history = InMemorySchemaHistory::new();
        migrator(history.clone(), steps(&["1", "2"])).migrate().await.unwrap();

        let report = migrator(history, steps(&["1"])).validate().await.unwrap();
        assert!(!report.is_valid());
        assert_eq!(report.violations[0].kind, ViolationKind::CountMismatch);
        assert!(matches!(
            report.into_result(),
            Err(MigrationError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_repair_and_baseline_verbs() {
        let history = InMemorySchemaHistory::new();
        let m = migrator(history.clone(), steps(&["3"]));
        let baselined = m.baseline().await.unwrap();
        assert_eq!(baselined.version.to_string(), "1");

        let repaired = m.repair().await.unwrap();
        assert!(!repaired.has_changes());

        let report = m.migrate().await.unwrap();
        assert_eq!(report.applied_count(), 1);
        assert_eq!(history.rows().len(), 2);
    }

    #[tokio::test]
    async fn test_verbs_fire_callbacks() {
        let history = InMemorySchemaHistory::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let m = migrator(history.clone(), steps(&["1"])).with_callback(Recorder {
            seen: Arc::clone(&seen),
        });

        m.migrate().await.unwrap();
        m.repair().await.unwrap();
        m.info().await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                Event::BeforeMigrate,
                Event::AfterMigrate,
                Event::BeforeRepair,
                Event::AfterRepair,
                Event::BeforeInfo,
                Event::AfterInfo,
            ]
        );

        seen.lock().clear();
        let drifted = migrator(history, Vec::new()).with_callback(Recorder {
            seen: Arc::clone(&seen),
        });
        assert!(!drifted.validate().await.unwrap().is_valid());
        assert!(drifted.baseline().await.is_err());
        assert_eq!(
            *seen.lock(),
            vec![
                Event::BeforeValidate,
                Event::AfterValidateError,
                Event::BeforeBaseline,
                Event::AfterBaselineError,
            ]
        );
    }

    #[tokio::test]
    async fn test_sql_callbacks_from_locations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("V1__Create.sql"), "CREATE TABLE a (id INT)").unwrap();
        std::fs::write(dir.path().join("afterMigrate.sql"), "ANALYZE").unwrap();

        let history = InMemorySchemaHistory::new();
        let config = MigrationConfig::new().locations([dir.path()]);
        let connection = MemoryConnection::new().with_history(history.clone());
        let m = Migrator::new(history, connection, config);

        assert_eq!(m.callbacks().await.unwrap().len(), 1);
        m.migrate().await.unwrap();
        assert_eq!(
            m.connection().executed(),
            vec!["CREATE TABLE a (id INT)", "ANALYZE"]
        );
    }
}
