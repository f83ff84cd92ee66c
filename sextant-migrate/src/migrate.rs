//! Applying pending migrations.
//!
//! Each step takes the history lock, re-reads the history, refuses to go on
//! past a failed migration, applies the first pending migration and records
//! the outcome. Re-reading under the lock is what lets several runners share
//! one history: whoever gets the lock next sees the rows the previous holder
//! appended.
//!
//! A migration that can run in a transaction has its success row appended
//! inside that transaction, so the effect and its record commit together. A
//! transient conflict while recording rolls both back and the whole unit is
//! tried again. In group mode every pending migration shares one transaction.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::callback::{CallbackContext, Callbacks, Event};
use crate::connection::MigrationConnection;
use crate::error::{MigrateResult, MigrationError};
use crate::history::{AppliedMigration, NewAppliedMigration, SchemaHistory};
use crate::info::{MigrationInfoSet, ReconcileOptions, reconcile};
use crate::lock::HistoryLock;
use crate::migration::{MigrationType, ResolvedMigration};
use crate::retry::{Disposition, RetryPolicy};
use crate::validate::{ValidateOptions, validate};
use crate::version::{MigrationVersion, TargetVersion};

static NO_CALLBACKS: Callbacks = Callbacks::new();

/// Settings for one migrate run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateOptions {
    /// How far to migrate.
    pub target: TargetVersion,
    /// Apply pending migrations below the highest applied version.
    pub out_of_order: bool,
    /// Validate before the first migration is applied.
    pub validate_on_migrate: bool,
    /// Settings for that validation.
    pub validation: ValidateOptions,
    /// Apply all pending migrations in a single transaction.
    pub group: bool,
    /// Value for the `installed_by` column.
    pub installed_by: String,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            target: TargetVersion::Latest,
            out_of_order: false,
            validate_on_migrate: true,
            validation: ValidateOptions::default(),
            group: false,
            installed_by: "sextant".to_string(),
        }
    }
}

impl MigrateOptions {
    /// The reconcile options these settings imply.
    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            target: self.target.clone(),
            out_of_order: self.out_of_order,
        }
    }
}

/// One migration applied during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationExecution {
    /// Version, `None` for repeatables.
    pub version: Option<MigrationVersion>,
    /// Description.
    pub description: String,
    /// Script identifier.
    pub script: String,
    /// Kind of migration.
    pub migration_type: MigrationType,
    /// Rank of the recorded row.
    pub installed_rank: i32,
    /// Milliseconds spent in the migration itself.
    pub execution_time: i32,
}

impl MigrationExecution {
    fn from_row(row: &AppliedMigration) -> Self {
        Self {
            version: row.version.clone(),
            description: row.description.clone(),
            script: row.script.clone(),
            migration_type: row.migration_type,
            installed_rank: row.installed_rank,
            execution_time: row.execution_time,
        }
    }
}

/// Result of a migrate run.
#[derive(Debug, Clone, Default)]
pub struct MigrateReport {
    /// Schema version before the run.
    pub initial_version: Option<MigrationVersion>,
    /// Schema version after the run.
    pub target_version: Option<MigrationVersion>,
    /// Migrations applied, in order.
    pub migrations: Vec<MigrationExecution>,
    /// Warnings raised during the run.
    pub warnings: Vec<String>,
    /// Wall time of the run.
    pub execution_time: Duration,
}

impl MigrateReport {
    /// Number of migrations applied.
    pub fn applied_count(&self) -> usize {
        self.migrations.len()
    }

    /// Whether anything was applied.
    pub fn has_changes(&self) -> bool {
        !self.migrations.is_empty()
    }

    /// Get a summary of the result.
    pub fn summary(&self) -> String {
        if self.migrations.is_empty() {
            return "Schema history is up to date. No migration necessary.".to_string();
        }
        let noun = if self.migrations.len() == 1 {
            "migration"
        } else {
            "migrations"
        };
        match &self.target_version {
            Some(version) => format!(
                "Successfully applied {} {}, now at version v{} (execution time {}ms)",
                self.migrations.len(),
                noun,
                version,
                self.execution_time.as_millis()
            ),
            None => format!(
                "Successfully applied {} {} (execution time {}ms)",
                self.migrations.len(),
                noun,
                self.execution_time.as_millis()
            ),
        }
    }
}

/// Drives a migrate run against one history and connection.
pub struct Coordinator<'a, H: SchemaHistory + 'static, C: MigrationConnection> {
    history: &'a H,
    lock: &'a HistoryLock<H>,
    connection: &'a C,
    retry: &'a RetryPolicy,
    options: &'a MigrateOptions,
    callbacks: &'a Callbacks,
}

/// Why a unit of work inside a transaction stopped.
enum UnitFailure<'m> {
    /// The migration itself, or one of its callbacks, failed.
    Migration {
        migration: &'m ResolvedMigration,
        execution_time: i32,
        error: MigrationError,
    },
    /// Recording a row or committing failed.
    Record(MigrationError),
}

impl<'a, H: SchemaHistory + 'static, C: MigrationConnection> Coordinator<'a, H, C> {
    /// Create a coordinator.
    pub fn new(
        history: &'a H,
        lock: &'a HistoryLock<H>,
        connection: &'a C,
        retry: &'a RetryPolicy,
        options: &'a MigrateOptions,
    ) -> Self {
        Self {
            history,
            lock,
            connection,
            retry,
            options,
            callbacks: &NO_CALLBACKS,
        }
    }

    /// Fire `callbacks` around the run and around each migration.
    pub fn with_callbacks(mut self, callbacks: &'a Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Apply pending migrations from `resolved`.
    ///
    /// Stops at the first failure, which is recorded in the history and
    /// returned as [`MigrationError::ExecutionFailed`].
    pub async fn run(&self, resolved: &[ResolvedMigration]) -> MigrateResult<MigrateReport> {
        let context = CallbackContext::new(self.connection);
        self.callbacks.fire(Event::BeforeMigrate, &context).await?;
        match self.run_steps(resolved).await {
            Ok(report) => {
                self.callbacks.fire(Event::AfterMigrate, &context).await?;
                Ok(report)
            }
            Err(err) => {
                self.callbacks
                    .fire_quietly(Event::AfterMigrateError, &context)
                    .await;
                Err(err)
            }
        }
    }

    async fn run_steps(&self, resolved: &[ResolvedMigration]) -> MigrateResult<MigrateReport> {
        let started = Instant::now();
        self.retry
            .run("create schema history", || self.history.create_if_missing())
            .await?;

        let reconcile_options = self.options.reconcile_options();
        let initial = reconcile(resolved, &self.read().await?, &reconcile_options)?;
        let initial_version = initial.current().and_then(|i| i.version().cloned());
        match &initial_version {
            Some(version) => info!(version = %version, "Current version of schema"),
            None => info!("Schema history is empty"),
        }

        let warnings = collect_warnings(&initial, self.options);
        for warning in &warnings {
            warn!("{}", warning);
        }

        let mut migrations: Vec<MigrationExecution> = Vec::new();
        let mut validated = !self.options.validate_on_migrate;
        loop {
            self.lock.acquire().await?;
            let step = self.step(resolved, !validated).await;
            let released = self.lock.release().await;
            let applied = step?;
            released?;
            validated = true;

            if applied.is_empty() {
                break;
            }
            migrations.extend(applied);
            if self.options.target == TargetVersion::Next {
                break;
            }
        }

        let target_version = migrations
            .iter()
            .filter_map(|m| m.version.clone())
            .chain(initial_version.clone())
            .max();

        let report = MigrateReport {
            initial_version,
            target_version,
            migrations,
            warnings,
            execution_time: started.elapsed(),
        };
        info!(applied = report.applied_count(), "{}", report.summary());
        Ok(report)
    }

    async fn read(&self) -> MigrateResult<Vec<AppliedMigration>> {
        self.retry
            .run("read schema history", || self.history.read())
            .await
    }

    /// Apply the next pending migration, or all of them in group mode.
    async fn step(
        &self,
        resolved: &[ResolvedMigration],
        validate_first: bool,
    ) -> MigrateResult<Vec<MigrationExecution>> {
        let rows = self.read().await?;
        let set = reconcile(resolved, &rows, &self.options.reconcile_options())?;

        if let Some(failed) = set
            .failed()
            .into_iter()
            .find(|i| !self.options.validation.skips(i))
        {
            return Err(MigrationError::FailedMigrationPresent(format!(
                "{} ({})",
                failed.label(),
                failed.description()
            )));
        }

        if validate_first {
            let violations = validate(&set, &self.options.validation);
            if !violations.is_empty() {
                return Err(MigrationError::ValidationFailed(violations));
            }
        }

        let mut pending: Vec<&ResolvedMigration> = set
            .pending()
            .into_iter()
            .filter_map(|i| i.resolved())
            .collect();
        if !self.options.group || self.options.target == TargetVersion::Next {
            pending.truncate(1);
        }
        self.apply(&pending).await
    }

    async fn apply(&self, batch: &[&ResolvedMigration]) -> MigrateResult<Vec<MigrationExecution>> {
        let Some(first) = batch.first() else {
            return Ok(Vec::new());
        };
        let blocking = batch
            .iter()
            .find(|m| !m.executor().can_execute_in_transaction());
        if self.connection.dialect().supports_ddl_transactions && blocking.is_none() {
            return self.apply_in_transaction(batch).await;
        }
        if batch.len() > 1 {
            let reason = match blocking {
                Some(m) => format!("{} cannot run in a transaction", m.script),
                None => format!(
                    "{} does not support transactional DDL",
                    self.connection.dialect().name
                ),
            };
            return Err(MigrationError::precondition(format!(
                "group mode needs every pending migration in one transaction, but {}",
                reason
            )));
        }
        self.apply_outside_transaction(first).await.map(|e| vec![e])
    }

    /// Run `batch` and record its rows in one transaction.
    async fn apply_in_transaction(
        &self,
        batch: &[&ResolvedMigration],
    ) -> MigrateResult<Vec<MigrationExecution>> {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;
        loop {
            self.connection.begin().await?;
            let outcome = match self.run_unit(batch).await {
                Ok(executions) => self
                    .connection
                    .commit()
                    .await
                    .map(|()| executions)
                    .map_err(UnitFailure::Record),
                Err(failure) => Err(failure),
            };

            match outcome {
                Ok(executions) => return Ok(executions),
                Err(UnitFailure::Migration {
                    migration,
                    execution_time,
                    error,
                }) => {
                    self.rollback().await;
                    return Err(self.record_failure(migration, execution_time, error).await);
                }
                Err(UnitFailure::Record(err)) => {
                    self.rollback().await;
                    match self.retry.classify(&err) {
                        Disposition::Fatal => return Err(err),
                        Disposition::Retryable if attempt >= max_attempts => {
                            return Err(MigrationError::RetriesExhausted {
                                operation: "record migration".to_string(),
                                attempts: attempt,
                                last: Box::new(err),
                            });
                        }
                        Disposition::Retryable => {
                            debug!(
                                attempt,
                                error = %err,
                                "Migration rolled back after transient conflict, retrying"
                            );
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }

    async fn run_unit<'m>(
        &self,
        batch: &[&'m ResolvedMigration],
    ) -> Result<Vec<MigrationExecution>, UnitFailure<'m>> {
        let mut executions = Vec::with_capacity(batch.len());
        for &migration in batch {
            let (outcome, execution_time) = self.execute(migration).await;
            if let Err(error) = outcome {
                return Err(UnitFailure::Migration {
                    migration,
                    execution_time,
                    error,
                });
            }
            let stored = self
                .history
                .append(self.row(migration, execution_time, true))
                .await
                .map_err(UnitFailure::Record)?;
            executions.push(MigrationExecution::from_row(&stored));
        }
        Ok(executions)
    }

    /// Run a migration that cannot share a transaction with its record.
    ///
    /// The effect is permanent before the row is written. Should recording
    /// fail for good, the migration stays unrecorded.
    async fn apply_outside_transaction(
        &self,
        migration: &ResolvedMigration,
    ) -> MigrateResult<MigrationExecution> {
        let (outcome, execution_time) = self.execute(migration).await;
        if let Err(error) = outcome {
            return Err(self.record_failure(migration, execution_time, error).await);
        }
        let row = self.row(migration, execution_time, true);
        let stored = self
            .retry
            .run("record migration", || self.history.append(row.clone()))
            .await?;
        Ok(MigrationExecution::from_row(&stored))
    }

    /// Run one migration with its callbacks. Returns the outcome and the
    /// milliseconds it took.
    async fn execute(&self, migration: &ResolvedMigration) -> (MigrateResult<()>, i32) {
        match &migration.version {
            Some(version) => info!(
                version = %version,
                description = %migration.description,
                "Migrating schema"
            ),
            None => info!(
                description = %migration.description,
                "Migrating schema with repeatable migration"
            ),
        }

        let context = CallbackContext::new(self.connection).for_migration(migration);
        let started = Instant::now();
        let outcome = async {
            self.callbacks.fire(Event::BeforeEachMigrate, &context).await?;
            migration.executor().execute(self.connection).await?;
            self.callbacks.fire(Event::AfterEachMigrate, &context).await
        }
        .await;
        let execution_time = i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX);
        (outcome, execution_time)
    }

    /// Record a failed migration and turn `error` into `ExecutionFailed`.
    async fn record_failure(
        &self,
        migration: &ResolvedMigration,
        execution_time: i32,
        error: MigrationError,
    ) -> MigrationError {
        let context = CallbackContext::new(self.connection).for_migration(migration);
        self.callbacks
            .fire_quietly(Event::AfterEachMigrateError, &context)
            .await;

        let row = self.row(migration, execution_time, false);
        let stored = match self
            .retry
            .run("record failed migration", || self.history.append(row.clone()))
            .await
        {
            Ok(stored) => stored,
            Err(record_err) => {
                warn!(
                    script = %migration.script,
                    error = %error,
                    "Migration failed and could not be recorded"
                );
                return record_err;
            }
        };
        warn!(
            script = %migration.script,
            installed_rank = stored.installed_rank,
            error = %error,
            "Migration failed"
        );
        MigrationError::ExecutionFailed {
            script: migration.script.clone(),
            version: migration.version.as_ref().map(|v| v.to_string()),
            installed_rank: stored.installed_rank,
            message: error.to_string(),
        }
    }

    fn row(
        &self,
        migration: &ResolvedMigration,
        execution_time: i32,
        success: bool,
    ) -> NewAppliedMigration {
        NewAppliedMigration {
            version: migration.version.clone(),
            description: migration.description.clone(),
            migration_type: migration.migration_type,
            script: migration.script.clone(),
            checksum: migration.checksum,
            installed_by: self.options.installed_by.clone(),
            execution_time,
            success,
        }
    }

    async fn rollback(&self) {
        if let Err(err) = self.connection.rollback().await {
            warn!(error = %err, "Rollback failed");
        }
    }
}

fn collect_warnings(set: &MigrationInfoSet, options: &MigrateOptions) -> Vec<String> {
    let mut warnings = Vec::new();
    if options.out_of_order {
        warnings.push(
            "out_of_order mode is active. Migration of schema may not be reproducible.".to_string(),
        );
    }
    if let Some(future) = set.future().last() {
        let latest = set
            .context()
            .last_resolved
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "<none>".to_string());
        warnings.push(format!(
            "Schema history has version {}, but the latest resolved migration is {}",
            future
                .version()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            latest
        ));
    }
    warnings
}
