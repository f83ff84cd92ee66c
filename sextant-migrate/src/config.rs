//! Migrator configuration, loadable from `sextant.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::baseline::DEFAULT_BASELINE_DESCRIPTION;
use crate::error::{MigrateResult, MigrationError};
use crate::lock::LockSettings;
use crate::migrate::MigrateOptions;
use crate::retry::RetrySettings;
use crate::validate::{ValidateOptions, ValidatePattern, ValidationMode};
use crate::version::{MigrationVersion, TargetVersion};

/// Default config file name.
pub const CONFIG_FILE_NAME: &str = "sextant.toml";

/// Default schema history table.
pub const DEFAULT_TABLE: &str = "sextant_schema_history";

/// Configuration for the migrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Schema history table name.
    pub table: String,
    /// Directories scanned for SQL migrations.
    pub locations: Vec<PathBuf>,
    /// How far to migrate.
    pub target: TargetVersion,
    /// Apply pending migrations below the highest applied version.
    pub out_of_order: bool,
    /// Validate before migrating.
    pub validate_on_migrate: bool,
    /// How many violations validation reports.
    pub validation_mode: ValidationMode,
    /// Leave applied migrations newer than anything resolved out of validation.
    pub ignore_future_migrations: bool,
    /// `type:state` patterns validation skips, e.g. `["*:missing"]`.
    pub ignore_migration_patterns: Vec<ValidatePattern>,
    /// Apply all pending migrations in one transaction.
    pub group: bool,
    /// Version written by `baseline`.
    pub baseline_version: MigrationVersion,
    /// Description written by `baseline`.
    pub baseline_description: String,
    /// Value of the `installed_by` column. Falls back to `$USER`.
    pub installed_by: Option<String>,
    /// Lock timing, under `[lock]`.
    pub lock: LockSettings,
    /// Transient conflict handling, under `[retry]`.
    pub retry: RetrySettings,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            locations: vec![PathBuf::from("migrations")],
            target: TargetVersion::Latest,
            out_of_order: false,
            validate_on_migrate: true,
            validation_mode: ValidationMode::All,
            ignore_future_migrations: false,
            ignore_migration_patterns: Vec::new(),
            group: false,
            baseline_version: MigrationVersion::parse("1").unwrap_or(MigrationVersion::EMPTY),
            baseline_description: DEFAULT_BASELINE_DESCRIPTION.to_string(),
            installed_by: None,
            lock: LockSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl MigrationConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            MigrationError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> MigrateResult<Self> {
        toml::from_str(content).map_err(|e| MigrationError::config(e.to_string()))
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> MigrateResult<String> {
        toml::to_string_pretty(self).map_err(|e| MigrationError::config(e.to_string()))
    }

    /// Set the schema history table.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Replace the migration locations.
    pub fn locations<I, P>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.locations = locations.into_iter().map(Into::into).collect();
        self
    }

    /// Set the target.
    pub fn target(mut self, target: TargetVersion) -> Self {
        self.target = target;
        self
    }

    /// Allow out-of-order application.
    pub fn out_of_order(mut self, enabled: bool) -> Self {
        self.out_of_order = enabled;
        self
    }

    /// Validate before migrating.
    pub fn validate_on_migrate(mut self, enabled: bool) -> Self {
        self.validate_on_migrate = enabled;
        self
    }

    /// Set the validation mode.
    pub fn validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    /// Leave future migrations out of validation.
    pub fn ignore_future_migrations(mut self, ignore: bool) -> Self {
        self.ignore_future_migrations = ignore;
        self
    }

    /// Skip entries matching these `type:state` patterns during validation.
    pub fn ignore_migration_patterns(
        mut self,
        patterns: impl IntoIterator<Item = ValidatePattern>,
    ) -> Self {
        self.ignore_migration_patterns = patterns.into_iter().collect();
        self
    }

    /// Apply all pending migrations in one transaction.
    pub fn group(mut self, enabled: bool) -> Self {
        self.group = enabled;
        self
    }

    /// Set the baseline version and description.
    pub fn baseline(mut self, version: MigrationVersion, description: impl Into<String>) -> Self {
        self.baseline_version = version;
        self.baseline_description = description.into();
        self
    }

    /// Set the `installed_by` value.
    pub fn installed_by(mut self, user: impl Into<String>) -> Self {
        self.installed_by = Some(user.into());
        self
    }

    /// Set lock timing.
    pub fn lock_settings(mut self, lock: LockSettings) -> Self {
        self.lock = lock;
        self
    }

    /// Set retry settings.
    pub fn retry_settings(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// The effective `installed_by` value.
    pub fn effective_installed_by(&self) -> String {
        self.installed_by
            .clone()
            .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
            .unwrap_or_else(|| "sextant".to_string())
    }

    /// Validator settings.
    pub fn validate_options(&self) -> ValidateOptions {
        ValidateOptions {
            mode: self.validation_mode,
            ignore_future_migrations: self.ignore_future_migrations,
            ignore_patterns: self.ignore_migration_patterns.clone(),
        }
    }

    /// Migrate settings.
    pub fn migrate_options(&self) -> MigrateOptions {
        MigrateOptions {
            target: self.target.clone(),
            out_of_order: self.out_of_order,
            validate_on_migrate: self.validate_on_migrate,
            validation: self.validate_options(),
            group: self.group,
            installed_by: self.effective_installed_by(),
        }
    }
}
