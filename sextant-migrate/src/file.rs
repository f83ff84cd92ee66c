//! SQL migration files on disk.
//!
//! Scripts follow the naming convention
//!
//! - `V<version>__<description>.sql` versioned
//! - `B<version>__<description>.sql` baseline script for a version
//! - `R__<description>.sql` repeatable
//!
//! Underscores in the description are shown as spaces. A sidecar file named
//! `<script>.conf` may set `executeInTransaction=false`. Scripts named after a
//! callback event, like `afterMigrate__Grants.sql`, are callbacks instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::callback::{Event, SqlCallback};
use crate::error::{MigrateResult, MigrationError};
use crate::migration::{MigrationType, ResolvedMigration, SqlScriptExecutor, compute_checksum};
use crate::source::MigrationSource;
use crate::version::MigrationVersion;

const SQL_SUFFIX: &str = ".sql";
const CONF_SUFFIX: &str = ".conf";
const SEPARATOR: &str = "__";

/// The parts of a migration file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptName {
    /// Version, `None` for repeatables.
    pub version: Option<MigrationVersion>,
    /// Description with underscores replaced by spaces.
    pub description: String,
    /// `Sql` or `SqlBaseline`.
    pub migration_type: MigrationType,
}

/// Parse a file name such as `V1_1__Create_view.sql`.
///
/// Returns `Ok(None)` for files that are not migrations at all.
pub fn parse_script_name(file_name: &str) -> MigrateResult<Option<ScriptName>> {
    let Some(stem) = file_name.strip_suffix(SQL_SUFFIX) else {
        return Ok(None);
    };

    let (prefix, rest) = match stem.chars().next() {
        Some(c @ ('V' | 'B' | 'R')) => (c, &stem[1..]),
        _ => return Ok(None),
    };

    let Some((version_part, description_part)) = rest.split_once(SEPARATOR) else {
        warn!(
            file = file_name,
            "Skipping file without '{}' between version and description", SEPARATOR
        );
        return Ok(None);
    };

    let description = description_part.replace('_', " ").trim().to_string();

    match prefix {
        'R' => {
            if !version_part.is_empty() {
                return Err(MigrationError::migration_file(format!(
                    "repeatable migration '{}' must not have a version",
                    file_name
                )));
            }
            Ok(Some(ScriptName {
                version: None,
                description,
                migration_type: MigrationType::Sql,
            }))
        }
        _ => {
            let version = MigrationVersion::parse(version_part)?;
            let migration_type = if prefix == 'B' {
                MigrationType::SqlBaseline
            } else {
                MigrationType::Sql
            };
            Ok(Some(ScriptName {
                version: Some(version),
                description,
                migration_type,
            }))
        }
    }
}

/// Per-script settings from a sidecar `.conf` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSettings {
    /// Whether the script may run inside a transaction.
    pub execute_in_transaction: bool,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            execute_in_transaction: true,
        }
    }
}

/// Parse `key=value` lines of a sidecar file.
pub fn parse_script_settings(content: &str) -> MigrateResult<ScriptSettings> {
    let mut settings = ScriptSettings::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            MigrationError::migration_file(format!("malformed script setting '{}'", line))
        })?;
        match key.trim() {
            "executeInTransaction" => {
                settings.execute_in_transaction =
                    value.trim().parse::<bool>().map_err(|_| {
                        MigrationError::migration_file(format!(
                            "executeInTransaction must be true or false, got '{}'",
                            value.trim()
                        ))
                    })?;
            }
            other => {
                return Err(MigrationError::migration_file(format!(
                    "unknown script setting '{}'",
                    other
                )));
            }
        }
    }
    Ok(settings)
}

/// Resolves SQL scripts from one or more directories.
#[derive(Debug, Clone)]
pub struct SqlDirectorySource {
    locations: Vec<PathBuf>,
}

impl SqlDirectorySource {
    /// Create a source scanning a single directory.
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            locations: vec![location.into()],
        }
    }

    /// Create a source scanning several directories.
    pub fn with_locations<I, P>(locations: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            locations: locations.into_iter().map(Into::into).collect(),
        }
    }

    /// The scanned directories.
    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    /// SQL callbacks in the locations, in file name order per location.
    pub async fn callbacks(&self) -> MigrateResult<Vec<SqlCallback>> {
        let mut callbacks = Vec::new();
        for root in &self.locations {
            if !tokio::fs::try_exists(root).await? {
                continue;
            }
            for path in self.scan(root).await? {
                let Some(stem) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_suffix(SQL_SUFFIX))
                else {
                    continue;
                };
                let event_name = stem.split_once(SEPARATOR).map_or(stem, |(event, _)| event);
                let Some(event) = Event::from_name(event_name) else {
                    continue;
                };
                let sql = tokio::fs::read_to_string(&path).await?;
                let sql = sql.strip_prefix('\u{feff}').unwrap_or(&sql).to_string();
                let name = script_path(root, &path);
                debug!(event = %event, script = %name, "Found SQL callback");
                callbacks.push(SqlCallback::new(event, name, sql));
            }
        }
        Ok(callbacks)
    }

    async fn scan(&self, root: &Path) -> MigrateResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(SQL_SUFFIX))
                {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn load(&self, root: &Path, path: &Path) -> MigrateResult<Option<ResolvedMigration>> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MigrationError::migration_file("invalid path"))?;

        let Some(name) = parse_script_name(file_name)? else {
            debug!(path = %path.display(), "Skipping non-migration file");
            return Ok(None);
        };

        let content = tokio::fs::read(path).await?;
        let checksum = compute_checksum(&content);
        let sql = String::from_utf8(content).map_err(|_| {
            MigrationError::migration_file(format!("{} is not valid UTF-8", path.display()))
        })?;
        let sql = sql.strip_prefix('\u{feff}').unwrap_or(&sql).to_string();

        let mut conf = path.as_os_str().to_owned();
        conf.push(CONF_SUFFIX);
        let conf = PathBuf::from(conf);
        let settings = if tokio::fs::try_exists(&conf).await? {
            parse_script_settings(&tokio::fs::read_to_string(&conf).await?)?
        } else {
            ScriptSettings::default()
        };

        let mut executor = SqlScriptExecutor::new(sql);
        if !settings.execute_in_transaction {
            executor = executor.non_transactional();
        }

        let script = script_path(root, path);
        let executor = Arc::new(executor);
        let resolved = match name.version {
            Some(version) => {
                ResolvedMigration::versioned(version, name.description, script, executor)
            }
            None => ResolvedMigration::repeatable(name.description, script, executor),
        };

        Ok(Some(
            resolved
                .with_checksum(checksum)
                .with_type(name.migration_type)
                .with_location(path.display().to_string()),
        ))
    }
}

/// `path` relative to `root`, with `/` separators.
fn script_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl MigrationSource for SqlDirectorySource {
    fn name(&self) -> &str {
        "sql"
    }

    async fn resolve(&self) -> MigrateResult<Vec<ResolvedMigration>> {
        let mut resolved = Vec::new();
        for root in &self.locations {
            if !tokio::fs::try_exists(root).await? {
                warn!(location = %root.display(), "Skipping missing migration location");
                continue;
            }
            for path in self.scan(root).await? {
                if let Some(migration) = self.load(root, &path).await? {
                    resolved.push(migration);
                }
            }
        }
        debug!(count = resolved.len(), "Resolved SQL migrations");
        Ok(resolved)
    }
}
