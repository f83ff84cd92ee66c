//! Resolved migrations and the effects they carry.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::connection::MigrationConnection;
use crate::error::{MigrateResult, MigrationError};
use crate::version::MigrationVersion;

/// Kind of a migration, as resolved or as recorded in the history table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationType {
    /// A SQL script.
    Sql,
    /// A SQL script capturing the whole schema at its version.
    SqlBaseline,
    /// A migration implemented in Rust.
    Code,
    /// Synthetic: the history table created the schema.
    Schema,
    /// Synthetic: everything up to this version is treated as applied.
    Baseline,
    /// Synthetic: the preceding row of the same version was deleted by repair.
    Delete,
    /// The lock row. Never a migration.
    Lock,
}

impl MigrationType {
    /// The value stored in the `type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sql => "SQL",
            Self::SqlBaseline => "SQL_BASELINE",
            Self::Code => "CODE",
            Self::Schema => "SCHEMA",
            Self::Baseline => "BASELINE",
            Self::Delete => "DELETE",
            Self::Lock => "LOCK",
        }
    }

    /// Rows written by the engine itself rather than by running a migration.
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::Schema | Self::Baseline | Self::Delete | Self::Lock)
    }

    /// Resolved scripts that stand for the full schema at their version.
    pub fn is_baseline_migration(&self) -> bool {
        matches!(self, Self::SqlBaseline)
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationType {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SQL" => Ok(Self::Sql),
            "SQL_BASELINE" => Ok(Self::SqlBaseline),
            "CODE" => Ok(Self::Code),
            "SCHEMA" => Ok(Self::Schema),
            "BASELINE" => Ok(Self::Baseline),
            "DELETE" => Ok(Self::Delete),
            "LOCK" => Ok(Self::Lock),
            other => Err(MigrationError::migration_file(format!(
                "unknown migration type '{}'",
                other
            ))),
        }
    }
}

/// The executable effect of a resolved migration.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    /// Run the migration against the connection.
    async fn execute(&self, connection: &dyn MigrationConnection) -> MigrateResult<()>;

    /// Whether the migration may be wrapped in a transaction.
    fn can_execute_in_transaction(&self) -> bool {
        true
    }

    /// Whether the migration should run at all. `false` reports it as ignored.
    fn should_execute(&self) -> bool {
        true
    }
}

/// Runs a SQL script as a single batch.
#[derive(Debug, Clone)]
pub struct SqlScriptExecutor {
    sql: String,
    transactional: bool,
}

impl SqlScriptExecutor {
    /// Create an executor for the given script.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            transactional: true,
        }
    }

    /// Run outside a transaction.
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    /// The script text.
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[async_trait]
impl MigrationExecutor for SqlScriptExecutor {
    async fn execute(&self, connection: &dyn MigrationConnection) -> MigrateResult<()> {
        if self.sql.trim().is_empty() {
            return Ok(());
        }
        connection.execute_batch(&self.sql).await
    }

    fn can_execute_in_transaction(&self) -> bool {
        self.transactional
    }
}

/// A migration discovered by a source.
///
/// Immutable after creation. Cloning shares the executor.
#[derive(Clone)]
pub struct ResolvedMigration {
    /// Version, `None` for repeatable migrations.
    pub version: Option<MigrationVersion>,
    /// Human readable description.
    pub description: String,
    /// Script identifier, e.g. `V1_1__View.sql`.
    pub script: String,
    /// Content hash.
    pub checksum: Option<i32>,
    /// Kind of migration.
    pub migration_type: MigrationType,
    /// Where the migration came from, for error messages.
    pub physical_location: String,
    executor: Arc<dyn MigrationExecutor>,
}

impl ResolvedMigration {
    /// Create a versioned migration.
    pub fn versioned(
        version: MigrationVersion,
        description: impl Into<String>,
        script: impl Into<String>,
        executor: Arc<dyn MigrationExecutor>,
    ) -> Self {
        let script = script.into();
        Self {
            version: Some(version),
            description: description.into(),
            physical_location: script.clone(),
            script,
            checksum: None,
            migration_type: MigrationType::Sql,
            executor,
        }
    }

    /// Create a repeatable migration.
    pub fn repeatable(
        description: impl Into<String>,
        script: impl Into<String>,
        executor: Arc<dyn MigrationExecutor>,
    ) -> Self {
        let script = script.into();
        Self {
            version: None,
            description: description.into(),
            physical_location: script.clone(),
            script,
            checksum: None,
            migration_type: MigrationType::Sql,
            executor,
        }
    }

    /// Set the checksum.
    pub fn with_checksum(mut self, checksum: impl Into<Option<i32>>) -> Self {
        self.checksum = checksum.into();
        self
    }

    /// Set the migration type.
    pub fn with_type(mut self, migration_type: MigrationType) -> Self {
        self.migration_type = migration_type;
        self
    }

    /// Set the physical location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.physical_location = location.into();
        self
    }

    /// The executable effect.
    pub fn executor(&self) -> &dyn MigrationExecutor {
        self.executor.as_ref()
    }

    /// Whether this migration has no version.
    pub fn is_repeatable(&self) -> bool {
        self.version.is_none()
    }

    /// Null-safe checksum comparison against a recorded checksum.
    pub fn checksum_matches(&self, recorded: Option<i32>) -> bool {
        self.checksum == recorded
    }

    /// Same version, description, script, checksum and type.
    pub fn same_definition(&self, other: &ResolvedMigration) -> bool {
        self.version == other.version
            && self.description == other.description
            && self.script == other.script
            && self.checksum == other.checksum
            && self.migration_type == other.migration_type
    }

    /// Versioned migrations by version, then repeatables by description.
    pub fn ordering(&self, other: &ResolvedMigration) -> Ordering {
        match (&self.version, &other.version) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.description.cmp(&other.description),
        }
    }

    /// `V1.1` for versioned migrations, the description for repeatables.
    pub fn label(&self) -> String {
        match &self.version {
            Some(v) => format!("V{}", v),
            None => format!("R {}", self.description),
        }
    }
}

impl fmt::Debug for ResolvedMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedMigration")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("script", &self.script)
            .field("checksum", &self.checksum)
            .field("migration_type", &self.migration_type)
            .field("physical_location", &self.physical_location)
            .finish_non_exhaustive()
    }
}

/// Compute the checksum of migration content.
///
/// Line endings are normalised and a leading byte order mark is ignored, so
/// the same script checked out on different platforms hashes identically.
pub fn compute_checksum(content: &[u8]) -> i32 {
    let content = content.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(content);

    let mut hasher = Sha256::new();
    let mut i = 0;
    while i < content.len() {
        match content[i] {
            b'\r' => {
                hasher.update(b"\n");
                if content.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
            }
            byte => hasher.update([byte]),
        }
        i += 1;
    }

    let digest = hasher.finalize();
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(version: &str, description: &str) -> ResolvedMigration {
        ResolvedMigration::versioned(
            MigrationVersion::parse(version).unwrap(),
            description,
            format!("V{}__{}.sql", version, description),
            Arc::new(SqlScriptExecutor::new("SELECT 1")),
        )
    }

    #[test]
    fn test_type_round_trip_through_column_value() {
        for t in [
            MigrationType::Sql,
            MigrationType::SqlBaseline,
            MigrationType::Code,
            MigrationType::Schema,
            MigrationType::Baseline,
            MigrationType::Delete,
            MigrationType::Lock,
        ] {
            assert_eq!(t.as_str().parse::<MigrationType>().unwrap(), t);
        }
        assert!("JDBC".parse::<MigrationType>().is_err());
    }

    #[test]
    fn test_synthetic_types() {
        assert!(MigrationType::Baseline.is_synthetic());
        assert!(MigrationType::Delete.is_synthetic());
        assert!(!MigrationType::Sql.is_synthetic());
        assert!(!MigrationType::SqlBaseline.is_synthetic());
    }

    #[test]
    fn test_compute_checksum() {
        let a = compute_checksum(b"CREATE TABLE users();");
        let b = compute_checksum(b"CREATE TABLE users();");
        let c = compute_checksum(b"DROP TABLE users;");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_checksum_ignores_line_endings_and_bom() {
        let unix = compute_checksum(b"SELECT 1;\nSELECT 2;\n");
        let windows = compute_checksum(b"SELECT 1;\r\nSELECT 2;\r\n");
        let bom = compute_checksum(b"\xEF\xBB\xBFSELECT 1;\nSELECT 2;\n");
        assert_eq!(unix, windows);
        assert_eq!(unix, bom);
    }

    #[test]
    fn test_ordering_puts_repeatables_last() {
        let repeatable = ResolvedMigration::repeatable(
            "A view",
            "R__A_view.sql",
            Arc::new(SqlScriptExecutor::new("SELECT 1")),
        );
        assert_eq!(sql("1", "x").ordering(&sql("1.1", "y")), Ordering::Less);
        assert_eq!(sql("99", "x").ordering(&repeatable), Ordering::Less);
        assert_eq!(repeatable.ordering(&sql("1", "x")), Ordering::Greater);
    }

    #[test]
    fn test_same_definition_ignores_location() {
        let a = sql("1", "First").with_checksum(7).with_location("a/V1__First.sql");
        let b = sql("1", "First").with_checksum(7).with_location("b/V1__First.sql");
        let c = sql("1", "First").with_checksum(8);
        assert!(a.same_definition(&b));
        assert!(!a.same_definition(&c));
    }

    #[test]
    fn test_checksum_matches_is_null_safe() {
        let m = sql("1", "First");
        assert!(m.checksum_matches(None));
        assert!(!m.checksum_matches(Some(1)));
        assert!(m.with_checksum(1).checksum_matches(Some(1)));
    }
}
