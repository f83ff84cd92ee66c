//! Schema history tracking.
//!
//! The schema history table is an append-only ledger of applied migrations.
//! It also hosts the lock row used to serialize concurrent runners.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::error::MigrateResult;
use crate::migration::MigrationType;
use crate::version::MigrationVersion;

/// Rank reserved for the lock row. Real rows always have a positive rank.
pub const LOCK_RANK: i32 = -100;

/// Description written into the lock row.
pub const LOCK_DESCRIPTION: &str = "<< sextant lock >>";

/// A row of the schema history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Position in the ledger, assigned by the store.
    pub installed_rank: i32,
    /// Version, `None` for repeatables and the lock row.
    pub version: Option<MigrationVersion>,
    /// Description.
    pub description: String,
    /// Kind of row.
    pub migration_type: MigrationType,
    /// Script identifier. Holds the owner id for the lock row.
    pub script: String,
    /// Checksum recorded at apply time.
    pub checksum: Option<i32>,
    /// User that applied the migration.
    pub installed_by: String,
    /// When the row was written. Refreshed by heartbeats for the lock row.
    pub installed_on: DateTime<Utc>,
    /// Execution time in milliseconds.
    pub execution_time: i32,
    /// Whether the migration succeeded.
    pub success: bool,
}

impl AppliedMigration {
    /// Whether this is the lock row rather than a ledger entry.
    pub fn is_lock(&self) -> bool {
        self.migration_type == MigrationType::Lock || self.installed_rank == LOCK_RANK
    }

    /// Whether the row was written by the engine rather than by a migration.
    pub fn is_synthetic(&self) -> bool {
        self.migration_type.is_synthetic()
    }

    /// Whether this row records a repeatable migration.
    pub fn is_repeatable(&self) -> bool {
        self.version.is_none() && !self.is_synthetic()
    }
}

/// A row to append. The store assigns rank and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppliedMigration {
    /// Version, `None` for repeatables.
    pub version: Option<MigrationVersion>,
    /// Description.
    pub description: String,
    /// Kind of row.
    pub migration_type: MigrationType,
    /// Script identifier.
    pub script: String,
    /// Checksum of the migration as applied.
    pub checksum: Option<i32>,
    /// User applying the migration.
    pub installed_by: String,
    /// Execution time in milliseconds.
    pub execution_time: i32,
    /// Whether the migration succeeded.
    pub success: bool,
}

/// Fields repair may overwrite in place. Version and rank are never touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    /// New description.
    pub description: String,
    /// New row type.
    pub migration_type: MigrationType,
    /// New checksum.
    pub checksum: Option<i32>,
}

/// Access to the schema history table.
///
/// Implementations must assign `installed_rank` as one more than the highest
/// positive rank present, starting at 1, and must make lock insertion atomic
/// (a second insert while a lock row exists reports `false`).
///
/// A store sharing its connection with migrations makes rows appended while
/// a migration transaction is open commit or roll back with it.
#[async_trait]
pub trait SchemaHistory: Send + Sync {
    /// Name of the underlying table.
    fn table(&self) -> &str;

    /// Whether the table exists.
    async fn exists(&self) -> MigrateResult<bool>;

    /// Create the table unless it already exists.
    async fn create_if_missing(&self) -> MigrateResult<()>;

    /// All rows ordered by rank, including the lock row if one is held.
    /// Returns an empty list when the table does not exist.
    async fn read(&self) -> MigrateResult<Vec<AppliedMigration>>;

    /// Append a row and return it as stored.
    async fn append(&self, row: NewAppliedMigration) -> MigrateResult<AppliedMigration>;

    /// Delete every row with `success = false`. Returns how many were removed.
    async fn remove_failed(&self) -> MigrateResult<usize>;

    /// Overwrite description, type and checksum of one row.
    async fn update_row(&self, installed_rank: i32, update: RowUpdate) -> MigrateResult<()>;

    /// Insert the lock row for `owner`. `false` when another lock row exists.
    async fn try_insert_lock(&self, owner: &str, now: DateTime<Utc>) -> MigrateResult<bool>;

    /// Refresh the lock row's timestamp. `false` when `owner` no longer holds it.
    async fn touch_lock(&self, owner: &str, now: DateTime<Utc>) -> MigrateResult<bool>;

    /// Delete the lock row if it was last touched before `older_than`.
    async fn delete_expired_lock(&self, older_than: DateTime<Utc>) -> MigrateResult<bool>;

    /// Delete the lock row held by `owner`.
    async fn delete_lock(&self, owner: &str) -> MigrateResult<()>;
}

/// DDL for the history table in the given dialect.
pub fn create_table_sql(dialect: &Dialect, schema: Option<&str>, table: &str) -> String {
    let (boolean, timestamp) = match dialect.name {
        "SQL Server" => ("BIT", "DATETIME2"),
        "MySQL" => ("BOOL", "TIMESTAMP(3)"),
        _ => ("BOOLEAN", "TIMESTAMP"),
    };
    let qualified = dialect.quote_table(schema, table);
    let index = dialect.quote(&format!("{}_s_idx", table));
    format!(
        "CREATE TABLE IF NOT EXISTS {qualified} (\n    \
         installed_rank INT NOT NULL PRIMARY KEY,\n    \
         version VARCHAR(50),\n    \
         description VARCHAR(200) NOT NULL,\n    \
         type VARCHAR(20) NOT NULL,\n    \
         script VARCHAR(1000) NOT NULL,\n    \
         checksum INT,\n    \
         installed_by VARCHAR(100) NOT NULL,\n    \
         installed_on {timestamp} NOT NULL,\n    \
         execution_time INT NOT NULL,\n    \
         success {boolean} NOT NULL\n\
         );\n\
         CREATE INDEX IF NOT EXISTS {index} ON {qualified} (success);"
    )
}

/// Highest positive rank in `rows`, 0 when there is none.
pub fn max_rank(rows: &[AppliedMigration]) -> i32 {
    rows.iter()
        .map(|r| r.installed_rank)
        .filter(|rank| *rank > 0)
        .max()
        .unwrap_or(0)
}
