//! Conversions between history rows and SQLite values.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Row;
use sextant_migrate::{AppliedMigration, MigrationType, MigrationVersion};

/// Stored timestamp layout. Fixed width, so text comparison orders by time.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Columns in the order [`FromSqliteRow`] expects them.
pub const HISTORY_COLUMNS: &str = "installed_rank, version, description, type, script, \
    checksum, installed_by, installed_on, execution_time, success";

/// Trait for converting a SQLite row to a Rust type.
pub trait FromSqliteRow: Sized {
    /// Convert a SQLite row to this type.
    fn from_row(row: &Row<'_>) -> Result<Self, FromSqliteRowError>;
}

/// Error type for row deserialization.
#[derive(Debug)]
pub struct FromSqliteRowError {
    /// What went wrong.
    pub message: String,
    /// The column that caused the error, if known.
    pub column: Option<String>,
}

impl FromSqliteRowError {
    /// Create a new error with a column name.
    pub fn with_column(message: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            column: Some(column.into()),
        }
    }
}

impl std::fmt::Display for FromSqliteRowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.column {
            Some(column) => write!(f, "column '{}': {}", column, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for FromSqliteRowError {}

impl From<rusqlite::Error> for FromSqliteRowError {
    fn from(err: rusqlite::Error) -> Self {
        Self {
            message: err.to_string(),
            column: None,
        }
    }
}

impl From<FromSqliteRowError> for tokio_rusqlite::Error {
    fn from(err: FromSqliteRowError) -> Self {
        tokio_rusqlite::Error::Other(Box::new(err))
    }
}

/// Render a timestamp for storage.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

impl FromSqliteRow for AppliedMigration {
    fn from_row(row: &Row<'_>) -> Result<Self, FromSqliteRowError> {
        let version = match row.get::<_, Option<String>>(1)? {
            Some(text) => Some(
                MigrationVersion::parse(&text)
                    .map_err(|e| FromSqliteRowError::with_column(e.to_string(), "version"))?,
            ),
            None => None,
        };
        let type_text: String = row.get(3)?;
        let migration_type: MigrationType =
            type_text.parse().map_err(|e: sextant_migrate::MigrationError| {
                FromSqliteRowError::with_column(e.to_string(), "type")
            })?;
        let installed_on_text: String = row.get(7)?;
        let installed_on = parse_timestamp(&installed_on_text).ok_or_else(|| {
            FromSqliteRowError::with_column(
                format!("unparsable timestamp '{}'", installed_on_text),
                "installed_on",
            )
        })?;

        Ok(AppliedMigration {
            installed_rank: row.get(0)?,
            version,
            description: row.get(2)?,
            migration_type,
            script: row.get(4)?,
            checksum: row.get(5)?,
            installed_by: row.get(6)?,
            installed_on,
            execution_time: row.get(8)?,
            success: row.get(9)?,
        })
    }
}
