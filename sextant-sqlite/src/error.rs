//! Error types for the SQLite backend.

use std::fmt;

use rusqlite::ErrorCode;
use sextant_migrate::MigrationError;

/// Result type for SQLite operations.
pub type SqliteResult<T> = Result<T, SqliteError>;

/// Error type for SQLite operations.
#[derive(Debug)]
pub enum SqliteError {
    /// SQLite driver error.
    Sqlite(tokio_rusqlite::Error),
    /// Configuration error.
    Config(String),
    /// A stored value could not be converted.
    Conversion(String),
}

impl SqliteError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a conversion error.
    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    /// Name of the SQLite primary result code, e.g. `SQLITE_BUSY`.
    pub fn code(&self) -> Option<String> {
        let Self::Sqlite(tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(err, _))) =
            self
        else {
            return None;
        };
        let name = match err.code {
            ErrorCode::DatabaseBusy => "SQLITE_BUSY",
            ErrorCode::DatabaseLocked => "SQLITE_LOCKED",
            ErrorCode::ConstraintViolation => "SQLITE_CONSTRAINT",
            ErrorCode::ReadOnly => "SQLITE_READONLY",
            ErrorCode::DiskFull => "SQLITE_FULL",
            ErrorCode::CannotOpen => "SQLITE_CANTOPEN",
            ErrorCode::DatabaseCorrupt => "SQLITE_CORRUPT",
            ErrorCode::PermissionDenied => "SQLITE_PERM",
            ErrorCode::SystemIoFailure => "SQLITE_IOERR",
            _ => return Some(format!("SQLITE_{}", err.extended_code & 0xff)),
        };
        Some(name.to_string())
    }
}

impl fmt::Display for SqliteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Conversion(msg) => write!(f, "Conversion error: {}", msg),
        }
    }
}

impl std::error::Error for SqliteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tokio_rusqlite::Error> for SqliteError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        Self::Sqlite(err)
    }
}

impl From<rusqlite::Error> for SqliteError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sqlite(tokio_rusqlite::Error::Rusqlite(err))
    }
}

impl From<SqliteError> for MigrationError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Config(msg) => MigrationError::config(msg),
            other => match other.code() {
                Some(code) => MigrationError::database_with_code(other.to_string(), code),
                None => MigrationError::database(other.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(code: ErrorCode, extended: i32) -> SqliteError {
        SqliteError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code,
                extended_code: extended,
            },
            Some("boom".to_string()),
        ))
    }

    #[test]
    fn test_error_display() {
        let err = SqliteError::config("invalid path");
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("invalid path"));
    }

    #[test]
    fn test_busy_keeps_code() {
        let err: MigrationError = failure(ErrorCode::DatabaseBusy, 5).into();
        assert_eq!(err.code(), Some("SQLITE_BUSY"));
    }

    #[test]
    fn test_constraint_code() {
        assert_eq!(
            failure(ErrorCode::ConstraintViolation, 1555).code().as_deref(),
            Some("SQLITE_CONSTRAINT")
        );
        assert_eq!(SqliteError::conversion("x").code(), None);
    }

    #[test]
    fn test_config_maps_to_config() {
        let err: MigrationError = SqliteError::config("bad url").into();
        assert!(matches!(err, MigrationError::Config(_)));
    }
}
