//! Error types for the migration engine.

use thiserror::Error;

use crate::validate::ValidationViolation;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation error, with the vendor error code when one is known.
    #[error("Database error: {message}{}", code_suffix(.code))]
    Database {
        /// Driver message.
        message: String,
        /// SQLSTATE or vendor result code.
        code: Option<String>,
    },

    /// A version string could not be parsed.
    #[error("Malformed version '{version}': {reason}")]
    MalformedVersion {
        /// The offending input.
        version: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Invalid migration file or format.
    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    /// Two resolved migrations claim the same version (or repeatable description).
    #[error(
        "Found more than one migration with {key}\nOffenders:\n-> {first}\n-> {second}"
    )]
    ResolutionConflict {
        /// `version 1.2` or `description Refresh views`.
        key: String,
        /// Physical location of the first offender.
        first: String,
        /// Physical location of the second offender.
        second: String,
    },

    /// Validation found inconsistencies between resolved and applied migrations.
    #[error("Validate failed: {}", summarize(.0))]
    ValidationFailed(Vec<ValidationViolation>),

    /// A migration's own effect failed. The failure is recorded in the history.
    #[error("Migration {script} failed (installed_rank {installed_rank}): {message}")]
    ExecutionFailed {
        /// Script identifier of the failed migration.
        script: String,
        /// Version of the failed migration, `None` for repeatables.
        version: Option<String>,
        /// Rank of the history row recording the failure.
        installed_rank: i32,
        /// Cause reported by the executor.
        message: String,
    },

    /// The history contains a failed migration that must be repaired first.
    #[error(
        "Schema history contains a failed migration {0}. Remove any half-completed changes then \
         run repair."
    )]
    FailedMigrationPresent(String),

    /// A transient conflict persisted beyond the retry bound.
    #[error("{operation} still conflicting after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// The retried operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last transient error.
        last: Box<MigrationError>,
    },

    /// A lifecycle callback returned an error.
    #[error("Callback {callback} failed on {event}: {cause}")]
    CallbackFailed {
        /// Event being handled, e.g. `beforeMigrate`.
        event: String,
        /// Name of the failing callback.
        callback: String,
        /// What the callback reported.
        cause: Box<MigrationError>,
    },

    /// Lock acquisition failed.
    #[error("Failed to acquire migration lock: {0}")]
    LockFailed(String),

    /// A baseline or repair precondition does not hold. Nothing was written.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The history table is internally inconsistent.
    #[error("Corrupted schema history: {0}")]
    CorruptedHistory(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// General migration error.
    #[error("Migration error: {0}")]
    Other(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref()
        .map(|c| format!(" (code {})", c))
        .unwrap_or_default()
}

fn summarize(violations: &[ValidationViolation]) -> String {
    match violations {
        [] => "no violations".to_string(),
        [only] => only.message.clone(),
        [first, rest @ ..] => format!("{} (and {} more)", first.message, rest.len()),
    }
}

impl MigrationError {
    /// Create a database error without a vendor code.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database {
            message: msg.into(),
            code: None,
        }
    }

    /// Create a database error carrying a vendor code.
    pub fn database_with_code(msg: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Database {
            message: msg.into(),
            code: Some(code.into()),
        }
    }

    /// Create a malformed version error.
    pub fn malformed_version(version: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedVersion {
            version: version.into(),
            reason: reason.into(),
        }
    }

    /// Create a lock failed error.
    pub fn lock_failed(msg: impl Into<String>) -> Self {
        Self::LockFailed(msg.into())
    }

    /// Create a precondition error.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a migration file error.
    pub fn migration_file(msg: impl Into<String>) -> Self {
        Self::InvalidMigration(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// The vendor error code, if this is a database error that carries one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// The violations behind a validation failure.
    pub fn violations(&self) -> &[ValidationViolation] {
        match self {
            Self::ValidationFailed(v) => v,
            _ => &[],
        }
    }
}
