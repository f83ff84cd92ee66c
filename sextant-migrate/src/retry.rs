//! Bounded retries for transient store conflicts.
//!
//! Serialization failures and deadlocks are the one class of database error
//! the engine expects. [`RetryPolicy::classify`] decides whether an error is
//! one of them; [`RetryPolicy::run`] re-runs an operation while it keeps
//! failing that way, up to a fixed number of attempts.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dialect::Dialect;
use crate::error::{MigrateResult, MigrationError};

/// Outcome of classifying an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Run the operation again.
    Retryable,
    /// Give up and surface the error.
    Fatal,
}

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Codes treated as transient in addition to the dialect's own.
    pub transient_codes: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            transient_codes: Vec::new(),
        }
    }
}

/// Classifies errors and drives the retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    dialect: Dialect,
    settings: RetrySettings,
}

impl RetryPolicy {
    /// Create a policy for a dialect.
    pub fn new(dialect: Dialect, settings: RetrySettings) -> Self {
        Self { dialect, settings }
    }

    /// Maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.settings.max_attempts.max(1)
    }

    /// Decide whether `err` is worth another attempt.
    pub fn classify(&self, err: &MigrationError) -> Disposition {
        match err.code() {
            Some(code)
                if self.dialect.is_transient(code)
                    || self.settings.transient_codes.iter().any(|c| c == code) =>
            {
                Disposition::Retryable
            }
            _ => Disposition::Fatal,
        }
    }

    /// Run `op` until it succeeds, fails fatally, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> MigrateResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MigrateResult<T>>,
    {
        let max = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.classify(&err) {
                    Disposition::Fatal => return Err(err),
                    Disposition::Retryable if attempt >= max => {
                        return Err(MigrationError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }
                    Disposition::Retryable => {
                        debug!(
                            operation,
                            attempt,
                            error = %err,
                            "Retrying after transient conflict"
                        );
                        attempt += 1;
                    }
                },
            }
        }
    }
}
