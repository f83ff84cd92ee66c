//! The connection migrations run against.

use async_trait::async_trait;

use crate::dialect::{Dialect, DialectRegistry};
use crate::error::MigrateResult;

/// A connection capable of running statements and transactions.
///
/// Executors receive this as `&dyn MigrationConnection`; backends implement it
/// on top of their driver.
#[async_trait]
pub trait MigrationConnection: Send + Sync {
    /// Product name reported by the driver, e.g. `PostgreSQL 16.2`.
    fn product_name(&self) -> &str;

    /// Capabilities of the product behind this connection.
    ///
    /// Looked up in the built-in [`DialectRegistry`] by product name. Products
    /// it does not know get [`Dialect::GENERIC`].
    fn dialect(&self) -> Dialect {
        DialectRegistry::builtin()
            .detect(self.product_name())
            .unwrap_or(Dialect::GENERIC)
    }

    /// The schema statements run in by default.
    async fn current_schema(&self) -> MigrateResult<Option<String>>;

    /// Execute one or more statements.
    async fn execute_batch(&self, sql: &str) -> MigrateResult<()>;

    /// Open a transaction.
    async fn begin(&self) -> MigrateResult<()>;

    /// Commit the open transaction.
    async fn commit(&self) -> MigrateResult<()>;

    /// Roll back the open transaction.
    async fn rollback(&self) -> MigrateResult<()>;
}
