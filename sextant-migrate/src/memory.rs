//! In-memory schema history and connection.
//!
//! Both types are cheap to clone and share their state, so two migrators can
//! point at the same history to exercise the lock protocol. A connection bound
//! to a history with [`MemoryConnection::with_history`] rolls history rows back
//! together with statements, the way a database sharing one connection does.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::connection::MigrationConnection;
use crate::dialect::Dialect;
use crate::error::{MigrateResult, MigrationError};
use crate::history::{
    AppliedMigration, LOCK_DESCRIPTION, LOCK_RANK, NewAppliedMigration, RowUpdate, SchemaHistory,
    max_rank,
};
use crate::migration::MigrationType;

#[derive(Debug, Default)]
struct HistoryState {
    exists: bool,
    rows: Vec<AppliedMigration>,
    transient_failures: u32,
}

/// A schema history held in memory.
#[derive(Debug, Clone)]
pub struct InMemorySchemaHistory {
    table: String,
    state: Arc<Mutex<HistoryState>>,
}

impl Default for InMemorySchemaHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySchemaHistory {
    /// Create an empty history whose table does not exist yet.
    pub fn new() -> Self {
        Self::with_table("sextant_schema_history")
    }

    /// Create an empty history with a custom table name.
    pub fn with_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            state: Arc::new(Mutex::new(HistoryState::default())),
        }
    }

    /// Make the next `count` appends fail with a serialization conflict.
    pub fn inject_transient_failures(&self, count: u32) {
        self.state.lock().transient_failures = count;
    }

    /// Rows other than the lock row, ordered by rank.
    pub fn rows(&self) -> Vec<AppliedMigration> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state.rows.iter().filter(|r| !r.is_lock()).cloned().collect();
        rows.sort_by_key(|r| r.installed_rank);
        rows
    }

    /// Whether a lock row is present.
    pub fn is_locked(&self) -> bool {
        self.state.lock().rows.iter().any(|r| r.is_lock())
    }

    /// Rows other than the lock row, as they are now.
    fn snapshot(&self) -> Vec<AppliedMigration> {
        self.state.lock().rows.iter().filter(|r| !r.is_lock()).cloned().collect()
    }

    /// Put back rows taken by [`Self::snapshot`]. The lock row is left as is.
    fn restore(&self, rows: Vec<AppliedMigration>) {
        let mut state = self.state.lock();
        state.rows.retain(|r| r.is_lock());
        state.rows.extend(rows);
    }

    fn missing_table(&self) -> MigrationError {
        MigrationError::database(format!("table {} does not exist", self.table))
    }
}

#[async_trait]
impl SchemaHistory for InMemorySchemaHistory {
    fn table(&self) -> &str {
        &self.table
    }

    async fn exists(&self) -> MigrateResult<bool> {
        Ok(self.state.lock().exists)
    }

    async fn create_if_missing(&self) -> MigrateResult<()> {
        self.state.lock().exists = true;
        Ok(())
    }

    async fn read(&self) -> MigrateResult<Vec<AppliedMigration>> {
        let state = self.state.lock();
        let mut rows = state.rows.clone();
        rows.sort_by_key(|r| r.installed_rank);
        Ok(rows)
    }

    async fn append(&self, row: NewAppliedMigration) -> MigrateResult<AppliedMigration> {
        let mut state = self.state.lock();
        if !state.exists {
            return Err(self.missing_table());
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(MigrationError::database_with_code(
                "could not serialize access due to concurrent update",
                "40001",
            ));
        }
        let stored = AppliedMigration {
            installed_rank: max_rank(&state.rows) + 1,
            version: row.version,
            description: row.description,
            migration_type: row.migration_type,
            script: row.script,
            checksum: row.checksum,
            installed_by: row.installed_by,
            installed_on: Utc::now(),
            execution_time: row.execution_time,
            success: row.success,
        };
        state.rows.push(stored.clone());
        Ok(stored)
    }

    async fn remove_failed(&self) -> MigrateResult<usize> {
        let mut state = self.state.lock();
        let before = state.rows.len();
        state.rows.retain(|r| r.success || r.is_lock());
        Ok(before - state.rows.len())
    }

    async fn update_row(&self, installed_rank: i32, update: RowUpdate) -> MigrateResult<()> {
        let mut state = self.state.lock();
        let row = state
            .rows
            .iter_mut()
            .find(|r| r.installed_rank == installed_rank)
            .ok_or_else(|| {
                MigrationError::database(format!(
                    "no history row with installed_rank {}",
                    installed_rank
                ))
            })?;
        row.description = update.description;
        row.migration_type = update.migration_type;
        row.checksum = update.checksum;
        Ok(())
    }

    async fn try_insert_lock(&self, owner: &str, now: DateTime<Utc>) -> MigrateResult<bool> {
        let mut state = self.state.lock();
        if !state.exists {
            return Err(self.missing_table());
        }
        if state.rows.iter().any(|r| r.is_lock()) {
            return Ok(false);
        }
        state.rows.push(AppliedMigration {
            installed_rank: LOCK_RANK,
            version: None,
            description: LOCK_DESCRIPTION.to_string(),
            migration_type: MigrationType::Lock,
            script: owner.to_string(),
            checksum: None,
            installed_by: String::new(),
            installed_on: now,
            execution_time: 0,
            success: true,
        });
        Ok(true)
    }

    async fn touch_lock(&self, owner: &str, now: DateTime<Utc>) -> MigrateResult<bool> {
        let mut state = self.state.lock();
        match state.rows.iter_mut().find(|r| r.is_lock() && r.script == owner) {
            Some(row) => {
                row.installed_on = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_expired_lock(&self, older_than: DateTime<Utc>) -> MigrateResult<bool> {
        let mut state = self.state.lock();
        let before = state.rows.len();
        state.rows.retain(|r| !(r.is_lock() && r.installed_on < older_than));
        Ok(state.rows.len() != before)
    }

    async fn delete_lock(&self, owner: &str) -> MigrateResult<()> {
        self.state
            .lock()
            .rows
            .retain(|r| !(r.is_lock() && r.script == owner));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Transaction {
    statements: Vec<String>,
    history: Option<Vec<AppliedMigration>>,
}

#[derive(Debug, Default)]
struct ConnectionState {
    executed: Vec<String>,
    transaction: Option<Transaction>,
    fail_on: Vec<String>,
    commits: u32,
    rollbacks: u32,
}

/// A connection that records statements instead of running them.
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    product: String,
    history: Option<InMemorySchemaHistory>,
    state: Arc<Mutex<ConnectionState>>,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnection {
    /// Create a connection with the generic dialect.
    pub fn new() -> Self {
        Self::with_product(Dialect::GENERIC.name)
    }

    /// Create a connection reporting the given dialect.
    pub fn with_dialect(dialect: Dialect) -> Self {
        Self::with_product(dialect.name)
    }

    /// Create a connection reporting a product name such as `PostgreSQL 16.2`.
    pub fn with_product(product: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            history: None,
            state: Arc::new(Mutex::new(ConnectionState::default())),
        }
    }

    /// Make transactions cover `history` as well: rows appended while a
    /// transaction is open disappear again on rollback.
    pub fn with_history(mut self, history: InMemorySchemaHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Fail every batch containing `fragment`.
    pub fn fail_on(self, fragment: impl Into<String>) -> Self {
        self.state.lock().fail_on.push(fragment.into());
        self
    }

    /// Stop failing batches.
    pub fn clear_failures(&self) {
        self.state.lock().fail_on.clear();
    }

    /// Statements that ran outside a transaction or were committed.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// Number of commits.
    pub fn commits(&self) -> u32 {
        self.state.lock().commits
    }

    /// Number of rollbacks.
    pub fn rollbacks(&self) -> u32 {
        self.state.lock().rollbacks
    }
}

#[async_trait]
impl MigrationConnection for MemoryConnection {
    fn product_name(&self) -> &str {
        &self.product
    }

    async fn current_schema(&self) -> MigrateResult<Option<String>> {
        Ok(self.dialect().default_schema.map(str::to_string))
    }

    async fn execute_batch(&self, sql: &str) -> MigrateResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(fragment) = state.fail_on.iter().find(|f| sql.contains(f.as_str())) {
            return Err(MigrationError::database_with_code(
                format!("statement rejected: {}", fragment),
                "42000",
            ));
        }
        match state.transaction.as_mut() {
            Some(transaction) => transaction.statements.push(sql.to_string()),
            None => state.executed.push(sql.to_string()),
        }
        Ok(())
    }

    async fn begin(&self) -> MigrateResult<()> {
        let mut state = self.state.lock();
        if state.transaction.is_some() {
            return Err(MigrationError::database("transaction already open"));
        }
        state.transaction = Some(Transaction {
            statements: Vec::new(),
            history: self.history.as_ref().map(InMemorySchemaHistory::snapshot),
        });
        Ok(())
    }

    async fn commit(&self) -> MigrateResult<()> {
        let mut state = self.state.lock();
        let transaction = state
            .transaction
            .take()
            .ok_or_else(|| MigrationError::database("no transaction open"))?;
        state.executed.extend(transaction.statements);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self) -> MigrateResult<()> {
        let mut state = self.state.lock();
        let transaction = state.transaction.take();
        state.rollbacks += 1;
        if let (Some(history), Some(rows)) =
            (&self.history, transaction.and_then(|t| t.history))
        {
            history.restore(rows);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::MigrationVersion;

    fn new_row(version: &str, success: bool) -> NewAppliedMigration {
        NewAppliedMigration {
            version: Some(MigrationVersion::parse(version).unwrap()),
            description: "d".to_string(),
            migration_type: MigrationType::Sql,
            script: format!("V{}__d.sql", version),
            checksum: Some(1),
            installed_by: "test".to_string(),
            execution_time: 3,
            success,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_ranks() {
        let history = InMemorySchemaHistory::new();
        assert!(history.append(new_row("1", true)).await.is_err());

        history.create_if_missing().await.unwrap();
        history.try_insert_lock("me", Utc::now()).await.unwrap();
        let a = history.append(new_row("1", true)).await.unwrap();
        let b = history.append(new_row("2", true)).await.unwrap();
        assert_eq!((a.installed_rank, b.installed_rank), (1, 2));
        assert_eq!(history.rows().len(), 2);
        assert_eq!(history.read().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_remove_failed_keeps_lock() {
        let history = InMemorySchemaHistory::new();
        history.create_if_missing().await.unwrap();
        history.append(new_row("1", true)).await.unwrap();
        history.append(new_row("2", false)).await.unwrap();
        history.try_insert_lock("me", Utc::now()).await.unwrap();

        assert_eq!(history.remove_failed().await.unwrap(), 1);
        assert!(history.is_locked());
        assert_eq!(history.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_row_protocol() {
        let history = InMemorySchemaHistory::new();
        history.create_if_missing().await.unwrap();
        let now = Utc::now();

        assert!(history.try_insert_lock("a", now).await.unwrap());
        assert!(!history.try_insert_lock("b", now).await.unwrap());
        assert!(history.touch_lock("a", now).await.unwrap());
        assert!(!history.touch_lock("b", now).await.unwrap());
        assert!(!history.delete_expired_lock(now).await.unwrap());
        assert!(
            history
                .delete_expired_lock(now + chrono::Duration::seconds(1))
                .await
                .unwrap()
        );
        assert!(!history.is_locked());
    }

    #[tokio::test]
    async fn test_transient_failure_injection() {
        let history = InMemorySchemaHistory::new();
        history.create_if_missing().await.unwrap();
        history.inject_transient_failures(1);
        let err = history.append(new_row("1", true)).await.unwrap_err();
        assert_eq!(err.code(), Some("40001"));
        assert!(history.append(new_row("1", true)).await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_transactions() {
        let conn = MemoryConnection::new().fail_on("BOOM");
        conn.begin().await.unwrap();
        conn.execute_batch("CREATE TABLE a ()").await.unwrap();
        conn.rollback().await.unwrap();
        assert!(conn.executed().is_empty());

        conn.begin().await.unwrap();
        conn.execute_batch("CREATE TABLE b ()").await.unwrap();
        conn.commit().await.unwrap();
        assert_eq!(conn.executed(), vec!["CREATE TABLE b ()".to_string()]);

        assert!(conn.execute_batch("SELECT BOOM").await.is_err());
        assert_eq!((conn.commits(), conn.rollbacks()), (1, 1));
    }

    #[tokio::test]
    async fn test_rollback_discards_history_rows() {
        let history = InMemorySchemaHistory::new();
        history.create_if_missing().await.unwrap();
        history.append(new_row("1", true)).await.unwrap();
        let conn = MemoryConnection::new().with_history(history.clone());

        conn.begin().await.unwrap();
        history.append(new_row("2", true)).await.unwrap();
        history.try_insert_lock("me", Utc::now()).await.unwrap();
        conn.rollback().await.unwrap();
        assert_eq!(history.rows().len(), 1);
        assert!(history.is_locked());

        conn.begin().await.unwrap();
        history.append(new_row("2", true)).await.unwrap();
        conn.commit().await.unwrap();
        assert_eq!(history.rows().len(), 2);
    }

    #[test]
    fn test_dialect_follows_product_name() {
        assert_eq!(MemoryConnection::new().dialect(), Dialect::GENERIC);
        assert_eq!(
            MemoryConnection::with_product("PostgreSQL 16.2").dialect(),
            Dialect::POSTGRES
        );
        assert_eq!(
            MemoryConnection::with_dialect(Dialect::SQL_SERVER).dialect(),
            Dialect::SQL_SERVER
        );
        assert_eq!(
            MemoryConnection::with_product("Oracle Database 19c").dialect(),
            Dialect::GENERIC
        );
    }
}
