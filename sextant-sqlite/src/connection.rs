//! SQLite connection migrations run on.

use async_trait::async_trait;
use sextant_migrate::{MigrateResult, MigrationConnection, MigrationError};
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::config::SqliteConfig;
use crate::error::{SqliteError, SqliteResult};
use crate::history::SqliteSchemaHistory;

/// A wrapper around a SQLite connection.
///
/// Clones share the underlying connection, so a history store created with
/// [`SqliteConnection::history`] sees the same transactions as migrations.
#[derive(Clone)]
pub struct SqliteConnection {
    conn: Connection,
    product: String,
}

impl SqliteConnection {
    /// Open a connection from configuration.
    pub async fn open(config: &SqliteConfig) -> SqliteResult<Self> {
        Ok(Self::from_connection(config.open().await?))
    }

    /// Open a connection from a URL such as `sqlite://./app.db`.
    pub async fn open_url(url: &str) -> SqliteResult<Self> {
        Self::open(&SqliteConfig::from_url(url)?).await
    }

    /// Wrap an already open connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            product: format!("SQLite {}", rusqlite::version()),
        }
    }

    /// A schema history store on this connection.
    pub fn history(&self, table: impl Into<String>) -> SqliteSchemaHistory {
        SqliteSchemaHistory::new(self.conn.clone(), table)
    }

    /// Get the inner connection.
    pub fn inner(&self) -> &Connection {
        &self.conn
    }

    async fn batch(&self, sql: &str) -> MigrateResult<()> {
        let sql = sql.to_string();
        debug!(sql = %sql, "Executing batch");

        self.conn
            .call(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
            .map_err(|e| MigrationError::from(SqliteError::from(e)))
    }
}

#[async_trait]
impl MigrationConnection for SqliteConnection {
    fn product_name(&self) -> &str {
        &self.product
    }

    async fn current_schema(&self) -> MigrateResult<Option<String>> {
        Ok(self.dialect().default_schema.map(str::to_string))
    }

    async fn execute_batch(&self, sql: &str) -> MigrateResult<()> {
        self.batch(sql).await
    }

    async fn begin(&self) -> MigrateResult<()> {
        self.batch("BEGIN IMMEDIATE").await
    }

    async fn commit(&self) -> MigrateResult<()> {
        self.batch("COMMIT").await
    }

    async fn rollback(&self) -> MigrateResult<()> {
        self.batch("ROLLBACK").await
    }
}

#[cfg(test)]
mod tests {
    use sextant_migrate::Dialect;

    use super::*;

    async fn table_count(conn: &SqliteConnection, name: &'static str) -> i64 {
        conn.inner()
            .call(move |c| {
                Ok(c.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [name],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_and_rollback() {
        let conn = SqliteConnection::open(&SqliteConfig::memory()).await.unwrap();

        conn.begin().await.unwrap();
        conn.execute_batch("CREATE TABLE kept (id INTEGER)").await.unwrap();
        conn.commit().await.unwrap();

        conn.begin().await.unwrap();
        conn.execute_batch("CREATE TABLE dropped (id INTEGER)").await.unwrap();
        conn.rollback().await.unwrap();

        assert_eq!(table_count(&conn, "kept").await, 1);
        assert_eq!(table_count(&conn, "dropped").await, 0);
    }

    #[tokio::test]
    async fn test_syntax_error_is_not_transient() {
        let conn = SqliteConnection::open_url("sqlite::memory:").await.unwrap();
        let err = conn.execute_batch("CREATE TABLE (").await.unwrap_err();
        assert!(matches!(err, MigrationError::Database { .. }));
        assert!(!conn.dialect().is_transient(err.code().unwrap_or_default()));
    }

    #[tokio::test]
    async fn test_history_shares_connection() {
        use sextant_migrate::SchemaHistory;

        let conn = SqliteConnection::open(&SqliteConfig::memory()).await.unwrap();
        let history = conn.history("ledger");
        history.create_if_missing().await.unwrap();
        assert_eq!(table_count(&conn, "ledger").await, 1);
        assert_eq!(conn.current_schema().await.unwrap().as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_history_rows_follow_transactions() {
        use sextant_migrate::{MigrationType, NewAppliedMigration, SchemaHistory};

        let conn = SqliteConnection::open(&SqliteConfig::memory()).await.unwrap();
        let history = conn.history("ledger");
        history.create_if_missing().await.unwrap();
        let row = NewAppliedMigration {
            version: None,
            description: "Views".to_string(),
            migration_type: MigrationType::Sql,
            script: "R__Views.sql".to_string(),
            checksum: Some(7),
            installed_by: "test".to_string(),
            execution_time: 1,
            success: true,
        };

        conn.begin().await.unwrap();
        conn.execute_batch("CREATE TABLE v (id INTEGER)").await.unwrap();
        history.append(row.clone()).await.unwrap();
        conn.rollback().await.unwrap();
        assert!(history.read().await.unwrap().is_empty());
        assert_eq!(table_count(&conn, "v").await, 0);

        conn.begin().await.unwrap();
        history.append(row).await.unwrap();
        conn.commit().await.unwrap();
        assert_eq!(history.read().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dialect_detected_from_product() {
        let conn = SqliteConnection::open(&SqliteConfig::memory()).await.unwrap();
        assert!(conn.product_name().starts_with("SQLite 3."));
        assert_eq!(conn.dialect(), Dialect::SQLITE);
    }
}
