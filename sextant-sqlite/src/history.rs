//! Schema history table stored in SQLite.
//!
//! Every operation is a single statement, so concurrent writers on other
//! connections are serialized by SQLite's own file lock. The lock row lives
//! at a fixed negative `installed_rank`; the primary key makes its insertion
//! atomic across connections.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{OptionalExtension, params};
use sextant_migrate::{
    AppliedMigration, Dialect, LOCK_DESCRIPTION, LOCK_RANK, MigrateResult, MigrationError,
    MigrationType, NewAppliedMigration, RowUpdate, SchemaHistory, create_table_sql,
};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::error::SqliteError;
use crate::row::{FromSqliteRow, HISTORY_COLUMNS, format_timestamp};

/// A [`SchemaHistory`] backed by a table in a SQLite database.
#[derive(Clone)]
pub struct SqliteSchemaHistory {
    conn: Connection,
    table: String,
    quoted: String,
}

impl SqliteSchemaHistory {
    /// Use `table` on an open connection.
    pub fn new(conn: Connection, table: impl Into<String>) -> Self {
        let table = table.into();
        let quoted = Dialect::SQLITE.quote(&table);
        Self {
            conn,
            table,
            quoted,
        }
    }

    async fn call<R, F>(&self, sql: String, f: F) -> MigrateResult<R>
    where
        F: FnOnce(&mut rusqlite::Connection, &str) -> tokio_rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        debug!(table = %self.table, sql = %sql, "Executing history statement");
        self.conn
            .call(move |conn| f(conn, &sql))
            .await
            .map_err(|e| MigrationError::from(SqliteError::from(e)))
    }
}

#[async_trait]
impl SchemaHistory for SqliteSchemaHistory {
    fn table(&self) -> &str {
        &self.table
    }

    async fn exists(&self) -> MigrateResult<bool> {
        let table = self.table.clone();
        self.call(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1".to_string(),
            move |conn, sql| {
                let count: i64 = conn.query_row(sql, params![table], |row| row.get(0))?;
                Ok(count > 0)
            },
        )
        .await
    }

    async fn create_if_missing(&self) -> MigrateResult<()> {
        if self.exists().await? {
            return Ok(());
        }
        self.call(create_table_sql(&Dialect::SQLITE, None, &self.table), |conn, sql| {
            conn.execute_batch(sql)?;
            Ok(())
        })
        .await?;
        info!(table = %self.table, "Created schema history table");
        Ok(())
    }

    async fn read(&self) -> MigrateResult<Vec<AppliedMigration>> {
        if !self.exists().await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM {} ORDER BY installed_rank",
            HISTORY_COLUMNS, self.quoted
        );
        self.call(sql, |conn, sql| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query([])?;
            let mut history = Vec::new();
            while let Some(row) = rows.next()? {
                history.push(AppliedMigration::from_row(row)?);
            }
            Ok(history)
        })
        .await
    }

    async fn append(&self, row: NewAppliedMigration) -> MigrateResult<AppliedMigration> {
        let installed_on = Utc::now().trunc_subsecs(3);
        let sql = format!(
            "INSERT INTO {t} ({cols}) \
             SELECT COALESCE(MAX(installed_rank), 0) + 1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9 \
             FROM {t} WHERE installed_rank > 0 \
             RETURNING installed_rank",
            t = self.quoted,
            cols = HISTORY_COLUMNS
        );
        let stored = row.clone();
        let installed_rank = self
            .call(sql, move |conn, sql| {
                let rank: i32 = conn.query_row(
                    sql,
                    params![
                        stored.version.as_ref().map(|v| v.to_string()),
                        stored.description,
                        stored.migration_type.as_str(),
                        stored.script,
                        stored.checksum,
                        stored.installed_by,
                        format_timestamp(installed_on),
                        stored.execution_time,
                        stored.success,
                    ],
                    |r| r.get(0),
                )?;
                Ok(rank)
            })
            .await?;

        Ok(AppliedMigration {
            installed_rank,
            version: row.version,
            description: row.description,
            migration_type: row.migration_type,
            script: row.script,
            checksum: row.checksum,
            installed_by: row.installed_by,
            installed_on,
            execution_time: row.execution_time,
            success: row.success,
        })
    }

    async fn remove_failed(&self) -> MigrateResult<usize> {
        let sql = format!(
            "DELETE FROM {} WHERE success = 0 AND installed_rank > 0",
            self.quoted
        );
        self.call(sql, |conn, sql| Ok(conn.execute(sql, [])?)).await
    }

    async fn update_row(&self, installed_rank: i32, update: RowUpdate) -> MigrateResult<()> {
        let sql = format!(
            "UPDATE {} SET description = ?1, type = ?2, checksum = ?3 WHERE installed_rank = ?4",
            self.quoted
        );
        let changed = self
            .call(sql, move |conn, sql| {
                Ok(conn.execute(
                    sql,
                    params![
                        update.description,
                        update.migration_type.as_str(),
                        update.checksum,
                        installed_rank
                    ],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(MigrationError::database(format!(
                "no row with installed_rank {} in {}",
                installed_rank, self.table
            )));
        }
        Ok(())
    }

    async fn try_insert_lock(&self, owner: &str, now: DateTime<Utc>) -> MigrateResult<bool> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES (?1, NULL, ?2, ?3, ?4, NULL, ?4, ?5, 0, 1)",
            self.quoted, HISTORY_COLUMNS
        );
        let owner = owner.to_string();
        self.call(sql, move |conn, sql| {
            let inserted = conn.execute(
                sql,
                params![
                    LOCK_RANK,
                    LOCK_DESCRIPTION,
                    MigrationType::Lock.as_str(),
                    owner,
                    format_timestamp(now)
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn touch_lock(&self, owner: &str, now: DateTime<Utc>) -> MigrateResult<bool> {
        let sql = format!(
            "UPDATE {} SET installed_on = ?1 WHERE installed_rank = ?2 AND script = ?3",
            self.quoted
        );
        let owner = owner.to_string();
        self.call(sql, move |conn, sql| {
            Ok(conn.execute(sql, params![format_timestamp(now), LOCK_RANK, owner])? == 1)
        })
        .await
    }

    async fn delete_expired_lock(&self, older_than: DateTime<Utc>) -> MigrateResult<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE installed_rank = ?1 AND installed_on < ?2",
            self.quoted
        );
        self.call(sql, move |conn, sql| {
            Ok(conn.execute(sql, params![LOCK_RANK, format_timestamp(older_than)])? > 0)
        })
        .await
    }

    async fn delete_lock(&self, owner: &str) -> MigrateResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE installed_rank = ?1 AND script = ?2",
            self.quoted
        );
        let owner = owner.to_string();
        self.call(sql, move |conn, sql| {
            conn.execute(sql, params![LOCK_RANK, owner])?;
            Ok(())
        })
        .await
    }
}

impl SqliteSchemaHistory {
    /// Owner id of the current lock row, if any.
    pub async fn lock_owner(&self) -> MigrateResult<Option<String>> {
        if !self.exists().await? {
            return Ok(None);
        }
        let sql = format!("SELECT script FROM {} WHERE installed_rank = ?1", self.quoted);
        self.call(sql, |conn, sql| {
            Ok(conn
                .query_row(sql, params![LOCK_RANK], |row| row.get(0))
                .optional()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sextant_migrate::MigrationVersion;

    use super::*;
    use crate::config::SqliteConfig;

    async fn history() -> SqliteSchemaHistory {
        let conn = SqliteConfig::memory().open().await.unwrap();
        SqliteSchemaHistory::new(conn, "sextant_schema_history")
    }

    fn row(version: &str, success: bool) -> NewAppliedMigration {
        NewAppliedMigration {
            version: Some(MigrationVersion::parse(version).unwrap()),
            description: format!("m{}", version),
            migration_type: MigrationType::Sql,
            script: format!("V{}__m.sql", version),
            checksum: Some(42),
            installed_by: "tester".to_string(),
            execution_time: 3,
            success,
        }
    }

    #[tokio::test]
    async fn test_absent_table_reads_empty() {
        let h = history().await;
        assert!(!h.exists().await.unwrap());
        assert!(h.read().await.unwrap().is_empty());
        h.create_if_missing().await.unwrap();
        h.create_if_missing().await.unwrap();
        assert!(h.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_append_assigns_ranks_and_round_trips() {
        let h = history().await;
        h.create_if_missing().await.unwrap();
        let first = h.append(row("1", true)).await.unwrap();
        assert!(h.try_insert_lock("owner", Utc::now()).await.unwrap());
        let second = h.append(row("1.1", false)).await.unwrap();
        assert_eq!((first.installed_rank, second.installed_rank), (1, 2));

        let rows = h.read().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].installed_rank, LOCK_RANK);
        assert_eq!(rows[1], first);
        assert_eq!(rows[2].version, Some(MigrationVersion::parse("1.1").unwrap()));
        assert!(!rows[2].success);
    }

    #[tokio::test]
    async fn test_remove_failed_and_update() {
        let h = history().await;
        h.create_if_missing().await.unwrap();
        h.append(row("1", true)).await.unwrap();
        h.append(row("2", false)).await.unwrap();
        assert!(h.try_insert_lock("owner", Utc::now()).await.unwrap());

        assert_eq!(h.remove_failed().await.unwrap(), 1);
        h.update_row(
            1,
            RowUpdate {
                description: "renamed".to_string(),
                migration_type: MigrationType::Code,
                checksum: None,
            },
        )
        .await
        .unwrap();
        assert!(h.update_row(9, RowUpdate {
            description: String::new(),
            migration_type: MigrationType::Sql,
            checksum: None,
        })
        .await
        .is_err());

        let rows = h.read().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].description, "renamed");
        assert_eq!(rows[1].migration_type, MigrationType::Code);
        assert_eq!(rows[1].checksum, None);
    }

    #[tokio::test]
    async fn test_lock_row_protocol() {
        let h = history().await;
        h.create_if_missing().await.unwrap();
        let now = Utc::now();

        assert!(h.try_insert_lock("a", now).await.unwrap());
        assert!(!h.try_insert_lock("b", now).await.unwrap());
        assert_eq!(h.lock_owner().await.unwrap().as_deref(), Some("a"));

        assert!(h.touch_lock("a", now).await.unwrap());
        assert!(!h.touch_lock("b", now).await.unwrap());
        assert!(!h.delete_expired_lock(now - chrono::Duration::seconds(1)).await.unwrap());
        assert!(h.delete_expired_lock(now + chrono::Duration::seconds(1)).await.unwrap());
        assert_eq!(h.lock_owner().await.unwrap(), None);

        assert!(h.try_insert_lock("b", now).await.unwrap());
        h.delete_lock("a").await.unwrap();
        assert_eq!(h.lock_owner().await.unwrap().as_deref(), Some("b"));
        h.delete_lock("b").await.unwrap();
        assert_eq!(h.lock_owner().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_contention_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteConfig::file(dir.path().join("shared.db"));
        let a = SqliteSchemaHistory::new(config.open().await.unwrap(), "history");
        let b = SqliteSchemaHistory::new(config.open().await.unwrap(), "history");
        a.create_if_missing().await.unwrap();
        b.create_if_missing().await.unwrap();

        let now = Utc::now();
        let (first, second) =
            tokio::join!(a.try_insert_lock("a", now), b.try_insert_lock("b", now));
        assert!(first.unwrap() ^ second.unwrap());

        a.append(row("1", true)).await.unwrap();
        let appended = b.append(row("2", true)).await.unwrap();
        assert_eq!(appended.installed_rank, 2);
    }
}
