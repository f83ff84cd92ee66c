//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use sextant::migrate::{LockSettings, MigrationConfig};
use sextant::sqlite::SqliteMigrator;
use tempfile::TempDir;

/// Route engine logs to the test harness. `RUST_LOG=sextant_migrate=debug` shows them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A scratch database file next to a directory of migration scripts.
pub struct Project {
    _dir: TempDir,
    pub db: PathBuf,
    pub scripts: PathBuf,
}

impl Project {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let scripts = dir.path().join("migrations");
        std::fs::create_dir(&scripts).expect("Failed to create scripts dir");
        Self {
            db: dir.path().join("app.db"),
            scripts,
            _dir: dir,
        }
    }

    /// Write (or overwrite) a migration script.
    pub fn write(&self, name: &str, sql: &str) -> &Self {
        std::fs::write(self.scripts.join(name), sql).expect("Failed to write script");
        self
    }

    pub fn url(&self) -> String {
        format!("sqlite://{}", self.db.display())
    }

    pub fn config(&self) -> MigrationConfig {
        MigrationConfig::new()
            .locations([self.scripts.clone()])
            .installed_by("tester")
            .lock_settings(LockSettings {
                poll_interval_ms: 20,
                ..Default::default()
            })
    }

    pub async fn migrator(&self) -> SqliteMigrator {
        self.migrator_with(self.config()).await
    }

    pub async fn migrator_with(&self, config: MigrationConfig) -> SqliteMigrator {
        sextant::sqlite::migrator(&self.url(), config)
            .await
            .expect("Failed to open database")
    }
}

/// Count user tables named `name` in the project database.
pub async fn table_exists(migrator: &SqliteMigrator, name: &'static str) -> bool {
    let count: i64 = migrator
        .connection()
        .inner()
        .call(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
                [name],
                |row| row.get(0),
            )?)
        })
        .await
        .expect("Failed to query sqlite_master");
    count == 1
}
