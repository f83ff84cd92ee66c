//! SQLite backend for sextant.
//!
//! This crate provides a schema history store and a migration connection on
//! top of `tokio-rusqlite`.
//!
//! # Features
//!
//! - History table with the lock row protocol, safe across processes
//! - Transactional DDL for migrations
//! - In-memory and file-based databases
//!
//! # Example
//!
//! ```rust,ignore
//! use sextant_migrate::MigrationConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MigrationConfig::load("sextant.toml").await?;
//!     let migrator = sextant_sqlite::migrator("sqlite://./app.db", config).await?;
//!     println!("{}", migrator.migrate().await?.summary());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod row;

pub use config::{DEFAULT_BUSY_TIMEOUT_MS, DatabasePath, SqliteConfig};
pub use connection::SqliteConnection;
pub use error::{SqliteError, SqliteResult};
pub use history::SqliteSchemaHistory;
pub use row::{FromSqliteRow, FromSqliteRowError};

use sextant_migrate::{MigrationConfig, Migrator};

/// Migrator over one SQLite connection.
pub type SqliteMigrator = Migrator<SqliteSchemaHistory, SqliteConnection>;

/// Open `url` and build a migrator using `config.table` as history table.
pub async fn migrator(url: &str, config: MigrationConfig) -> SqliteResult<SqliteMigrator> {
    let connection = SqliteConnection::open_url(url).await?;
    let history = connection.history(config.table.clone());
    Ok(Migrator::new(history, connection, config))
}
