//! Where the SQLite database lives and how connections to it are opened.

use std::path::{Path, PathBuf};

use tokio_rusqlite::Connection;
use tracing::info;

use crate::error::{SqliteError, SqliteResult};

/// Busy timeout used unless the URL sets one.
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5000;

/// Where the database lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DatabasePath {
    /// Private in-memory database, one per connection.
    #[default]
    Memory,
    /// Database file shared by every connection that opens it.
    File(PathBuf),
}

impl DatabasePath {
    /// Display form of the path.
    pub fn display(&self) -> String {
        match self {
            Self::Memory => ":memory:".to_string(),
            Self::File(path) => path.display().to_string(),
        }
    }

    /// Check if this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }
}

/// How to open the database.
///
/// Connections always run with foreign keys on and the WAL journal, so that
/// readers of the history never block the process holding the lock row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    /// Database location.
    pub path: DatabasePath,
    /// How long a statement waits on a locked database before `SQLITE_BUSY`.
    pub busy_timeout_ms: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: DatabasePath::Memory,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl SqliteConfig {
    /// Configuration for a private in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Configuration for a database file.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            path: DatabasePath::File(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Parse a URL such as `sqlite://./app.db?busy_timeout=250`.
    ///
    /// The `sqlite://`, `sqlite:` and `file:` prefixes are optional, and
    /// `:memory:` or `?mode=memory` select an in-memory database.
    pub fn from_url(url: impl AsRef<str>) -> SqliteResult<Self> {
        let url = url.as_ref();
        let (location, query) = url.split_once('?').unwrap_or((url, ""));
        let path = ["sqlite://", "sqlite:", "file:"]
            .iter()
            .find_map(|prefix| location.strip_prefix(prefix))
            .unwrap_or(location);

        let mut config = match path {
            "" => return Err(SqliteError::config("database path is required")),
            ":memory:" => Self::memory(),
            path => Self::file(path),
        };
        for (key, value) in query.split('&').filter_map(|pair| pair.split_once('=')) {
            match (key, value) {
                ("mode", "memory") => config.path = DatabasePath::Memory,
                ("busy_timeout", ms) => {
                    config.busy_timeout_ms = ms.parse().map_err(|_| {
                        SqliteError::config(format!("invalid busy_timeout '{}'", ms))
                    })?;
                }
                _ => {}
            }
        }
        Ok(config)
    }

    /// Set the busy timeout in milliseconds.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    /// Pragmas run on every new connection.
    pub fn init_sql(&self) -> String {
        format!(
            "PRAGMA foreign_keys = ON;\nPRAGMA journal_mode = WAL;\nPRAGMA busy_timeout = {};\n",
            self.busy_timeout_ms
        )
    }

    /// Open a connection and apply the pragmas.
    pub async fn open(&self) -> SqliteResult<Connection> {
        let conn = match &self.path {
            DatabasePath::Memory => Connection::open_in_memory().await?,
            DatabasePath::File(path) => Connection::open(path).await?,
        };

        let init_sql = self.init_sql();
        conn.call(move |conn| {
            conn.execute_batch(&init_sql)?;
            Ok(())
        })
        .await?;

        info!(path = %self.path.display(), "Opened SQLite database");
        Ok(conn)
    }
}
