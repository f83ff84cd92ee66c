//! Migration sources.
//!
//! A source produces [`ResolvedMigration`]s. The SQL directory source lives in
//! [`crate::file`]; code migrations are registered explicitly by the host
//! program through [`CodeMigrationSource`].

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::connection::MigrationConnection;
use crate::error::MigrateResult;
use crate::migration::{MigrationExecutor, MigrationType, ResolvedMigration};
use crate::version::MigrationVersion;

/// Produces resolved migrations from one origin.
#[async_trait]
pub trait MigrationSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Discover every migration this source knows about.
    async fn resolve(&self) -> MigrateResult<Vec<ResolvedMigration>>;
}

/// A migration implemented in Rust.
///
/// ```rust,ignore
/// struct AddIndex;
///
/// #[async_trait]
/// impl CodeMigration for AddIndex {
///     fn version(&self) -> Option<MigrationVersion> {
///         MigrationVersion::parse("3").ok()
///     }
///
///     fn description(&self) -> &str {
///         "Add index"
///     }
///
///     async fn migrate(&self, conn: &dyn MigrationConnection) -> MigrateResult<()> {
///         conn.execute_batch("CREATE INDEX users_email ON users (email)").await
///     }
/// }
/// ```
#[async_trait]
pub trait CodeMigration: Send + Sync {
    /// Version, `None` for a repeatable migration.
    fn version(&self) -> Option<MigrationVersion>;

    /// Human readable description.
    fn description(&self) -> &str;

    /// Checksum recorded in the history.
    ///
    /// Defaults to a hash of version and description. Override to track
    /// changes to the migration body.
    fn checksum(&self) -> Option<i32> {
        let mut hasher = Sha256::new();
        if let Some(version) = self.version() {
            hasher.update(version.to_string().as_bytes());
        }
        hasher.update(b"__");
        hasher.update(self.description().as_bytes());
        let digest = hasher.finalize();
        Some(i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    /// Whether the migration may run inside a transaction.
    fn can_execute_in_transaction(&self) -> bool {
        true
    }

    /// Apply the migration.
    async fn migrate(&self, connection: &dyn MigrationConnection) -> MigrateResult<()>;
}

struct CodeExecutor(Arc<dyn CodeMigration>);

#[async_trait]
impl MigrationExecutor for CodeExecutor {
    async fn execute(&self, connection: &dyn MigrationConnection) -> MigrateResult<()> {
        self.0.migrate(connection).await
    }

    fn can_execute_in_transaction(&self) -> bool {
        self.0.can_execute_in_transaction()
    }
}

/// Source over explicitly registered code migrations.
#[derive(Default, Clone)]
pub struct CodeMigrationSource {
    migrations: Vec<Arc<dyn CodeMigration>>,
}

impl CodeMigrationSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration.
    pub fn register(mut self, migration: impl CodeMigration + 'static) -> Self {
        self.migrations.push(Arc::new(migration));
        self
    }

    /// Register an already shared migration.
    pub fn register_arc(mut self, migration: Arc<dyn CodeMigration>) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Number of registered migrations.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[async_trait]
impl MigrationSource for CodeMigrationSource {
    fn name(&self) -> &str {
        "code"
    }

    async fn resolve(&self) -> MigrateResult<Vec<ResolvedMigration>> {
        Ok(self
            .migrations
            .iter()
            .enumerate()
            .map(|(index, migration)| {
                let executor: Arc<dyn MigrationExecutor> =
                    Arc::new(CodeExecutor(Arc::clone(migration)));
                let description = migration.description().to_string();
                let script = match migration.version() {
                    Some(v) => format!("V{}__{}", v, description.replace(' ', "_")),
                    None => format!("R__{}", description.replace(' ', "_")),
                };
                let resolved = match migration.version() {
                    Some(version) => {
                        ResolvedMigration::versioned(version, description, script, executor)
                    }
                    None => ResolvedMigration::repeatable(description, script, executor),
                };
                resolved
                    .with_checksum(migration.checksum())
                    .with_type(MigrationType::Code)
                    .with_location(format!("code migration #{}", index + 1))
            })
            .collect())
    }
}

/// Source over a fixed list of already resolved migrations.
#[derive(Debug, Default, Clone)]
pub struct StaticSource {
    name: String,
    migrations: Vec<ResolvedMigration>,
}

impl StaticSource {
    /// Create a source returning `migrations` on every call.
    pub fn new(name: impl Into<String>, migrations: Vec<ResolvedMigration>) -> Self {
        Self {
            name: name.into(),
            migrations,
        }
    }
}

#[async_trait]
impl MigrationSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self) -> MigrateResult<Vec<ResolvedMigration>> {
        Ok(self.migrations.clone())
    }
}
