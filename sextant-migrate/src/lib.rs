//! # sextant-migrate
//!
//! Migration engine for sextant.
//!
//! This crate provides functionality for:
//! - Resolving migrations from SQL directories and Rust code into one ordered set
//! - Reconciling that set with the schema history table into per-migration states
//! - Validating that applied migrations still match their local definitions
//! - Applying pending migrations one at a time under a history-table lock
//! - Repairing the history and baselining existing databases
//! - Lifecycle callbacks around every verb, in Rust or as SQL scripts
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌─────────────┐
//! │   Sources    │────▶│   Composite    │────▶│ Reconciler  │◀──┐
//! │ (SQL, code)  │     │   Resolver     │     │             │   │
//! └──────────────┘     └────────────────┘     └─────────────┘   │
//!                                                    │          │
//!                                                    ▼          │
//!                      ┌────────────────┐     ┌─────────────┐   │
//!                      │   Validator    │◀────│ Coordinator │   │
//!                      └────────────────┘     └─────────────┘   │
//!                                                    │          │
//!                                                    ▼          │
//!                                            ┌─────────────┐    │
//!                                            │ History Tbl │────┘
//!                                            │ (+ lock row)│
//!                                            └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use sextant_migrate::{MigrationConfig, Migrator};
//!
//! async fn run() -> sextant_migrate::MigrateResult<()> {
//!     let config = MigrationConfig::load("sextant.toml").await?;
//!     let history = /* a SchemaHistory implementation */;
//!     let connection = /* a MigrationConnection implementation */;
//!
//!     let migrator = Migrator::new(history, connection, config);
//!     println!("{}", migrator.info().await?.summary());
//!
//!     let report = migrator.migrate().await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Migration Files
//!
//! ```text
//! migrations/
//! ├── B5__Full_schema.sql          # baseline script, replaces V1..V5 on empty databases
//! ├── V6__Add_orders.sql
//! ├── V6_1__Index_orders.sql
//! ├── V6_1__Index_orders.sql.conf  # executeInTransaction=false
//! └── R__Order_totals_view.sql     # re-applied whenever its checksum changes
//! ```
//!
//! ## States
//!
//! Every entry of [`MigrationInfoSet`] derives its [`MigrationState`] on read
//! from the resolved migration, the history row and a shared
//! [`ReconcileContext`]. Nothing about state is stored.

pub mod baseline;
pub mod callback;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod file;
pub mod history;
pub mod info;
pub mod lock;
pub mod memory;
pub mod migrate;
pub mod migration;
pub mod repair;
pub mod resolution;
pub mod retry;
pub mod source;
pub mod validate;
pub mod version;

// Re-exports
pub use baseline::{BaselineReport, DEFAULT_BASELINE_DESCRIPTION};
pub use callback::{Callback, CallbackContext, Callbacks, Event, SqlCallback};
pub use config::{CONFIG_FILE_NAME, DEFAULT_TABLE, MigrationConfig};
pub use connection::MigrationConnection;
pub use dialect::{Dialect, DialectRegistry};
pub use engine::{InfoReport, InfoRow, Migrator, ValidateReport};
pub use error::{MigrateResult, MigrationError};
pub use file::{ScriptName, SqlDirectorySource, parse_script_name};
pub use history::{
    AppliedMigration, LOCK_DESCRIPTION, LOCK_RANK, NewAppliedMigration, RowUpdate, SchemaHistory,
    create_table_sql,
};
pub use info::{
    MigrationInfo, MigrationInfoSet, MigrationState, ReconcileContext, ReconcileOptions, reconcile,
};
pub use lock::{HistoryLock, LockSettings};
pub use memory::{InMemorySchemaHistory, MemoryConnection};
pub use migrate::{Coordinator, MigrateOptions, MigrateReport, MigrationExecution};
pub use migration::{
    MigrationExecutor, MigrationType, ResolvedMigration, SqlScriptExecutor, compute_checksum,
};
pub use repair::{RepairReport, RepairedEntry};
pub use resolution::{CompositeResolver, merge, resolve};
pub use retry::{Disposition, RetryPolicy, RetrySettings};
pub use source::{CodeMigration, CodeMigrationSource, MigrationSource, StaticSource};
pub use validate::{
    PatternKind, PatternState, ValidateOptions, ValidatePattern, ValidationMode,
    ValidationViolation, ViolationKind, validate,
};
pub use version::{MigrationVersion, TargetVersion};
