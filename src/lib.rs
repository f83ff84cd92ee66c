//! # Sextant
//!
//! Versioned schema migrations with a locked, self-repairing schema history.
//!
//! Sextant provides:
//! - Migrations discovered from SQL directories (`V`, `R` and `B` scripts) and Rust code
//! - A schema history table that doubles as a cross-process lock
//! - Reconciliation of local migrations with the history into per-migration states
//! - `info`, `validate`, `migrate`, `repair` and `baseline` verbs, with callbacks
//! - A SQLite backend, plus an in-memory one for tests and dry runs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sextant::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MigrationConfig::new().locations(["db/migrations"]);
//!     let migrator = sextant::sqlite::migrator("sqlite://./app.db", config).await?;
//!
//!     let report = migrator.migrate().await?;
//!     println!("{}", report.summary());
//!
//!     for row in migrator.info().await?.rows() {
//!         println!("{:?} {} {}", row.version, row.description, row.state);
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// The migration engine.
pub mod migrate {
    pub use sextant_migrate::*;
}

/// The SQLite backend.
#[cfg(feature = "sqlite")]
pub mod sqlite {
    pub use sextant_sqlite::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::migrate::{
        Callback, CallbackContext, CodeMigration, CodeMigrationSource, Event, MigrateResult,
        MigrationConfig, MigrationConnection, MigrationError, MigrationState, MigrationVersion,
        Migrator, SchemaHistory, SqlDirectorySource, TargetVersion, ValidatePattern,
        ValidationMode,
    };
    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::{SqliteConfig, SqliteConnection, SqliteMigrator, SqliteSchemaHistory};
}

// Re-export key types at the crate root
pub use migrate::{MigrateResult, MigrationConfig, MigrationError, Migrator};
