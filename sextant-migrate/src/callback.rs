//! Lifecycle callbacks.
//!
//! Every verb fires a `before` event, then `after` or `after…Error`. Migrate
//! also fires per-migration events; those run inside the migration's
//! transaction when it has one. SQL callbacks are scripts named after their
//! event, such as `beforeMigrate.sql` or `afterEachMigrate__Refresh_stats.sql`,
//! found in the migration locations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::connection::MigrationConnection;
use crate::error::{MigrateResult, MigrationError};
use crate::migration::ResolvedMigration;

/// A point in a verb's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Before migrate takes the lock for the first time.
    BeforeMigrate,
    /// Before each migration runs.
    BeforeEachMigrate,
    /// After each migration ran, before its row is recorded.
    AfterEachMigrate,
    /// After a migration failed and was rolled back.
    AfterEachMigrateError,
    /// After a successful migrate.
    AfterMigrate,
    /// After a failed migrate.
    AfterMigrateError,
    /// Before validate.
    BeforeValidate,
    /// After validate found no violations.
    AfterValidate,
    /// After validate found violations or failed.
    AfterValidateError,
    /// Before repair.
    BeforeRepair,
    /// After a successful repair.
    AfterRepair,
    /// After a failed repair.
    AfterRepairError,
    /// Before baseline.
    BeforeBaseline,
    /// After a successful baseline.
    AfterBaseline,
    /// After a failed baseline.
    AfterBaselineError,
    /// Before info.
    BeforeInfo,
    /// After a successful info.
    AfterInfo,
    /// After a failed info.
    AfterInfoError,
}

impl Event {
    /// Every event.
    pub const ALL: [Event; 18] = [
        Event::BeforeMigrate,
        Event::BeforeEachMigrate,
        Event::AfterEachMigrate,
        Event::AfterEachMigrateError,
        Event::AfterMigrate,
        Event::AfterMigrateError,
        Event::BeforeValidate,
        Event::AfterValidate,
        Event::AfterValidateError,
        Event::BeforeRepair,
        Event::AfterRepair,
        Event::AfterRepairError,
        Event::BeforeBaseline,
        Event::AfterBaseline,
        Event::AfterBaselineError,
        Event::BeforeInfo,
        Event::AfterInfo,
        Event::AfterInfoError,
    ];

    /// Name used in script file names, e.g. `afterEachMigrate`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeMigrate => "beforeMigrate",
            Self::BeforeEachMigrate => "beforeEachMigrate",
            Self::AfterEachMigrate => "afterEachMigrate",
            Self::AfterEachMigrateError => "afterEachMigrateError",
            Self::AfterMigrate => "afterMigrate",
            Self::AfterMigrateError => "afterMigrateError",
            Self::BeforeValidate => "beforeValidate",
            Self::AfterValidate => "afterValidate",
            Self::AfterValidateError => "afterValidateError",
            Self::BeforeRepair => "beforeRepair",
            Self::AfterRepair => "afterRepair",
            Self::AfterRepairError => "afterRepairError",
            Self::BeforeBaseline => "beforeBaseline",
            Self::AfterBaseline => "afterBaseline",
            Self::AfterBaselineError => "afterBaselineError",
            Self::BeforeInfo => "beforeInfo",
            Self::AfterInfo => "afterInfo",
            Self::AfterInfoError => "afterInfoError",
        }
    }

    /// Look an event up by its script name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == name)
    }

    /// Whether the event reports a failure.
    pub fn is_error(&self) -> bool {
        self.as_str().ends_with("Error")
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a callback gets to work with.
#[derive(Clone, Copy)]
pub struct CallbackContext<'a> {
    /// The connection migrations run on.
    pub connection: &'a dyn MigrationConnection,
    /// The migration concerned, for per-migration events.
    pub migration: Option<&'a ResolvedMigration>,
}

impl<'a> CallbackContext<'a> {
    /// A context without a migration.
    pub fn new(connection: &'a dyn MigrationConnection) -> Self {
        Self {
            connection,
            migration: None,
        }
    }

    /// The same context, about `migration`.
    pub fn for_migration(self, migration: &'a ResolvedMigration) -> Self {
        Self {
            migration: Some(migration),
            ..self
        }
    }
}

/// Hook into verb lifecycles.
///
/// ```rust,ignore
/// struct Audit;
///
/// #[async_trait]
/// impl Callback for Audit {
///     fn name(&self) -> &str {
///         "audit"
///     }
///
///     fn supports(&self, event: Event) -> bool {
///         event == Event::AfterMigrate
///     }
///
///     async fn handle(&self, _: Event, context: &CallbackContext<'_>) -> MigrateResult<()> {
///         context.connection.execute_batch("INSERT INTO audit VALUES ('migrated')").await
///     }
/// }
/// ```
#[async_trait]
pub trait Callback: Send + Sync {
    /// Name shown in logs and errors.
    fn name(&self) -> &str;

    /// Whether `handle` should be called for `event`.
    fn supports(&self, event: Event) -> bool;

    /// React to `event`. An error aborts the verb unless the event already
    /// reports a failure.
    async fn handle(&self, event: Event, context: &CallbackContext<'_>) -> MigrateResult<()>;
}

/// A SQL script run on one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlCallback {
    event: Event,
    name: String,
    sql: String,
}

impl SqlCallback {
    /// Create a callback running `sql` on `event`.
    pub fn new(event: Event, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            event,
            name: name.into(),
            sql: sql.into(),
        }
    }

    /// The event the script runs on.
    pub fn event(&self) -> Event {
        self.event
    }

    /// The script body.
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[async_trait]
impl Callback for SqlCallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, event: Event) -> bool {
        event == self.event
    }

    async fn handle(&self, _event: Event, context: &CallbackContext<'_>) -> MigrateResult<()> {
        context.connection.execute_batch(&self.sql).await
    }
}

/// Registered callbacks, fired in registration order.
#[derive(Clone, Default)]
pub struct Callbacks {
    entries: Vec<Arc<dyn Callback>>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|c| c.name()))
            .finish()
    }
}

impl Callbacks {
    /// No callbacks.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a callback.
    pub fn with(self, callback: impl Callback + 'static) -> Self {
        self.with_shared(Arc::new(callback))
    }

    /// Add a shared callback.
    pub fn with_shared(mut self, callback: Arc<dyn Callback>) -> Self {
        self.entries.push(callback);
        self
    }

    /// Number of callbacks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are none.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every callback supporting `event`, stopping at the first error.
    pub async fn fire(&self, event: Event, context: &CallbackContext<'_>) -> MigrateResult<()> {
        for callback in self.entries.iter().filter(|c| c.supports(event)) {
            debug!(event = %event, callback = callback.name(), "Executing callback");
            callback
                .handle(event, context)
                .await
                .map_err(|cause| MigrationError::CallbackFailed {
                    event: event.to_string(),
                    callback: callback.name().to_string(),
                    cause: Box::new(cause),
                })?;
        }
        Ok(())
    }

    /// Like [`Self::fire`], logging the error instead of returning it.
    pub async fn fire_quietly(&self, event: Event, context: &CallbackContext<'_>) {
        if let Err(err) = self.fire(event, context).await {
            warn!(event = %event, error = %err, "Callback failed");
        }
    }
}

impl Extend<Arc<dyn Callback>> for Callbacks {
    fn extend<I: IntoIterator<Item = Arc<dyn Callback>>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::memory::MemoryConnection;

    struct Recorder {
        seen: Arc<Mutex<Vec<Event>>>,
        fail_on: Option<Event>,
    }

    #[async_trait]
    impl Callback for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn supports(&self, _event: Event) -> bool {
            true
        }

        async fn handle(&self, event: Event, _context: &CallbackContext<'_>) -> MigrateResult<()> {
            self.seen.lock().push(event);
            if self.fail_on == Some(event) {
                return Err(MigrationError::other("refused"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(Event::from_name("beforeEachMigrate"), Some(Event::BeforeEachMigrate));
        assert_eq!(Event::from_name("BeforeMigrate"), None);
        assert!(Event::AfterRepairError.is_error());
        assert!(!Event::AfterRepair.is_error());
        for event in Event::ALL {
            assert_eq!(Event::from_name(event.as_str()), Some(event));
        }
    }

    #[tokio::test]
    async fn test_fire_runs_supporting_callbacks() {
        let connection = MemoryConnection::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callbacks = Callbacks::new()
            .with(Recorder {
                seen: Arc::clone(&seen),
                fail_on: None,
            })
            .with(SqlCallback::new(Event::AfterMigrate, "afterMigrate.sql", "ANALYZE"));
        let context = CallbackContext::new(&connection);

        callbacks.fire(Event::BeforeMigrate, &context).await.unwrap();
        callbacks.fire(Event::AfterMigrate, &context).await.unwrap();
        assert_eq!(*seen.lock(), vec![Event::BeforeMigrate, Event::AfterMigrate]);
        assert_eq!(connection.executed(), vec!["ANALYZE"]);
        assert_eq!(callbacks.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_names_callback_and_event() {
        let connection = MemoryConnection::new();
        let callbacks = Callbacks::new().with(Recorder {
            seen: Arc::new(Mutex::new(Vec::new())),
            fail_on: Some(Event::BeforeRepair),
        });
        let context = CallbackContext::new(&connection);

        let err = callbacks.fire(Event::BeforeRepair, &context).await.unwrap_err();
        match err {
            MigrationError::CallbackFailed {
                event, callback, ..
            } => {
                assert_eq!(event, "beforeRepair");
                assert_eq!(callback, "recorder");
            }
            other => panic!("unexpected error: {other}"),
        }
        callbacks.fire_quietly(Event::BeforeRepair, &context).await;
    }
}
