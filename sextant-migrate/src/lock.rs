//! The schema history lock.
//!
//! The lock is a row in the history table itself. Acquiring inserts the row,
//! a background task refreshes its timestamp every half timeout, and releasing
//! deletes it. A row that has not been refreshed within the timeout belongs to
//! a dead runner and is removed before the next insert attempt.
//!
//! The lock is re-entrant per [`HistoryLock`] instance: nested acquisitions
//! only bump a depth counter, and only the outermost release touches the store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{MigrateResult, MigrationError};
use crate::history::SchemaHistory;
use crate::retry::RetryPolicy;

/// Lock timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// A lock row older than this is considered abandoned.
    pub timeout_secs: u64,
    /// Wait between insert attempts.
    pub poll_interval_ms: u64,
    /// Insert attempts before giving up.
    pub retry_count: u32,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            poll_interval_ms: 1000,
            retry_count: 50,
        }
    }
}

impl LockSettings {
    /// The staleness threshold.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Interval between heartbeats.
    pub fn heartbeat_interval(&self) -> Duration {
        self.timeout() / 2
    }

    /// Wait between insert attempts.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Default)]
struct LockState {
    depth: u32,
    heartbeat: Option<JoinHandle<()>>,
}

/// A re-entrant lock over a schema history table.
pub struct HistoryLock<H: SchemaHistory + 'static> {
    history: Arc<H>,
    owner: String,
    settings: LockSettings,
    retry: RetryPolicy,
    state: Mutex<LockState>,
}

impl<H: SchemaHistory + 'static> HistoryLock<H> {
    /// Create a lock with a fresh owner id.
    pub fn new(history: Arc<H>, settings: LockSettings, retry: RetryPolicy) -> Self {
        Self {
            history,
            owner: Uuid::new_v4().to_string(),
            settings,
            retry,
            state: Mutex::new(LockState::default()),
        }
    }

    /// The id written into the lock row.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Current nesting depth. 0 when not held.
    pub async fn depth(&self) -> u32 {
        self.state.lock().await.depth
    }

    /// Acquire the lock, or deepen it if already held.
    pub async fn acquire(&self) -> MigrateResult<()> {
        let mut state = self.state.lock().await;
        if state.depth > 0 {
            state.depth += 1;
            return Ok(());
        }

        let attempts = self.settings.retry_count.max(1);
        let mut acquired = false;
        for attempt in 1..=attempts {
            let now = Utc::now();
            let cutoff = now
                - chrono::Duration::from_std(self.settings.timeout())
                    .map_err(|e| MigrationError::config(e.to_string()))?;

            let reclaimed = self
                .retry
                .run("delete expired lock", || self.history.delete_expired_lock(cutoff))
                .await?;
            if reclaimed {
                warn!(table = self.history.table(), "Removed abandoned schema history lock");
            }

            let inserted = self
                .retry
                .run("insert lock", || self.history.try_insert_lock(&self.owner, now))
                .await?;
            if inserted {
                acquired = true;
                break;
            }

            debug!(attempt, attempts, "Schema history is locked by another runner, waiting");
            if attempt < attempts {
                tokio::time::sleep(self.settings.poll_interval()).await;
            }
        }

        if !acquired {
            return Err(MigrationError::lock_failed(format!(
                "{} is still locked after {} attempts",
                self.history.table(),
                attempts
            )));
        }

        info!(owner = %self.owner, table = self.history.table(), "Acquired schema history lock");
        state.depth = 1;
        state.heartbeat = Some(self.spawn_heartbeat());
        Ok(())
    }

    /// Release one level of the lock. The outermost release deletes the row.
    pub async fn release(&self) -> MigrateResult<()> {
        let mut state = self.state.lock().await;
        match state.depth {
            0 => Err(MigrationError::lock_failed("release without matching acquire")),
            1 => {
                state.depth = 0;
                if let Some(heartbeat) = state.heartbeat.take() {
                    heartbeat.abort();
                }
                self.retry
                    .run("release lock", || self.history.delete_lock(&self.owner))
                    .await?;
                debug!(owner = %self.owner, "Released schema history lock");
                Ok(())
            }
            _ => {
                state.depth -= 1;
                Ok(())
            }
        }
    }

    /// Run `f` while holding the lock.
    pub async fn with_lock<T, F, Fut>(&self, f: F) -> MigrateResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MigrateResult<T>>,
    {
        self.acquire().await?;
        let result = f().await;
        let released = self.release().await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), released) => {
                if let Err(release_err) = released {
                    warn!(error = %release_err, "Failed to release schema history lock");
                }
                Err(err)
            }
            (Ok(_), Err(err)) => Err(err),
        }
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let history = Arc::clone(&self.history);
        let owner = self.owner.clone();
        let interval = self.settings.heartbeat_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match history.touch_lock(&owner, Utc::now()).await {
                    Ok(true) => debug!(owner = %owner, "Refreshed schema history lock"),
                    Ok(false) => {
                        warn!(owner = %owner, "Schema history lock was taken away");
                        break;
                    }
                    Err(err) => {
                        warn!(owner = %owner, error = %err, "Failed to refresh schema history lock")
                    }
                }
            }
        })
    }
}

impl<H: SchemaHistory + 'static> Drop for HistoryLock<H> {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.state.get_mut().heartbeat.take() {
            heartbeat.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use crate::memory::InMemorySchemaHistory;
    use crate::retry::RetrySettings;

    fn lock(
        history: &Arc<InMemorySchemaHistory>,
        settings: LockSettings,
    ) -> HistoryLock<InMemorySchemaHistory> {
        HistoryLock::new(
            Arc::clone(history),
            settings,
            RetryPolicy::new(Dialect::GENERIC, RetrySettings::default()),
        )
    }

    fn quick() -> LockSettings {
        LockSettings {
            timeout_secs: 600,
            poll_interval_ms: 10,
            retry_count: 3,
        }
    }

    async fn history() -> Arc<InMemorySchemaHistory> {
        let history = Arc::new(InMemorySchemaHistory::new());
        history.create_if_missing().await.unwrap();
        history
    }

    #[tokio::test]
    async fn test_reentrant() {
        let history = history().await;
        let l = lock(&history, quick());

        l.acquire().await.unwrap();
        l.acquire().await.unwrap();
        assert_eq!(l.depth().await, 2);

        l.release().await.unwrap();
        assert!(history.is_locked());
        l.release().await.unwrap();
        assert!(!history.is_locked());
        assert!(l.release().await.is_err());
    }

    #[tokio::test]
    async fn test_second_owner_is_refused() {
        let history = history().await;
        let first = lock(&history, quick());
        let second = lock(&history, quick());
        assert_ne!(first.owner(), second.owner());

        first.acquire().await.unwrap();
        let err = second.acquire().await.unwrap_err();
        assert!(matches!(err, MigrationError::LockFailed(_)));

        first.release().await.unwrap();
        second.acquire().await.unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_lock_is_reclaimed() {
        let history = history().await;
        let stale = Utc::now() - chrono::Duration::hours(2);
        assert!(history.try_insert_lock("dead-runner", stale).await.unwrap());

        let l = lock(&history, quick());
        l.acquire().await.unwrap();
        let rows = history.read().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].script, l.owner());
        l.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_row() {
        let history = history().await;
        let l = lock(
            &history,
            LockSettings {
                timeout_secs: 1,
                ..quick()
            },
        );
        l.acquire().await.unwrap();
        let before = history.read().await.unwrap()[0].installed_on;
        tokio::time::sleep(Duration::from_millis(700)).await;
        let after = history.read().await.unwrap()[0].installed_on;
        assert!(after > before);
        l.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let history = history().await;
        let l = lock(&history, quick());
        let result: MigrateResult<()> = l
            .with_lock(|| async { Err(MigrationError::other("boom")) })
            .await;
        assert!(result.is_err());
        assert!(!history.is_locked());
        assert_eq!(l.depth().await, 0);
    }
}
