//! Reconciling resolved migrations with the schema history.
//!
//! [`reconcile`] joins the resolved list with history rows into
//! [`MigrationInfo`] entries. The state of an entry is derived on every read
//! from the joined pair and the shared [`ReconcileContext`]; it is never
//! stored.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::history::AppliedMigration;
use crate::migration::{MigrationType, ResolvedMigration};
use crate::version::{MigrationVersion, TargetVersion};

/// State of a migration after reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    /// Resolved, not yet applied.
    Pending,
    /// Resolved, will not be applied.
    Ignored,
    /// Resolved, newer than the target.
    AboveTarget,
    /// Resolved, at or below the baseline.
    BelowBaseline,
    /// The baseline marker row.
    Baseline,
    /// A baseline script at the baseline version, superseded by the marker.
    BaselineIgnored,
    /// Applied after a newer version had already been applied.
    OutOfOrder,
    /// Applied successfully.
    Success,
    /// Applied, failed.
    Failed,
    /// Applied successfully, no longer resolved.
    MissingSuccess,
    /// Applied and failed, no longer resolved.
    MissingFailed,
    /// Applied successfully, newer than anything resolved.
    FutureSuccess,
    /// Applied and failed, newer than anything resolved.
    FutureFailed,
    /// Marked deleted by repair.
    Deleted,
    /// Latest run of a repeatable whose checksum has since changed.
    Outdated,
    /// An older run of a repeatable.
    Superseded,
}

impl MigrationState {
    /// Display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Ignored => "Ignored",
            Self::AboveTarget => "Above Target",
            Self::BelowBaseline => "Below Baseline",
            Self::Baseline => "Baseline",
            Self::BaselineIgnored => "Ignored (Baseline)",
            Self::OutOfOrder => "Out of Order",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::MissingSuccess => "Missing",
            Self::MissingFailed => "Failed (Missing)",
            Self::FutureSuccess => "Future",
            Self::FutureFailed => "Failed (Future)",
            Self::Deleted => "Deleted",
            Self::Outdated => "Outdated",
            Self::Superseded => "Superseded",
        }
    }

    /// Whether the state describes a history row.
    pub fn is_applied(&self) -> bool {
        !matches!(
            self,
            Self::Pending
                | Self::Ignored
                | Self::AboveTarget
                | Self::BelowBaseline
                | Self::BaselineIgnored
        )
    }

    /// Whether the state records a failure.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed | Self::MissingFailed | Self::FutureFailed)
    }

    /// Whether the state has no resolved counterpart.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::MissingSuccess | Self::MissingFailed)
    }

    /// Whether the state is newer than anything resolved.
    pub fn is_future(&self) -> bool {
        matches!(self, Self::FutureSuccess | Self::FutureFailed)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options that shape reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// How far migrate may go.
    pub target: TargetVersion,
    /// Whether versions below the highest applied one may still be applied.
    pub out_of_order: bool,
}

/// Values derived from both sides of the join, shared by every entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileContext {
    /// Version of the lowest baseline recorded in the history.
    pub baseline: Option<MigrationVersion>,
    /// Version of a resolved baseline script that will seed an empty history.
    pub pending_baseline: Option<MigrationVersion>,
    /// Highest resolved version.
    pub last_resolved: Option<MigrationVersion>,
    /// Highest applied version.
    pub last_applied: Option<MigrationVersion>,
    /// Effective upper bound for pending migrations.
    pub target: MigrationVersion,
    /// Whether out-of-order application is permitted.
    pub out_of_order: bool,
    latest_repeatable_runs: HashMap<String, i32>,
}

impl ReconcileContext {
    /// Rank of the most recent run of the repeatable with this description.
    pub fn latest_repeatable_run(&self, description: &str) -> Option<i32> {
        self.latest_repeatable_runs.get(description).copied()
    }
}

/// One reconciled entry.
#[derive(Debug, Clone)]
pub struct MigrationInfo {
    resolved: Option<ResolvedMigration>,
    applied: Option<AppliedMigration>,
    deleted: bool,
    out_of_order: bool,
    context: Arc<ReconcileContext>,
}

impl MigrationInfo {
    /// The resolved side of the join.
    pub fn resolved(&self) -> Option<&ResolvedMigration> {
        self.resolved.as_ref()
    }

    /// The applied side of the join.
    pub fn applied(&self) -> Option<&AppliedMigration> {
        self.applied.as_ref()
    }

    /// Version, `None` for repeatables.
    pub fn version(&self) -> Option<&MigrationVersion> {
        match (&self.applied, &self.resolved) {
            (Some(a), _) => a.version.as_ref(),
            (None, Some(r)) => r.version.as_ref(),
            (None, None) => None,
        }
    }

    /// Description, preferring the recorded one.
    pub fn description(&self) -> &str {
        match (&self.applied, &self.resolved) {
            (Some(a), _) => &a.description,
            (None, Some(r)) => &r.description,
            (None, None) => "",
        }
    }

    /// Script, preferring the recorded one.
    pub fn script(&self) -> &str {
        match (&self.applied, &self.resolved) {
            (Some(a), _) => &a.script,
            (None, Some(r)) => &r.script,
            (None, None) => "",
        }
    }

    /// Type, preferring the recorded one.
    pub fn migration_type(&self) -> MigrationType {
        match (&self.applied, &self.resolved) {
            (Some(a), _) => a.migration_type,
            (None, Some(r)) => r.migration_type,
            (None, None) => MigrationType::Sql,
        }
    }

    /// Checksum, preferring the recorded one.
    pub fn checksum(&self) -> Option<i32> {
        match (&self.applied, &self.resolved) {
            (Some(a), _) => a.checksum,
            (None, Some(r)) => r.checksum,
            (None, None) => None,
        }
    }

    /// Rank of the history row, if applied.
    pub fn installed_rank(&self) -> Option<i32> {
        self.applied.as_ref().map(|a| a.installed_rank)
    }

    /// When the migration was applied.
    pub fn installed_on(&self) -> Option<DateTime<Utc>> {
        self.applied.as_ref().map(|a| a.installed_on)
    }

    /// Who applied the migration.
    pub fn installed_by(&self) -> Option<&str> {
        self.applied.as_ref().map(|a| a.installed_by.as_str())
    }

    /// Execution time in milliseconds.
    pub fn execution_time(&self) -> Option<i32> {
        self.applied.as_ref().map(|a| a.execution_time)
    }

    /// Whether a later DELETE row cancelled this entry.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether the entry is a repeatable migration.
    pub fn is_repeatable(&self) -> bool {
        self.version().is_none() && !self.migration_type().is_synthetic()
    }

    /// `V1.1` or `R Description`.
    pub fn label(&self) -> String {
        match self.version() {
            Some(v) => format!("V{}", v),
            None => format!("R {}", self.description()),
        }
    }

    /// The shared reconciliation context.
    pub fn context(&self) -> &ReconcileContext {
        &self.context
    }

    /// Derive the state of this entry.
    pub fn state(&self) -> MigrationState {
        let ctx = &self.context;
        match (&self.resolved, &self.applied) {
            (Some(resolved), None) => resolved_state(resolved, ctx),
            (resolved, Some(applied)) => {
                if self.deleted {
                    return MigrationState::Deleted;
                }
                match applied.migration_type {
                    MigrationType::Baseline => return MigrationState::Baseline,
                    t if t.is_synthetic() => return MigrationState::Success,
                    _ => {}
                }
                match resolved {
                    None => missing_or_future(applied, ctx),
                    Some(resolved) => {
                        if !applied.success {
                            MigrationState::Failed
                        } else if applied.version.is_none() {
                            let latest = ctx.latest_repeatable_run(&applied.description);
                            if latest != Some(applied.installed_rank) {
                                MigrationState::Superseded
                            } else if !resolved.checksum_matches(applied.checksum) {
                                MigrationState::Outdated
                            } else {
                                MigrationState::Success
                            }
                        } else if self.out_of_order {
                            MigrationState::OutOfOrder
                        } else {
                            MigrationState::Success
                        }
                    }
                }
            }
            (None, None) => MigrationState::Ignored,
        }
    }

    fn sort_key(&self) -> (u8, Option<&MigrationVersion>, &str, i32) {
        let rank = self.installed_rank().unwrap_or(i32::MAX);
        match self.version() {
            Some(v) => (0, Some(v), "", rank),
            None => (1, None, self.description(), rank),
        }
    }
}

fn resolved_state(resolved: &ResolvedMigration, ctx: &ReconcileContext) -> MigrationState {
    let Some(version) = &resolved.version else {
        return if resolved.executor().should_execute() {
            MigrationState::Pending
        } else {
            MigrationState::Ignored
        };
    };

    if let Some(baseline) = &ctx.baseline {
        if version <= baseline {
            return if version == baseline && resolved.migration_type.is_baseline_migration() {
                MigrationState::BaselineIgnored
            } else {
                MigrationState::BelowBaseline
            };
        }
    }
    if let Some(pending_baseline) = &ctx.pending_baseline {
        if version < pending_baseline {
            return MigrationState::BelowBaseline;
        }
    }
    if version > &ctx.target {
        return MigrationState::AboveTarget;
    }
    if !resolved.executor().should_execute() {
        return MigrationState::Ignored;
    }
    if let Some(last_applied) = &ctx.last_applied {
        if version < last_applied && !ctx.out_of_order {
            return MigrationState::Ignored;
        }
    }
    MigrationState::Pending
}

fn missing_or_future(applied: &AppliedMigration, ctx: &ReconcileContext) -> MigrationState {
    let future = match (&applied.version, &ctx.last_resolved) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(v), Some(last)) => v > last,
    };
    match (future, applied.success) {
        (true, true) => MigrationState::FutureSuccess,
        (true, false) => MigrationState::FutureFailed,
        (false, true) => MigrationState::MissingSuccess,
        (false, false) => MigrationState::MissingFailed,
    }
}

/// The reconciled view, ordered by version with repeatables last.
#[derive(Debug, Clone)]
pub struct MigrationInfoSet {
    infos: Vec<MigrationInfo>,
    migrations: Vec<ResolvedMigration>,
    context: Arc<ReconcileContext>,
}

impl MigrationInfoSet {
    /// Every entry.
    pub fn all(&self) -> &[MigrationInfo] {
        &self.infos
    }

    /// The shared context.
    pub fn context(&self) -> &ReconcileContext {
        &self.context
    }

    /// The resolved migrations the set was built from, in resolution order.
    pub fn resolved_migrations(&self) -> &[ResolvedMigration] {
        &self.migrations
    }

    /// The applied entry with the highest version.
    pub fn current(&self) -> Option<&MigrationInfo> {
        self.infos
            .iter()
            .filter(|i| {
                i.applied.is_some()
                    && !i.deleted
                    && i.version().is_some()
                    && !matches!(
                        i.migration_type(),
                        MigrationType::Delete | MigrationType::Schema
                    )
            })
            .max_by(|a, b| {
                a.version()
                    .cmp(&b.version())
                    .then(a.installed_rank().cmp(&b.installed_rank()))
            })
    }

    /// Entries waiting to be applied, in application order.
    pub fn pending(&self) -> Vec<&MigrationInfo> {
        self.with_state(|s| s == MigrationState::Pending)
    }

    /// Entries backed by a history row.
    pub fn applied(&self) -> Vec<&MigrationInfo> {
        self.infos.iter().filter(|i| i.applied.is_some()).collect()
    }

    /// Entries recording a failure.
    pub fn failed(&self) -> Vec<&MigrationInfo> {
        self.with_state(|s| s.is_failed())
    }

    /// Applied entries newer than anything resolved.
    pub fn future(&self) -> Vec<&MigrationInfo> {
        self.with_state(|s| s.is_future())
    }

    /// Entries applied out of order.
    pub fn out_of_order(&self) -> Vec<&MigrationInfo> {
        self.with_state(|s| s == MigrationState::OutOfOrder)
    }

    /// Entries backed by a resolved migration.
    pub fn resolved(&self) -> Vec<&MigrationInfo> {
        self.infos.iter().filter(|i| i.resolved.is_some()).collect()
    }

    fn with_state(&self, pred: impl Fn(MigrationState) -> bool) -> Vec<&MigrationInfo> {
        self.infos.iter().filter(|i| pred(i.state())).collect()
    }
}

fn join_key(row: &AppliedMigration) -> JoinKey {
    match &row.version {
        Some(v) => JoinKey::Version(v.clone()),
        None => JoinKey::Description(row.description.clone()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum JoinKey {
    Version(MigrationVersion),
    Description(String),
}

/// Join resolved migrations with history rows.
///
/// The lock row is ignored. Fails with `CorruptedHistory` when a DELETE row
/// has nothing left to delete.
pub fn reconcile(
    resolved: &[ResolvedMigration],
    applied: &[AppliedMigration],
    options: &ReconcileOptions,
) -> MigrateResult<MigrationInfoSet> {
    let mut rows: Vec<AppliedMigration> =
        applied.iter().filter(|r| !r.is_lock()).cloned().collect();
    rows.sort_by_key(|r| r.installed_rank);

    let deleted = mark_deleted(&rows)?;

    let mut baseline: Option<MigrationVersion> = None;
    let mut last_applied: Option<MigrationVersion> = None;
    let mut latest_repeatable_runs = HashMap::new();
    let mut out_of_order_ranks = HashSet::new();
    let mut highest_so_far: Option<MigrationVersion> = None;

    for (index, row) in rows.iter().enumerate() {
        if deleted[index] {
            continue;
        }
        let is_baseline_row = row.migration_type == MigrationType::Baseline
            || (row.migration_type == MigrationType::SqlBaseline && row.success);
        if let (true, Some(v)) = (is_baseline_row, &row.version) {
            if baseline.as_ref().is_none_or(|b| v < b) {
                baseline = Some(v.clone());
            }
        }
        if matches!(row.migration_type, MigrationType::Schema | MigrationType::Delete) {
            continue;
        }
        match &row.version {
            Some(v) => {
                if last_applied.as_ref().is_none_or(|last| v > last) {
                    last_applied = Some(v.clone());
                }
                if row.is_synthetic() {
                    continue;
                }
                if highest_so_far.as_ref().is_none_or(|high| v > high) {
                    highest_so_far = Some(v.clone());
                } else if highest_so_far.as_ref().is_some_and(|high| v < high) {
                    out_of_order_ranks.insert(row.installed_rank);
                }
            }
            None => {
                latest_repeatable_runs.insert(row.description.clone(), row.installed_rank);
            }
        }
    }

    let last_resolved = resolved.iter().filter_map(|r| r.version.as_ref()).max().cloned();

    let has_real_rows = rows.iter().any(|r| !r.is_synthetic());
    let pending_baseline = if baseline.is_none() && !has_real_rows {
        resolved
            .iter()
            .filter(|r| r.migration_type.is_baseline_migration())
            .filter_map(|r| r.version.as_ref())
            .max()
            .cloned()
    } else {
        None
    };

    let target = match &options.target {
        TargetVersion::Latest | TargetVersion::Next => MigrationVersion::LATEST,
        TargetVersion::Current => last_applied.clone().unwrap_or(MigrationVersion::EMPTY),
        TargetVersion::Version(v) => v.clone(),
    };

    let context = Arc::new(ReconcileContext {
        baseline,
        pending_baseline,
        last_resolved,
        last_applied,
        target,
        out_of_order: options.out_of_order,
        latest_repeatable_runs,
    });

    let mut by_key: HashMap<JoinKey, &ResolvedMigration> = HashMap::new();
    for migration in resolved {
        let key = match &migration.version {
            Some(v) => JoinKey::Version(v.clone()),
            None => JoinKey::Description(migration.description.clone()),
        };
        by_key.entry(key).or_insert(migration);
    }

    let mut infos = Vec::with_capacity(rows.len() + resolved.len());
    let mut covered: HashSet<JoinKey> = HashSet::new();

    for (index, row) in rows.iter().enumerate() {
        let is_deleted = deleted[index];
        let joined = if is_deleted || row.is_synthetic() {
            None
        } else {
            let key = join_key(row);
            let found = by_key.get(&key).map(|r| (*r).clone());
            covered.insert(key);
            found
        };
        infos.push(MigrationInfo {
            resolved: joined,
            applied: Some(row.clone()),
            deleted: is_deleted,
            out_of_order: out_of_order_ranks.contains(&row.installed_rank),
            context: Arc::clone(&context),
        });
    }

    for migration in resolved {
        let pending = match &migration.version {
            Some(v) => !covered.contains(&JoinKey::Version(v.clone())),
            None => match context.latest_repeatable_run(&migration.description) {
                None => true,
                Some(rank) => rows
                    .iter()
                    .find(|r| r.installed_rank == rank)
                    .is_some_and(|r| r.success && !migration.checksum_matches(r.checksum)),
            },
        };
        if pending {
            infos.push(MigrationInfo {
                resolved: Some(migration.clone()),
                applied: None,
                deleted: false,
                out_of_order: false,
                context: Arc::clone(&context),
            });
        }
    }

    infos.sort_by(|a, b| compare_infos(a, b));

    Ok(MigrationInfoSet {
        infos,
        migrations: resolved.to_vec(),
        context,
    })
}

fn compare_infos(a: &MigrationInfo, b: &MigrationInfo) -> Ordering {
    a.sort_key().cmp(&b.sort_key())
}

/// For each row, whether a later DELETE row cancels it.
///
/// A DELETE row cancels the latest earlier live row with the same version
/// (or repeatable description).
fn mark_deleted(rows: &[AppliedMigration]) -> MigrateResult<Vec<bool>> {
    let mut deleted = vec![false; rows.len()];
    for (index, row) in rows.iter().enumerate() {
        if row.migration_type != MigrationType::Delete {
            continue;
        }
        let key = join_key(row);
        let target = rows[..index]
            .iter()
            .enumerate()
            .rev()
            .find(|(i, r)| !deleted[*i] && !r.is_synthetic() && join_key(r) == key)
            .map(|(i, _)| i);
        match target {
            Some(i) => deleted[i] = true,
            None => {
                return Err(MigrationError::CorruptedHistory(format!(
                    "delete marker at installed_rank {} for {} has no live migration to delete",
                    row.installed_rank,
                    match &row.version {
                        Some(v) => format!("version {}", v),
                        None => format!("repeatable '{}'", row.description),
                    }
                )));
            }
        }
    }
    Ok(deleted)
}
