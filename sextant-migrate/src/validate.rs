//! Consistency checks between resolved migrations and the history.
//!
//! Versioned migrations are compared by position: the n-th applied version
//! (ordered by version) is paired with the n-th resolved version that is not
//! waiting to be applied. Failed rows, resolved migrations that will never be
//! applied and repeatables that vanished locally are reported alongside.
//!
//! `type:state` patterns such as `*:missing` or `repeatable:future` leave
//! matching entries out of every check.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;
use crate::history::AppliedMigration;
use crate::info::{MigrationInfo, MigrationInfoSet, MigrationState};
use crate::migration::{MigrationType, ResolvedMigration};
use crate::version::MigrationVersion;

/// How much the validator reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Every violation.
    #[default]
    All,
    /// Only the first violation.
    First,
    /// No validation at all.
    Disabled,
}

/// Category of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// More versioned migrations applied than resolve locally.
    CountMismatch,
    /// An applied version paired with a different resolved version.
    VersionMismatch,
    /// Applied and resolved migration types differ.
    TypeMismatch,
    /// Applied and resolved checksums differ.
    ChecksumMismatch,
    /// Applied and resolved descriptions differ.
    DescriptionMismatch,
    /// The history records a failed migration.
    FailedMigration,
    /// A resolved migration below the current version that will never be applied.
    IgnoredMigration,
    /// The latest run of a repeatable no longer resolves.
    MissingRepeatable,
}

/// One inconsistency between resolved and applied migrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationViolation {
    /// What kind of inconsistency this is.
    pub kind: ViolationKind,
    /// Version concerned, if any.
    pub version: Option<String>,
    /// Script concerned, empty for count mismatches.
    pub script: String,
    /// Human readable message with expected and actual values.
    pub message: String,
}

/// Migration type half of a [`ValidatePattern`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    /// `*`
    Any,
    /// `versioned`
    Versioned,
    /// `repeatable`
    Repeatable,
}

/// State half of a [`ValidatePattern`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternState {
    /// `*`
    Any,
    /// Applied, no longer resolved.
    Missing,
    /// Resolved, not applied yet. Never reported, accepted for completeness.
    Pending,
    /// Resolved below the current version and skipped.
    Ignored,
    /// Applied, newer than anything resolved.
    Future,
}

/// A `type:state` pattern naming entries validation should skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ValidatePattern {
    /// Which migrations the pattern covers.
    pub kind: PatternKind,
    /// Which state it covers.
    pub state: PatternState,
}

impl ValidatePattern {
    /// Build a pattern.
    pub const fn new(kind: PatternKind, state: PatternState) -> Self {
        Self { kind, state }
    }

    /// Whether an entry of the given kind and state is covered.
    pub fn matches(&self, repeatable: bool, state: PatternState) -> bool {
        let kind = match self.kind {
            PatternKind::Any => true,
            PatternKind::Versioned => !repeatable,
            PatternKind::Repeatable => repeatable,
        };
        kind && (self.state == PatternState::Any || self.state == state)
    }
}

impl FromStr for ValidatePattern {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            MigrationError::config(format!(
                "invalid ignore pattern '{}', expected type:state such as '*:missing'",
                s
            ))
        };
        let (kind, state) = s.trim().split_once(':').ok_or_else(invalid)?;
        let kind = match kind.to_ascii_lowercase().as_str() {
            "*" => PatternKind::Any,
            "versioned" => PatternKind::Versioned,
            "repeatable" => PatternKind::Repeatable,
            _ => return Err(invalid()),
        };
        let state = match state.to_ascii_lowercase().as_str() {
            "*" => PatternState::Any,
            "missing" => PatternState::Missing,
            "pending" => PatternState::Pending,
            "ignored" => PatternState::Ignored,
            "future" => PatternState::Future,
            _ => return Err(invalid()),
        };
        Ok(Self { kind, state })
    }
}

impl TryFrom<String> for ValidatePattern {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ValidatePattern> for String {
    fn from(pattern: ValidatePattern) -> Self {
        pattern.to_string()
    }
}

impl fmt::Display for ValidatePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            PatternKind::Any => "*",
            PatternKind::Versioned => "versioned",
            PatternKind::Repeatable => "repeatable",
        };
        let state = match self.state {
            PatternState::Any => "*",
            PatternState::Missing => "missing",
            PatternState::Pending => "pending",
            PatternState::Ignored => "ignored",
            PatternState::Future => "future",
        };
        write!(f, "{}:{}", kind, state)
    }
}

/// Validator settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidateOptions {
    /// How many violations to report.
    pub mode: ValidationMode,
    /// Leave applied migrations newer than anything resolved out of the checks.
    pub ignore_future_migrations: bool,
    /// Entries to leave out of the checks.
    pub ignore_patterns: Vec<ValidatePattern>,
}

impl ValidateOptions {
    /// Whether entries of this kind in this state are left out of the checks.
    pub fn ignores(&self, repeatable: bool, state: PatternState) -> bool {
        (state == PatternState::Future && self.ignore_future_migrations)
            || self.ignore_patterns.iter().any(|p| p.matches(repeatable, state))
    }

    /// Whether `info` is left out of the checks.
    pub fn skips(&self, info: &MigrationInfo) -> bool {
        pattern_state(info.state()).is_some_and(|state| self.ignores(info.is_repeatable(), state))
    }
}

fn pattern_state(state: MigrationState) -> Option<PatternState> {
    match state {
        MigrationState::Pending => Some(PatternState::Pending),
        MigrationState::Ignored => Some(PatternState::Ignored),
        s if s.is_missing() => Some(PatternState::Missing),
        s if s.is_future() => Some(PatternState::Future),
        _ => None,
    }
}

/// Compare the history with what resolves locally.
pub fn validate(infos: &MigrationInfoSet, options: &ValidateOptions) -> Vec<ValidationViolation> {
    if options.mode == ValidationMode::Disabled {
        return Vec::new();
    }

    let mut applied: Vec<&AppliedMigration> = infos
        .all()
        .iter()
        .filter(|i| !i.is_deleted() && !options.skips(i))
        .filter_map(|i| i.applied())
        .filter(|a| a.migration_type != MigrationType::Schema)
        .collect();
    if applied.is_empty() {
        return Vec::new();
    }
    applied.sort_by_key(|a| a.installed_rank);

    let mut resolved: Vec<&ResolvedMigration> = infos
        .resolved_migrations()
        .iter()
        .filter(|r| r.version.is_some() && r.executor().should_execute())
        .collect();

    match applied.first() {
        Some(oldest) if oldest.migration_type == MigrationType::Baseline => {
            let baseline = oldest.version.clone();
            applied.remove(0);
            if let Some(baseline) = baseline {
                resolved.retain(|r| r.version.as_ref().is_some_and(|v| v > &baseline));
            }
        }
        Some(oldest) if oldest.migration_type == MigrationType::SqlBaseline => {
            if let Some(baseline) = oldest.version.clone() {
                resolved.retain(|r| r.version.as_ref().is_some_and(|v| v >= &baseline));
            }
        }
        _ => {}
    }

    // Migrations still waiting to run, or skipped for good, have no row to be
    // compared with.
    let ignored: Vec<&MigrationInfo> = infos
        .all()
        .iter()
        .filter(|i| {
            i.state() == MigrationState::Ignored
                && i.resolved().is_some_and(|r| r.executor().should_execute())
        })
        .collect();
    let unapplied: HashSet<&MigrationVersion> = infos
        .pending()
        .into_iter()
        .chain(ignored.iter().copied())
        .filter_map(|i| i.version())
        .collect();
    resolved.retain(|r| r.version.as_ref().is_some_and(|v| !unapplied.contains(v)));

    let mut versioned: Vec<&AppliedMigration> = applied
        .iter()
        .copied()
        .filter(|a| a.version.is_some() && !a.is_synthetic())
        .collect();
    versioned.sort_by(|a, b| {
        a.version
            .cmp(&b.version)
            .then(a.installed_rank.cmp(&b.installed_rank))
    });

    let mut violations = Vec::new();

    if versioned.len() > resolved.len() {
        let known: HashSet<&MigrationVersion> =
            resolved.iter().filter_map(|r| r.version.as_ref()).collect();
        let missing: Vec<String> = versioned
            .iter()
            .filter_map(|a| a.version.as_ref())
            .filter(|v| !known.contains(v))
            .map(|v| v.to_string())
            .collect();
        violations.push(ValidationViolation {
            kind: ViolationKind::CountMismatch,
            version: None,
            script: String::new(),
            message: format!(
                "Detected {} applied migrations, {} resolved locally. Not resolved: {}",
                versioned.len(),
                resolved.len(),
                missing.join(", ")
            ),
        });
    }

    for (applied, resolved) in versioned.iter().zip(resolved.iter()) {
        compare_pair(applied, resolved, &mut violations);
    }

    for info in &ignored {
        if options.skips(info) {
            continue;
        }
        violations.push(ValidationViolation {
            kind: ViolationKind::IgnoredMigration,
            version: info.version().map(|v| v.to_string()),
            script: info.script().to_string(),
            message: format!(
                "Detected resolved migration not applied to database: {}. \
                 Set ignore_migration_patterns = [\"*:ignored\"] to skip it, \
                 or enable out_of_order to apply it",
                info.label()
            ),
        });
    }

    for info in infos.failed() {
        if options.skips(info) {
            continue;
        }
        violations.push(ValidationViolation {
            kind: ViolationKind::FailedMigration,
            version: info.version().map(|v| v.to_string()),
            script: info.script().to_string(),
            message: format!(
                "Detected failed migration {} ({})",
                info.label(),
                info.description()
            ),
        });
    }

    for info in infos.all() {
        let Some(row) = info.applied() else { continue };
        if info.is_repeatable()
            && info.state() == MigrationState::MissingSuccess
            && !options.skips(info)
            && info.context().latest_repeatable_run(&row.description) == Some(row.installed_rank)
        {
            violations.push(ValidationViolation {
                kind: ViolationKind::MissingRepeatable,
                version: None,
                script: row.script.clone(),
                message: format!(
                    "Detected applied repeatable migration not resolved locally: {}",
                    row.description
                ),
            });
        }
    }

    if options.mode == ValidationMode::First {
        violations.truncate(1);
    }
    violations
}

fn compare_pair(
    applied: &AppliedMigration,
    resolved: &ResolvedMigration,
    violations: &mut Vec<ValidationViolation>,
) {
    let label = resolved.label();
    let version = resolved.version.as_ref().map(|v| v.to_string());

    if applied.version != resolved.version {
        violations.push(ValidationViolation {
            kind: ViolationKind::VersionMismatch,
            version: version.clone(),
            script: resolved.script.clone(),
            message: mismatch(
                "Version",
                &resolved.script,
                &display_version(applied.version.as_ref()),
                &display_version(resolved.version.as_ref()),
            ),
        });
        return;
    }

    if applied.migration_type != resolved.migration_type {
        violations.push(ValidationViolation {
            kind: ViolationKind::TypeMismatch,
            version: version.clone(),
            script: resolved.script.clone(),
            message: mismatch(
                "Type",
                &label,
                applied.migration_type.as_str(),
                resolved.migration_type.as_str(),
            ),
        });
    }

    if !resolved.checksum_matches(applied.checksum) {
        violations.push(ValidationViolation {
            kind: ViolationKind::ChecksumMismatch,
            version: version.clone(),
            script: resolved.script.clone(),
            message: mismatch(
                "Checksum",
                &label,
                &display_checksum(applied.checksum),
                &display_checksum(resolved.checksum),
            ),
        });
    }

    if applied.description != resolved.description {
        violations.push(ValidationViolation {
            kind: ViolationKind::DescriptionMismatch,
            version,
            script: resolved.script.clone(),
            message: mismatch("Description", &label, &applied.description, &resolved.description),
        });
    }
}

fn mismatch(what: &str, subject: &str, applied: &str, resolved: &str) -> String {
    format!(
        "{} mismatch for migration {}\n-> Applied to database : {}\n-> Resolved locally    : {}",
        what, subject, applied, resolved
    )
}

fn display_version(version: Option<&MigrationVersion>) -> String {
    version.map(|v| v.to_string()).unwrap_or_else(|| "<none>".to_string())
}

fn display_checksum(checksum: Option<i32>) -> String {
    checksum.map(|c| c.to_string()).unwrap_or_else(|| "<none>".to_string())
}
