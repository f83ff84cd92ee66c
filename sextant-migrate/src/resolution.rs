//! Merging migration sources into one ordered list.
//!
//! Every source is asked for its migrations, the results are concatenated,
//! exact duplicates are dropped, and two different migrations that claim the
//! same version (or, for repeatables, the same description) are reported as a
//! conflict naming both physical locations. The result is sorted versioned
//! first, then repeatables by description. The sort is stable, so entries with
//! equal keys keep their source order.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{MigrateResult, MigrationError};
use crate::migration::ResolvedMigration;
use crate::source::MigrationSource;
use crate::version::MigrationVersion;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Version(MigrationVersion),
    Description(String),
}

impl Key {
    fn of(migration: &ResolvedMigration) -> Self {
        match &migration.version {
            Some(v) => Key::Version(v.clone()),
            None => Key::Description(migration.description.clone()),
        }
    }

    fn label(&self) -> String {
        match self {
            Key::Version(v) => format!("version {}", v),
            Key::Description(d) => format!("description {}", d),
        }
    }
}

/// Deduplicate, conflict-check and sort already resolved migrations.
pub fn merge(migrations: Vec<ResolvedMigration>) -> MigrateResult<Vec<ResolvedMigration>> {
    let mut seen: HashMap<Key, usize> = HashMap::new();
    let mut merged: Vec<ResolvedMigration> = Vec::with_capacity(migrations.len());

    for migration in migrations {
        let key = Key::of(&migration);
        match seen.get(&key) {
            Some(&index) => {
                let existing = &merged[index];
                if existing.same_definition(&migration) {
                    debug!(script = %migration.script, "Dropping duplicate migration");
                    continue;
                }
                return Err(MigrationError::ResolutionConflict {
                    key: key.label(),
                    first: existing.physical_location.clone(),
                    second: migration.physical_location.clone(),
                });
            }
            None => {
                seen.insert(key, merged.len());
                merged.push(migration);
            }
        }
    }

    merged.sort_by(|a, b| a.ordering(b));
    Ok(merged)
}

/// Merges several migration sources.
#[derive(Default, Clone)]
pub struct CompositeResolver {
    sources: Vec<Arc<dyn MigrationSource>>,
}

impl CompositeResolver {
    /// Create a resolver with no sources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source. Sources are consulted in the order they were added.
    pub fn with_source(mut self, source: impl MigrationSource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    /// Add a shared source.
    pub fn with_shared_source(mut self, source: Arc<dyn MigrationSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Number of sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Resolve every source and merge the results.
    pub async fn resolve(&self) -> MigrateResult<Vec<ResolvedMigration>> {
        resolve(&self.sources).await
    }
}

/// Resolve `sources` in order and merge the results.
pub async fn resolve(
    sources: &[Arc<dyn MigrationSource>],
) -> MigrateResult<Vec<ResolvedMigration>> {
    let mut all = Vec::new();
    for source in sources {
        let found = source.resolve().await?;
        debug!(source = source.name(), count = found.len(), "Source resolved");
        all.extend(found);
    }
    merge(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::SqlScriptExecutor;
    use crate::source::StaticSource;

    fn versioned(version: &str, script: &str, checksum: i32, location: &str) -> ResolvedMigration {
        ResolvedMigration::versioned(
            MigrationVersion::parse(version).unwrap(),
            "desc",
            script,
            Arc::new(SqlScriptExecutor::new("SELECT 1")),
        )
        .with_checksum(checksum)
        .with_location(location)
    }

    fn repeatable(description: &str, checksum: i32) -> ResolvedMigration {
        ResolvedMigration::repeatable(
            description,
            format!("R__{}.sql", description),
            Arc::new(SqlScriptExecutor::new("SELECT 1")),
        )
        .with_checksum(checksum)
    }

    fn scripts(list: &[ResolvedMigration]) -> Vec<&str> {
        list.iter().map(|m| m.script.as_str()).collect()
    }

    #[test]
    fn test_sorts_versioned_then_repeatable() {
        let merged = merge(vec![
            repeatable("b", 1),
            versioned("1.2", "V1_2.sql", 1, "x"),
            repeatable("a", 1),
            versioned("1", "V1.sql", 1, "x"),
            versioned("1.1", "V1_1.sql", 1, "x"),
        ])
        .unwrap();
        assert_eq!(
            scripts(&merged),
            vec!["V1.sql", "V1_1.sql", "V1_2.sql", "R__a.sql", "R__b.sql"]
        );
    }

    #[test]
    fn test_exact_duplicates_are_dropped() {
        let merged = merge(vec![
            versioned("1", "V1.sql", 7, "a/V1.sql"),
            versioned("1", "V1.sql", 7, "b/V1.sql"),
        ])
        .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].physical_location, "a/V1.sql");
    }

    #[test]
    fn test_version_conflict_names_both_locations() {
        let err = merge(vec![
            versioned("1.1", "V1_1__View.sql", 1, "db/a/V1_1__View.sql"),
            versioned("1.1", "V1_1__Other.sql", 2, "db/b/V1_1__Other.sql"),
        ])
        .unwrap_err();
        match err {
            MigrationError::ResolutionConflict { key, first, second } => {
                assert_eq!(key, "version 1.1");
                assert_eq!(first, "db/a/V1_1__View.sql");
                assert_eq!(second, "db/b/V1_1__Other.sql");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_equal_versions_written_differently_conflict() {
        assert!(merge(vec![
            versioned("1", "V1.sql", 1, "a"),
            versioned("1.0", "V1_0.sql", 1, "b"),
        ])
        .is_err());
    }

    #[test]
    fn test_repeatable_conflict() {
        let err = merge(vec![repeatable("views", 1), repeatable("views", 2)]).unwrap_err();
        assert!(err.to_string().contains("description views"));
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic() {
        let resolver = CompositeResolver::new()
            .with_source(StaticSource::new(
                "one",
                vec![versioned("2", "V2.sql", 2, "x"), repeatable("r", 1)],
            ))
            .with_source(StaticSource::new(
                "two",
                vec![versioned("1", "V1.sql", 1, "y")],
            ));
        let first = resolver.resolve().await.unwrap();
        let second = resolver.resolve().await.unwrap();
        assert_eq!(format!("{:?}", first), format!("{:?}", second));
        assert_eq!(scripts(&first), vec!["V1.sql", "V2.sql", "R__r.sql"]);
    }
}
