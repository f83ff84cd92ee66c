//! Migration versions and target selectors.
//!
//! A [`MigrationVersion`] is an ordered tuple of non-negative integers parsed
//! from strings such as `1`, `1.2.3` or `2024_01_15`. Comparison pads the
//! shorter tuple with zeros, which makes `1` and `1.0` the same version while
//! keeping `1 < 1.1 < 1.2 < 2.0`.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};

/// A comparable migration version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationVersion {
    kind: Kind,
}

#[derive(Debug, Clone)]
enum Kind {
    Empty,
    Numbered { parts: Vec<u64>, text: String },
    Latest,
}

impl MigrationVersion {
    /// The version of a schema with nothing applied. Sorts before every other version.
    pub const EMPTY: MigrationVersion = MigrationVersion { kind: Kind::Empty };

    /// The "latest" marker. Sorts after every numbered version.
    pub const LATEST: MigrationVersion = MigrationVersion { kind: Kind::Latest };

    /// Parse a dotted or underscored version string.
    pub fn parse(input: &str) -> MigrateResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(MigrationError::malformed_version(input, "version is empty"));
        }

        let text = trimmed.replace('_', ".");
        let mut parts = Vec::new();
        for component in text.split('.') {
            if component.is_empty() {
                return Err(MigrationError::malformed_version(
                    input,
                    "empty version component",
                ));
            }
            if !component.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MigrationError::malformed_version(
                    input,
                    "only 0..9, '.' and '_' are allowed",
                ));
            }
            let value = component.parse::<u64>().map_err(|_| {
                MigrationError::malformed_version(input, "version component is too large")
            })?;
            parts.push(value);
        }

        // Trailing zeros never change the ordering; dropping them keeps Hash consistent with Eq.
        while parts.len() > 1 && parts.last() == Some(&0) {
            parts.pop();
        }

        Ok(Self {
            kind: Kind::Numbered { parts, text },
        })
    }

    /// The numeric components, with trailing zeros removed. Empty for the markers.
    pub fn parts(&self) -> &[u64] {
        match &self.kind {
            Kind::Numbered { parts, .. } => parts,
            _ => &[],
        }
    }

    /// Whether this is the empty-schema marker.
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::Empty)
    }

    /// Whether this is the latest marker.
    pub fn is_latest(&self) -> bool {
        matches!(self.kind, Kind::Latest)
    }

    /// Whether this version sorts strictly after `other`.
    pub fn is_newer_than(&self, other: &MigrationVersion) -> bool {
        self > other
    }

    /// The string stored in the history table, `None` for the markers.
    pub fn as_stored(&self) -> Option<&str> {
        match &self.kind {
            Kind::Numbered { text, .. } => Some(text),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self.kind {
            Kind::Empty => 0,
            Kind::Numbered { .. } => 1,
            Kind::Latest => 2,
        }
    }
}

impl Ord for MigrationVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.kind, &other.kind) {
            (Kind::Numbered { parts: a, .. }, Kind::Numbered { parts: b, .. }) => {
                let longest = a.len().max(b.len());
                for i in 0..longest {
                    let left = a.get(i).copied().unwrap_or(0);
                    let right = b.get(i).copied().unwrap_or(0);
                    match left.cmp(&right) {
                        Ordering::Equal => continue,
                        unequal => return unequal,
                    }
                }
                Ordering::Equal
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for MigrationVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MigrationVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MigrationVersion {}

impl Hash for MigrationVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        self.parts().hash(state);
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Empty => write!(f, "<< Empty Schema >>"),
            Kind::Numbered { text, .. } => write!(f, "{}", text),
            Kind::Latest => write!(f, "<< Latest Version >>"),
        }
    }
}

impl FromStr for MigrationVersion {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MigrationVersion {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "" => Ok(Self::EMPTY),
            v if v.eq_ignore_ascii_case("latest") => Ok(Self::LATEST),
            v => Self::parse(v),
        }
    }
}

impl From<MigrationVersion> for String {
    fn from(version: MigrationVersion) -> Self {
        match version.kind {
            Kind::Empty => String::new(),
            Kind::Numbered { text, .. } => text,
            Kind::Latest => "latest".to_string(),
        }
    }
}

/// How far a `migrate` run should go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetVersion {
    /// Apply everything that is pending.
    #[default]
    Latest,
    /// Do not go beyond the highest version already applied.
    Current,
    /// Apply exactly one pending migration.
    Next,
    /// Apply up to and including this version.
    Version(MigrationVersion),
}

impl TargetVersion {
    /// The explicit version bound, if any.
    pub fn version(&self) -> Option<&MigrationVersion> {
        match self {
            Self::Version(v) => Some(v),
            _ => None,
        }
    }
}

impl FromStr for TargetVersion {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            Ok(Self::Latest)
        } else if s.eq_ignore_ascii_case("current") {
            Ok(Self::Current)
        } else if s.eq_ignore_ascii_case("next") {
            Ok(Self::Next)
        } else {
            MigrationVersion::parse(s).map(Self::Version)
        }
    }
}

impl TryFrom<String> for TargetVersion {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetVersion> for String {
    fn from(target: TargetVersion) -> Self {
        target.to_string()
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Current => write!(f, "current"),
            Self::Next => write!(f, "next"),
            Self::Version(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn v(s: &str) -> MigrationVersion {
        MigrationVersion::parse(s).unwrap()
    }

    #[test]
    fn test_generation_order() {
        let ordered = ["1", "1.1", "1.2", "2.0"].map(v);
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{} < {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_prefix_is_smaller() {
        assert!(v("1") < v("1.1"));
        assert!(v("1.0.1") > v("1"));
        assert_eq!(v("1").cmp(&v("1.0.0")), Ordering::Equal);
    }

    #[test]
    fn test_underscore_separator() {
        assert_eq!(v("1_2_3"), v("1.2.3"));
        assert_eq!(v("2024_01_15").to_string(), "2024.01.15");
    }

    #[test]
    fn test_leading_zeros_and_large_components() {
        assert_eq!(v("005"), v("5"));
        assert!(v("201004200021") > v("201004200020"));
    }

    #[test]
    fn test_malformed() {
        for bad in ["", "1.a", "1..2", "v1", "1.2-beta", "99999999999999999999999"] {
            let err = MigrationVersion::parse(bad).unwrap_err();
            assert!(matches!(err, MigrationError::MalformedVersion { .. }), "{bad}");
        }
    }

    #[test]
    fn test_markers() {
        assert!(MigrationVersion::EMPTY < v("0"));
        assert!(MigrationVersion::LATEST > v("999999.9"));
        assert!(MigrationVersion::EMPTY.as_stored().is_none());
        assert_eq!(v("1.2").as_stored(), Some("1.2"));
    }

    #[test]
    fn test_hash_consistent_with_eq() {
        let mut set = HashSet::new();
        set.insert(v("1"));
        assert!(set.contains(&v("1.0")));
        assert!(!set.contains(&v("1.1")));
    }

    #[test]
    fn test_total_order_is_antisymmetric() {
        let all = ["0", "1", "1.0.1", "1.1", "1.10", "1.2", "2", "10"].map(v);
        for a in &all {
            for b in &all {
                assert_eq!(a.cmp(b), b.cmp(a).reverse());
            }
        }
        assert!(v("1.2") < v("1.10"));
    }

    #[test]
    fn test_target_parse() {
        assert_eq!("latest".parse::<TargetVersion>().unwrap(), TargetVersion::Latest);
        assert_eq!("CURRENT".parse::<TargetVersion>().unwrap(), TargetVersion::Current);
        assert_eq!("next".parse::<TargetVersion>().unwrap(), TargetVersion::Next);
        assert_eq!(
            "3.1".parse::<TargetVersion>().unwrap(),
            TargetVersion::Version(v("3.1"))
        );
        assert!("soon".parse::<TargetVersion>().is_err());
    }
}
