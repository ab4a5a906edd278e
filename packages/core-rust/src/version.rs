//! Microservice versions and version-rule matching for discovery queries.
//!
//! Versions are up to four dot-separated numeric segments (`1`, `1.2`,
//! `1.2.3`, `1.2.3.4`); missing segments are zero. Rules:
//!
//! | rule          | meaning                          |
//! |---------------|----------------------------------|
//! | `latest`      | highest version present          |
//! | `1.2.3`       | exactly that version             |
//! | `1.2.3+`      | that version or newer            |
//! | `1.0.0-2.0.0` | `[1.0.0, 2.0.0)`                 |
//! | `0+`          | any version                      |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionRuleError {
    #[error("invalid version {0:?}")]
    InvalidVersion(String),
    #[error("invalid version rule {0:?}")]
    InvalidRule(String),
}

/// A numeric microservice version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl Version {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build: 0,
        }
    }
}

impl FromStr for Version {
    type Err = VersionRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionRuleError::InvalidVersion(s.to_string());
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let mut parts = [0u32; 4];
        let mut count = 0;
        for segment in trimmed.split('.') {
            if count == parts.len() {
                return Err(invalid());
            }
            parts[count] = segment.parse().map_err(|_| invalid())?;
            count += 1;
        }

        Ok(Self {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
            build: parts[3],
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.build != 0 {
            write!(f, ".{}", self.build)?;
        }
        Ok(())
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A rule selecting a subset of versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRule {
    Latest,
    Exact(Version),
    AtLeast(Version),
    /// Half-open range `[from, to)`.
    Range(Version, Version),
}

impl VersionRule {
    /// Matches every version.
    pub const ALL: Self = Self::AtLeast(Version::new(0, 0, 0));

    /// Returns `true` if `version` satisfies the rule. `latest` is the
    /// highest version among the candidates being filtered.
    #[must_use]
    pub fn matches(&self, version: &Version, latest: &Version) -> bool {
        match self {
            Self::Latest => version == latest,
            Self::Exact(v) => version == v,
            Self::AtLeast(v) => version >= v,
            Self::Range(from, to) => version >= from && version < to,
        }
    }

    /// Filters `candidates` down to those matching the rule.
    pub fn select<'a, T, F>(&self, candidates: &'a [T], version_of: F) -> Vec<&'a T>
    where
        F: Fn(&T) -> Version,
    {
        let Some(latest) = candidates.iter().map(&version_of).max() else {
            return Vec::new();
        };
        candidates
            .iter()
            .filter(|c| self.matches(&version_of(*c), &latest))
            .collect()
    }
}

impl FromStr for VersionRule {
    type Err = VersionRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rule = s.trim();
        let invalid = || VersionRuleError::InvalidRule(s.to_string());

        if rule.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        if let Some(base) = rule.strip_suffix('+') {
            return base.parse().map(Self::AtLeast).map_err(|_| invalid());
        }
        if let Some((from, to)) = rule.split_once('-') {
            let from: Version = from.parse().map_err(|_| invalid())?;
            let to: Version = to.parse().map_err(|_| invalid())?;
            if from >= to {
                return Err(invalid());
            }
            return Ok(Self::Range(from, to));
        }
        rule.parse().map(Self::Exact).map_err(|_| invalid())
    }
}

impl fmt::Display for VersionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(v) => write!(f, "{v}"),
            Self::AtLeast(v) => write!(f, "{v}+"),
            Self::Range(from, to) => write!(f, "{from}-{to}"),
        }
    }
}
