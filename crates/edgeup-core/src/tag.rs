use std::cmp::Ordering;
use std::fmt;

use anyhow::{anyhow, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

/// Identifier of a published release. Two tags name the same release only
/// when their text is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionTag(String);

impl VersionTag {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("version tag must not be empty"));
        }
        if trimmed.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
            return Err(anyhow!(
                "version tag must not contain whitespace: '{trimmed}'"
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Semantic version view of the tag, accepting an optional `v` prefix.
    pub fn semver(&self) -> Option<Version> {
        let stripped = self
            .0
            .strip_prefix('v')
            .or_else(|| self.0.strip_prefix('V'))
            .unwrap_or(&self.0);
        Version::parse(stripped).ok()
    }

    /// Recency order between two tags when both are semantic versions.
    pub fn compare_recency(&self, other: &Self) -> Option<Ordering> {
        Some(self.semver()?.cmp(&other.semver()?))
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VersionTag {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<VersionTag> for String {
    fn from(value: VersionTag) -> Self {
        value.0
    }
}
