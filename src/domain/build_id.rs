//! Build identifiers.
//!
//! A `BuildId` names exactly one generation run. It doubles as a path
//! segment and an object-store key segment, so the alphabet is restricted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of commit characters kept in derived identifiers
const COMMIT_PREFIX_LEN: usize = 12;

/// Unique, immutable name of one generation run
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BuildId(String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildIdError {
    #[error("Build identifier cannot be empty")]
    Empty,

    #[error("Build identifier '{0}' contains characters outside [A-Za-z0-9._-]")]
    InvalidCharacters(String),

    #[error("Build identifier '{0}' cannot start with '.'")]
    LeadingDot(String),
}

impl BuildId {
    /// Accept an explicit identifier such as `rev-abc123`
    pub fn new(value: impl Into<String>) -> Result<Self, BuildIdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(BuildIdError::Empty);
        }
        if value.starts_with('.') {
            return Err(BuildIdError::LeadingDot(value));
        }
        let valid = value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(BuildIdError::InvalidCharacters(value));
        }
        Ok(Self(value))
    }

    /// Derive an identifier from a resolved commit and a run attempt number.
    ///
    /// Format: `rev-<first 12 commit chars>-<attempt>`. Characters outside the
    /// allowed alphabet are replaced with `_`.
    pub fn derive(commit: &str, attempt: u32) -> Self {
        let prefix: String = commit
            .chars()
            .take(COMMIT_PREFIX_LEN)
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let prefix = if prefix.is_empty() { "unknown".to_string() } else { prefix };
        Self(format!("rev-{}-{}", prefix, attempt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BuildId {
    type Err = BuildIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BuildId {
    type Error = BuildIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BuildId> for String {
    fn from(id: BuildId) -> Self {
        id.0
    }
}
