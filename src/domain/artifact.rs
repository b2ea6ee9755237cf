//! Artifacts produced by a generation run.
//!
//! An artifact is the packed directory tree of one build. Once published the
//! bytes belong to the Artifact Store; everyone else holds the metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::build_id::BuildId;

/// Metadata of a published artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Build this artifact belongs to (at most one artifact per build)
    pub build_id: BuildId,

    /// Revision the generator ran against
    pub source_revision: String,

    /// Container format of the blob
    #[serde(default)]
    pub format: ArtifactFormat,

    /// Size of the packed blob in bytes
    pub size_bytes: u64,

    /// Number of files in the packed tree
    pub file_count: usize,

    /// Hex SHA-256 of the packed blob
    pub digest: String,

    /// When the artifact was created
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Describe a freshly packed blob
    pub fn new(build_id: BuildId, source_revision: String, bytes: &[u8], file_count: usize) -> Self {
        Self {
            build_id,
            source_revision,
            format: ArtifactFormat::Zip,
            size_bytes: bytes.len() as u64,
            file_count,
            digest: digest_bytes(bytes),
            created_at: Utc::now(),
        }
    }

    /// Check a blob against the recorded digest and size
    pub fn matches(&self, bytes: &[u8]) -> bool {
        self.size_bytes == bytes.len() as u64 && self.digest == digest_bytes(bytes)
    }
}

/// Container formats an artifact can be packed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    Zip,
}

impl Default for ArtifactFormat {
    fn default() -> Self {
        Self::Zip
    }
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
        }
    }
}

/// Hex-encoded SHA-256 of a byte slice
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_creation() {
        let build_id = BuildId::new("rev-abc123").unwrap();
        let artifact = Artifact::new(build_id.clone(), "abc123".to_string(), b"packed", 3);

        assert_eq!(artifact.build_id, build_id);
        assert_eq!(artifact.size_bytes, 6);
        assert_eq!(artifact.file_count, 3);
        assert_eq!(artifact.digest.len(), 64);
        assert!(artifact.matches(b"packed"));
        assert!(!artifact.matches(b"tampered"));
    }

    #[test]
    fn test_artifact_serialization() {
        let artifact = Artifact::new(
            BuildId::new("rev-1").unwrap(),
            "main".to_string(),
            b"bytes",
            1,
        );

        let json = serde_json::to_string(&artifact).unwrap();
        let parsed: Artifact = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, artifact);
        assert_eq!(parsed.format.extension(), "zip");
    }
}
