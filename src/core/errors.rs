//! Pipeline-level failures and their process exit codes.
//!
//! Job failures are data (a `JobResult`), not errors. What ends up here is
//! what stops a stage outright, classified so the CLI can exit with a code
//! per category.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapters::GenerationError;
use crate::domain::{BuildId, JobStatus};

use super::publisher::PublishError;

/// Failure categories, each with a distinct exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Anything not classified below
    Unexpected,
    Config,
    Generation,
    Packaging,
    Job,
    Gate,
    DiffGeneration,
    Publish,
}

impl FailureCategory {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Unexpected => 1,
            Self::Config => 2,
            Self::Generation => 10,
            Self::Packaging => 11,
            Self::Job => 12,
            Self::Gate => 13,
            Self::DiffGeneration => 14,
            Self::Publish => 15,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unexpected => "unexpected",
            Self::Config => "config",
            Self::Generation => "generation",
            Self::Packaging => "packaging",
            Self::Job => "job",
            Self::Gate => "gate",
            Self::DiffGeneration => "diff-generation",
            Self::Publish => "publish",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Generation failed for revision '{revision}': {source}")]
    Generation {
        revision: String,
        #[source]
        source: GenerationError,
    },

    #[error("Packaging failed for build {build_id}: {reason}")]
    Packaging { build_id: BuildId, reason: String },

    #[error("Job '{job}' did not pass: {status}")]
    Job { job: String, status: JobStatus },

    #[error("Gate failed for build {build_id}")]
    Gate { build_id: BuildId },

    /// A build stopped before its jobs ran; `category` is the failed stage
    #[error("Build {build_id} aborted: {message}")]
    Aborted {
        build_id: BuildId,
        category: FailureCategory,
        message: String,
    },

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl PipelineError {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Config(_) => FailureCategory::Config,
            Self::Generation { .. } => FailureCategory::Generation,
            Self::Packaging { .. } => FailureCategory::Packaging,
            Self::Job { .. } => FailureCategory::Job,
            Self::Gate { .. } => FailureCategory::Gate,
            Self::Aborted { category, .. } => *category,
            Self::Publish(e) => e.category(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.category().exit_code()
    }
}

/// Category of any error surfaced to the CLI
pub fn categorize(error: &anyhow::Error) -> FailureCategory {
    if let Some(e) = error.downcast_ref::<PipelineError>() {
        return e.category();
    }
    if let Some(e) = error.downcast_ref::<PublishError>() {
        return e.category();
    }
    FailureCategory::Unexpected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_exit_codes_are_distinct() {
        let all = [
            FailureCategory::Unexpected,
            FailureCategory::Config,
            FailureCategory::Generation,
            FailureCategory::Packaging,
            FailureCategory::Job,
            FailureCategory::Gate,
            FailureCategory::DiffGeneration,
            FailureCategory::Publish,
        ];
        let codes: HashSet<u8> = all.iter().map(|c| c.exit_code()).collect();
        assert_eq!(codes.len(), all.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_categorize_through_anyhow() {
        let err: anyhow::Error = PipelineError::Gate {
            build_id: BuildId::new("rev-1").unwrap(),
        }
        .into();
        assert_eq!(categorize(&err), FailureCategory::Gate);
        assert_eq!(categorize(&err.context("while gating")), FailureCategory::Gate);

        let other = anyhow::anyhow!("boom");
        assert_eq!(categorize(&other), FailureCategory::Unexpected);
    }

    #[test]
    fn test_aborted_build_exits_with_its_stage() {
        let err: anyhow::Error = PipelineError::Aborted {
            build_id: BuildId::new("rev-1").unwrap(),
            category: FailureCategory::Packaging,
            message: "artifact too large".to_string(),
        }
        .into();
        assert_eq!(categorize(&err), FailureCategory::Packaging);
        assert_eq!(categorize(&err).exit_code(), 11);
    }
}
