//! Pipeline definitions and loading.
//!
//! A pipeline is defined in YAML: how to invoke the generator, which modules
//! and features to generate, where artifacts go, and the verification jobs
//! fanned out against every build.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::tree::normalize_relative_path;
use crate::domain::JobSpec;

use super::limits::Limits;

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// State directory, relative to the pipeline file (overridden by GENCHECK_HOME)
    #[serde(default)]
    pub home: Option<String>,

    /// External code generator invocation
    pub generator: GeneratorConfig,

    /// What to generate
    #[serde(default)]
    pub generation: GenerationOptions,

    /// Where artifacts and diff reports are stored
    #[serde(default)]
    pub storage: StorageConfig,

    /// Source repository used to resolve revisions
    #[serde(default)]
    pub source: SourceConfig,

    /// Resource limits for this pipeline
    #[serde(default)]
    pub limits: Limits,

    /// Review-comment publishing for diffs
    #[serde(default)]
    pub review: ReviewConfig,

    /// Verification jobs run against every artifact
    pub jobs: Vec<JobSpec>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.generator.command.is_empty() {
            anyhow::bail!("Generator command cannot be empty");
        }

        if self.limits.max_parallel_jobs == 0 {
            anyhow::bail!("limits.max_parallel_jobs must be at least 1");
        }

        normalize_relative_path(&self.storage.namespace)
            .with_context(|| format!("Invalid storage namespace '{}'", self.storage.namespace))?;

        if self.jobs.is_empty() {
            anyhow::bail!("Pipeline must have at least one job");
        }

        if !self.jobs.iter().any(JobSpec::is_fatal) {
            anyhow::bail!("Pipeline must have at least one fatal job");
        }

        let mut seen = HashSet::new();
        for (i, job) in self.jobs.iter().enumerate() {
            if job.name.is_empty() {
                anyhow::bail!("Job {} has an empty name", i);
            }
            if !seen.insert(job.name.as_str()) {
                anyhow::bail!("Duplicate job name '{}'", job.name);
            }
            if job.command.is_empty() {
                anyhow::bail!("Job '{}' has an empty command", job.name);
            }
            if let Some(ref dir) = job.working_dir {
                normalize_relative_path(dir).with_context(|| {
                    format!("Job '{}' has an invalid working_dir '{}'", job.name, dir)
                })?;
            }
        }

        Ok(())
    }

    /// Get a job by name
    pub fn get_job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Names of every environment input some job or adapter reads
    pub fn environment_inputs(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .jobs
            .iter()
            .flat_map(|j| j.required_env.iter().chain(j.pass_env.iter()))
            .cloned()
            .collect();
        if let Some(ref token_env) = self.review.token_env {
            names.push(token_env.clone());
        }
        names.sort();
        names.dedup();
        names
    }
}

/// How to invoke the external code generator
///
/// Arguments may contain `{revision}`, `{output}`, `{modules}` and
/// `{features}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Program and arguments
    pub command: Vec<String>,

    /// Generation timeout in seconds (default: 3600)
    #[serde(default = "default_generator_timeout")]
    pub timeout_seconds: u64,

    /// Extra environment for the generator process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_generator_timeout() -> u64 {
    3600
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Generation options passed to the generator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Service modules to include (empty = generator default)
    #[serde(default)]
    pub modules: Vec<String>,

    /// Feature flags
    #[serde(default)]
    pub features: Vec<String>,
}

/// Object storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the filesystem object store (default: <home>/objects)
    #[serde(default)]
    pub root: Option<String>,

    /// Key prefix for everything this pipeline stores
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "gencheck".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            namespace: default_namespace(),
        }
    }
}

/// Source repository settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Git repository used to resolve revision references (relative to the
    /// pipeline file). Without one, references are used verbatim.
    #[serde(default)]
    pub repository: Option<String>,
}

/// Review-comment publishing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Default thread (e.g. pull request) to comment on
    #[serde(default)]
    pub thread_id: Option<String>,

    /// Webhook receiving `{thread_id, body}`; comments are only logged without one
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Environment input holding a bearer token for the webhook
    #[serde(default)]
    pub token_env: Option<String>,

    /// Retry policy for posting comments
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Backoff for posting review comments.
///
/// Only the comment step is retried; generation and storage failures are not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    #[serde(default = "default_comment_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_comment_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single wait
    #[serde(default = "default_comment_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_comment_attempts() -> u32 {
    4
}
fn default_comment_delay_ms() -> u64 {
    500
}
fn default_comment_max_delay_ms() -> u64 {
    8_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_comment_attempts(),
            initial_delay_ms: default_comment_delay_ms(),
            max_delay_ms: default_comment_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Wait before attempt `failed + 1`, after `failed` failures (1-indexed)
    pub fn delay_for_attempt(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn should_retry(&self, failed: u32) -> bool {
        failed < self.max_attempts
    }
}
