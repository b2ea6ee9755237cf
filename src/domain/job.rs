//! Verification jobs: declarations, lifecycle, and outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::build_id::BuildId;

/// Declarative description of one verification job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name (unique within a pipeline)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,

    /// Program and arguments, run with the unpacked artifact as working root
    pub command: Vec<String>,

    /// Fixed environment variables for the job process
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Environment inputs that must be available; missing ones skip the job
    #[serde(default)]
    pub required_env: Vec<String>,

    /// Captured environment inputs forwarded to the job when present
    #[serde(default)]
    pub pass_env: Vec<String>,

    /// Whether a failure blocks the gate
    #[serde(default)]
    pub severity: Severity,

    /// Directory inside the artifact to run in (per-module checks)
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Override of the pipeline's job timeout
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            command,
            env: BTreeMap::new(),
            required_env: Vec::new(),
            pass_env: Vec::new(),
            severity: Severity::Fatal,
            working_dir: None,
            timeout_seconds: None,
        }
    }

    /// Mark the job advisory-only
    pub fn advisory(mut self) -> Self {
        self.severity = Severity::Advisory;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_required_env(mut self, name: impl Into<String>) -> Self {
        self.required_env.push(name.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    /// Effective timeout given the pipeline default
    pub fn timeout(&self, default_seconds: u64) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(default_seconds))
    }
}

/// Whether a job failure blocks the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Fatal,
    Advisory,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Fatal
    }
}

/// Lifecycle status of a job
///
/// `Pending -> Running -> {Passed, Failed, Errored}`; `Skipped` only from
/// `Pending`; `Cancelled` from either non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Errored,
    Skipped,
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Running, Passed)
                | (Running, Failed)
                | (Running, Errored)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Invalid job transition: {from} → {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Tracks one job through its state machine
#[derive(Debug, Clone, Default)]
pub struct JobLifecycle {
    status: JobStatus,
}

impl JobLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn advance(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Why a job ended in `Errored`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Exceeded its wall-clock limit and was killed
    Timeout,
    /// Terminated by a signal or the task panicked
    Crash,
    /// Could not be started
    Spawn,
    /// The artifact could not be fetched or unpacked
    Unpack,
    /// The working directory could not be prepared
    Workspace,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Crash => "crash",
            Self::Spawn => "spawn",
            Self::Unpack => "unpack",
            Self::Workspace => "workspace",
        };
        f.write_str(s)
    }
}

/// Outcome of one job execution. Never mutated after completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Name of the job that produced this result
    pub job: String,

    /// Build the job ran against
    pub build_id: BuildId,

    /// Digest of the artifact that was unpacked (if it got that far)
    pub artifact_digest: Option<String>,

    /// Terminal status
    pub status: JobStatus,

    /// Cause for `Errored`
    pub error_kind: Option<ErrorKind>,

    /// Short explanation for non-passing outcomes
    pub reason: Option<String>,

    /// Process exit code, when the process exited normally
    pub exit_code: Option<i32>,

    /// Captured stdout (tail, possibly truncated)
    #[serde(default)]
    pub stdout: String,

    /// Captured stderr (tail, possibly truncated)
    #[serde(default)]
    pub stderr: String,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,

    /// When the job reached its terminal state
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn new(job: impl Into<String>, build_id: BuildId, status: JobStatus) -> Self {
        Self {
            job: job.into(),
            build_id,
            artifact_digest: None,
            status,
            error_kind: None,
            reason: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            finished_at: Utc::now(),
        }
    }

    pub fn skipped(job: impl Into<String>, build_id: BuildId, reason: impl Into<String>) -> Self {
        Self::new(job, build_id, JobStatus::Skipped).with_reason(reason)
    }

    pub fn cancelled(job: impl Into<String>, build_id: BuildId, reason: impl Into<String>) -> Self {
        Self::new(job, build_id, JobStatus::Cancelled).with_reason(reason)
    }

    pub fn errored(
        job: impl Into<String>,
        build_id: BuildId,
        kind: ErrorKind,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(job, build_id, JobStatus::Errored).with_reason(reason);
        result.error_kind = Some(kind);
        result
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_artifact_digest(mut self, digest: impl Into<String>) -> Self {
        self.artifact_digest = Some(digest.into());
        self
    }

    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn passed(&self) -> bool {
        self.status == JobStatus::Passed
    }
}
