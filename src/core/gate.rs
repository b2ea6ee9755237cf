//! The Gate: aggregates job results into one pass/fail decision.
//!
//! The gate depends on every fatal job. It passes only when each of them
//! reported `Passed` for the build being gated. A missing result, a result
//! recorded for another build, or a job stuck in a non-terminal state all
//! count as failures. Advisory jobs are reported but never block.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BuildId, JobResult, JobSpec, JobStatus, Severity};

/// Final outcome of a gate evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => f.write_str("passed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Why a fatal job blocks the gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum GateReason {
    /// No result was ever reported
    MissingResult { job: String },

    /// The recorded result belongs to another build
    ForeignResult { job: String, build_id: BuildId },

    /// The job never reached a terminal state
    NotTerminal { job: String, status: JobStatus },

    /// The job finished without passing
    NotPassed { job: String, status: JobStatus },
}

impl GateReason {
    pub fn job(&self) -> &str {
        match self {
            Self::MissingResult { job }
            | Self::ForeignResult { job, .. }
            | Self::NotTerminal { job, .. }
            | Self::NotPassed { job, .. } => job,
        }
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingResult { job } => write!(f, "{}: missing result", job),
            Self::ForeignResult { job, build_id } => {
                write!(f, "{}: result belongs to build {}", job, build_id)
            }
            Self::NotTerminal { job, status } => write!(f, "{}: still {}", job, status),
            Self::NotPassed { job, status } => write!(f, "{}: {}", job, status),
        }
    }
}

/// One row of the gate report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEntry {
    pub job: String,

    pub severity: Severity,

    /// Reported terminal status (missing results are reported as cancelled)
    pub status: JobStatus,

    /// No usable result was available
    pub missing: bool,

    /// This entry caused the gate to fail
    pub blocking: bool,

    pub reason: Option<String>,
}

/// Outcome of gating one build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub build_id: BuildId,

    pub status: GateStatus,

    /// One entry per declared job, in declaration order
    pub entries: Vec<GateEntry>,

    /// Blocking reasons (empty when passed)
    pub reasons: Vec<GateReason>,

    pub evaluated_at: DateTime<Utc>,
}

impl GateDecision {
    pub fn passed(&self) -> bool {
        self.status == GateStatus::Passed
    }

    pub fn entry(&self, job: &str) -> Option<&GateEntry> {
        self.entries.iter().find(|e| e.job == job)
    }

    /// Jobs that did not pass, fatal or not
    pub fn non_passing(&self) -> impl Iterator<Item = &GateEntry> {
        self.entries.iter().filter(|e| e.status != JobStatus::Passed)
    }

    /// One-line summary for logs and ledger events
    pub fn summary(&self) -> String {
        if self.passed() {
            return format!("Gate passed for build {}", self.build_id);
        }
        let reasons: Vec<String> = self.reasons.iter().map(ToString::to_string).collect();
        format!("Gate failed for build {}: {}", self.build_id, reasons.join("; "))
    }
}

/// Gate node over a pipeline's jobs
#[derive(Debug, Clone)]
pub struct Gate {
    jobs: Vec<(String, Severity)>,
}

impl Gate {
    pub fn new(specs: &[JobSpec]) -> Self {
        Self {
            jobs: specs.iter().map(|s| (s.name.clone(), s.severity)).collect(),
        }
    }

    /// Fatal jobs the gate depends on
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.jobs
            .iter()
            .filter(|(_, severity)| *severity == Severity::Fatal)
            .map(|(name, _)| name.as_str())
    }

    /// Every dependency has reported a terminal result for `build_id`
    pub fn is_ready(&self, build_id: &BuildId, results: &BTreeMap<String, JobResult>) -> bool {
        self.dependencies().all(|job| {
            results
                .get(job)
                .map(|r| &r.build_id == build_id && r.status.is_terminal())
                .unwrap_or(false)
        })
    }

    /// Decide the gate for `build_id`
    pub fn decide(&self, build_id: &BuildId, results: &BTreeMap<String, JobResult>) -> GateDecision {
        let mut entries = Vec::with_capacity(self.jobs.len());
        let mut reasons = Vec::new();

        for (job, severity) in &self.jobs {
            let (status, missing, reason, blocker) = match results.get(job) {
                None => (
                    JobStatus::Cancelled,
                    true,
                    Some("missing result".to_string()),
                    Some(GateReason::MissingResult { job: job.clone() }),
                ),
                Some(result) if &result.build_id != build_id => (
                    JobStatus::Cancelled,
                    true,
                    Some(format!("missing result (found one for build {})", result.build_id)),
                    Some(GateReason::ForeignResult {
                        job: job.clone(),
                        build_id: result.build_id.clone(),
                    }),
                ),
                Some(result) if !result.status.is_terminal() => (
                    JobStatus::Cancelled,
                    true,
                    Some(format!("missing result (job still {})", result.status)),
                    Some(GateReason::NotTerminal {
                        job: job.clone(),
                        status: result.status,
                    }),
                ),
                Some(result) if result.passed() => (JobStatus::Passed, false, None, None),
                Some(result) => (
                    result.status,
                    false,
                    result.reason.clone(),
                    Some(GateReason::NotPassed {
                        job: job.clone(),
                        status: result.status,
                    }),
                ),
            };

            let blocking = *severity == Severity::Fatal && blocker.is_some();
            if blocking {
                reasons.extend(blocker);
            }

            entries.push(GateEntry {
                job: job.clone(),
                severity: *severity,
                status,
                missing,
                blocking,
                reason,
            });
        }

        let status = if reasons.is_empty() {
            GateStatus::Passed
        } else {
            GateStatus::Failed
        };

        GateDecision {
            build_id: build_id.clone(),
            status,
            entries,
            reasons,
            evaluated_at: Utc::now(),
        }
    }
}

/// Decide the gate for `build_id` over `specs`
pub fn decide(
    specs: &[JobSpec],
    build_id: &BuildId,
    results: &BTreeMap<String, JobResult>,
) -> GateDecision {
    Gate::new(specs).decide(build_id, results)
}
