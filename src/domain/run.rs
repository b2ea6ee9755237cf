//! Build state reconstructed from the ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifact::Artifact;
use super::build_id::BuildId;
use super::events::{Event, EventType};
use super::job::{JobResult, JobStatus};

/// View of one build, derived by replaying its events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRun {
    pub build_id: BuildId,

    /// Revision the build was generated from
    pub revision: Option<String>,

    pub state: BuildState,

    pub started_at: DateTime<Utc>,

    /// Set once generation or packaging failed, or the gate ran
    pub completed_at: Option<DateTime<Utc>>,

    /// Published artifact, if packaging succeeded
    pub artifact: Option<Artifact>,

    /// Latest status per job
    pub job_statuses: BTreeMap<String, JobStatus>,

    /// Latest terminal result per job
    pub results: BTreeMap<String, JobResult>,
}

impl BuildRun {
    pub fn new(build_id: BuildId) -> Self {
        Self {
            build_id,
            revision: None,
            state: BuildState::Generating,
            started_at: Utc::now(),
            completed_at: None,
            artifact: None,
            job_statuses: BTreeMap::new(),
            results: BTreeMap::new(),
        }
    }

    /// Reconstruct from a sequence of events. Events of other builds are ignored.
    pub fn from_events(build_id: &BuildId, events: &[Event]) -> Option<Self> {
        let mut own = events.iter().filter(|e| &e.build_id == build_id).peekable();
        let first = own.peek()?;

        let mut run = Self::new(build_id.clone());
        run.started_at = first.timestamp;

        for event in own {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update build state
    pub fn apply_event(&mut self, event: &Event) {
        if event.build_id != self.build_id {
            return;
        }

        match event.event_type {
            EventType::RunStarted => {
                self.state = BuildState::Generating;
                self.started_at = event.timestamp;
                if event.revision.is_some() {
                    self.revision = event.revision.clone();
                }
            }
            EventType::GenerationCompleted => {
                self.state = BuildState::Generated;
                if event.revision.is_some() {
                    self.revision = event.revision.clone();
                }
            }
            EventType::GenerationFailed => {
                self.state = BuildState::GenerationFailed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::ArtifactPublished => {
                self.state = BuildState::Packaged;
                self.artifact = event.artifact.clone();
            }
            EventType::PackagingFailed => {
                self.state = BuildState::PackagingFailed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::JobStarted => {
                if let Some(ref job) = event.job {
                    self.job_statuses.insert(job.clone(), JobStatus::Running);
                }
            }
            EventType::JobFinished | EventType::JobSkipped | EventType::JobCancelled => {
                if let Some(ref result) = event.result {
                    if result.build_id == self.build_id {
                        self.job_statuses.insert(result.job.clone(), result.status);
                        self.results.insert(result.job.clone(), result.clone());
                    }
                }
            }
            EventType::GateEvaluated => {
                // An aborted build stays aborted; its gate can only fail
                if !self.is_aborted() {
                    self.state = BuildState::Gated {
                        passed: event.gate_passed.unwrap_or(false),
                    };
                }
                self.completed_at = Some(event.timestamp);
            }
        }
    }

    /// Generation or packaging failed; no artifact will ever exist
    pub fn is_aborted(&self) -> bool {
        matches!(
            self.state,
            BuildState::GenerationFailed { .. } | BuildState::PackagingFailed { .. }
        )
    }
}

/// State of a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BuildState {
    Generating,
    Generated,
    Packaged,
    GenerationFailed { error: String },
    PackagingFailed { error: String },
    Gated { passed: bool },
}

impl Default for BuildState {
    fn default() -> Self {
        Self::Generating
    }
}
