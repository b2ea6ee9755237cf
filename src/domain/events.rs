//! Event types for the per-build ledger.
//!
//! Every state change of a build is recorded as an immutable event in an
//! append-only log; the build's view is derived by replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::Artifact;
use super::build_id::BuildId;
use super::job::JobResult;

/// A single event in the build ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The build this event belongs to
    pub build_id: BuildId,

    /// Job name (if applicable)
    pub job: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{build_id}:{scope}:{hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Revision the build was generated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Time taken in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Published artifact metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    /// Terminal job result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,

    /// Gate outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_passed: Option<bool>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        build_id: BuildId,
        job: Option<String>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            build_id,
            job,
            event_type,
            idempotency_key,
            payload_summary,
            revision: None,
            duration_ms: None,
            error: None,
            artifact: None,
            result: None,
            gate_passed: None,
        }
    }

    /// Record a terminal job result
    pub fn job_result(result: JobResult, idempotency_key: String) -> Self {
        let event_type = match result.status {
            super::job::JobStatus::Skipped => EventType::JobSkipped,
            super::job::JobStatus::Cancelled => EventType::JobCancelled,
            _ => EventType::JobFinished,
        };
        let summary = format!("Job '{}' {}", result.job, result.status);
        let mut event = Self::new(
            result.build_id.clone(),
            Some(result.job.clone()),
            event_type,
            idempotency_key,
            summary,
        )
        .with_duration(result.duration_ms);
        event.error = result.reason.clone();
        event.result = Some(result);
        event
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn with_gate(mut self, passed: bool) -> Self {
        self.gate_passed = Some(passed);
        self
    }
}

/// Types of events that can occur during a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Generation for a build has started
    RunStarted,

    /// The generator produced a tree
    GenerationCompleted,

    /// The generator failed; the build cannot proceed
    GenerationFailed,

    /// The packed tree was stored
    ArtifactPublished,

    /// Packing or storing failed; the build cannot proceed
    PackagingFailed,

    /// A job was dispatched
    JobStarted,

    /// A job reached Passed, Failed or Errored
    JobFinished,

    /// A job was never dispatched
    JobSkipped,

    /// A job was aborted or never reported
    JobCancelled,

    /// The gate produced a decision
    GateEvaluated,
}
