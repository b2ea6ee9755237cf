//! Core orchestration logic.
//!
//! This module contains:
//! - Packager / ArtifactStore: Packing builds and write-once storage
//! - JobRunner: Isolated execution of one verification job
//! - Gate: Aggregation of job results into a decision
//! - Orchestrator: Sequencing of a build and its ledger
//! - DiffPublisher: Comparison of two revisions' generated code
//! - Pipeline / Limits: Pipeline definitions and resource bounds

pub mod errors;
pub mod event_store;
pub mod gate;
pub mod limits;
pub mod orchestrator;
pub mod packager;
pub mod pipeline;
pub mod publisher;
pub mod runner;
pub mod store;

// Re-export commonly used types
pub use errors::{categorize, FailureCategory, PipelineError};
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use gate::{Gate, GateDecision, GateEntry, GateReason, GateStatus};
pub use limits::{LimitViolation, Limits, OutputTail};
pub use orchestrator::{Abort, GeneratedBuild, Orchestrator, PipelineReport};
pub use packager::{PackError, UnpackError};
pub use pipeline::{GenerationOptions, Pipeline, RetryPolicy};
pub use publisher::{DiffPublisher, DiffSide, PublishError, PublishReceipt};
pub use runner::JobRunner;
pub use store::ArtifactStore;
