//! Domain types for the gencheck orchestrator.
//!
//! This module contains the core data structures:
//! - BuildId: Name of one generation run
//! - DirectoryTree: Generated files with modes
//! - Artifact: Packed tree metadata
//! - JobSpec / JobResult: Verification jobs and their outcomes
//! - DiffReport: Comparison of two generated trees
//! - Events / BuildRun: The per-build ledger and its replayed view

pub mod artifact;
pub mod build_id;
pub mod diff;
pub mod events;
pub mod job;
pub mod run;
pub mod tree;

// Re-export commonly used types
pub use artifact::{digest_bytes, Artifact, ArtifactFormat};
pub use build_id::{BuildId, BuildIdError};
pub use diff::{ChangeKind, DiffReport, DiffSummary, FileChange};
pub use events::{Event, EventType};
pub use job::{ErrorKind, InvalidTransition, JobLifecycle, JobResult, JobSpec, JobStatus, Severity};
pub use run::{BuildRun, BuildState};
pub use tree::{DirectoryTree, FileEntry, TreeError};
