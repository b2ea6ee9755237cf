//! gencheck - Build-and-verification pipeline for generated code
//!
//! Turns a source revision into generated code, packs it into an immutable
//! artifact, fans the artifact out to independent verification jobs, and
//! gates the build on the fatal ones. A separate flow generates two
//! revisions and publishes the diff of their generated code for review.
//!
//! # Architecture
//!
//! Every build has an append-only ledger:
//! - Each stage records its outcome as an immutable event
//! - The build's state is derived by replaying its events
//! - Stages can run in separate processes and still share state
//!
//! # Modules
//!
//! - `adapters`: External systems (generator, object store, git, review)
//! - `core`: Packager, artifact store, runner, gate, orchestrator, diffs
//! - `domain`: Data structures (BuildId, DirectoryTree, JobResult, Event)
//! - `config`: Pipeline file discovery and resolution
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Stage by stage
//! id=$(gencheck generate main)
//! gencheck package "$id"
//! gencheck verify "$id" unit-tests
//! gencheck gate "$id"
//!
//! # All at once
//! gencheck run main
//!
//! # Diff two revisions and comment on a review thread
//! gencheck diff v1.0 v1.1 --thread 1234
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{DiffPublisher, Orchestrator, PipelineError};
pub use domain::{BuildId, DiffReport, DirectoryTree, JobResult, JobSpec, JobStatus};
