//! Capability interfaces for external systems.
//!
//! The orchestrator only talks to the outside world through these traits:
//! the code generator, object storage, source control, the renderer for
//! diff reports, and the review-comment platform.

pub mod generator;
pub mod object_store;
pub mod render;
pub mod review;
pub mod scm;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::pipeline::GenerationOptions;
use crate::domain::{DiffReport, DirectoryTree};

pub use generator::{CommandGenerator, GenerationError};
pub use object_store::{FsObjectStore, MemoryObjectStore, StoreError};
pub use render::TextRenderer;
pub use review::{LogCommenter, WebhookCommenter};
pub use scm::{GitSourceControl, PassthroughRevisions};

/// External code generator
#[async_trait]
pub trait Generator: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Generate the tree for `revision` into `output_dir` and read it back.
    ///
    /// All-or-nothing: any failure means no usable tree.
    async fn generate(
        &self,
        revision: &str,
        options: &GenerationOptions,
        output_dir: &Path,
    ) -> Result<DirectoryTree, GenerationError>;
}

/// Key/value blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;

    /// Store bytes under `key`, replacing any existing value
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Store bytes under `key` only if nothing is stored there yet
    async fn put_new(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove `key`; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Resolves revision references to immutable snapshots
#[async_trait]
pub trait SourceControl: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve a reference (branch, tag, short hash) to a commit id
    async fn resolve(&self, reference: &str) -> Result<String>;
}

/// Turns a diff report into a reviewable document
pub trait ReportRenderer: Send + Sync {
    fn name(&self) -> &str;

    /// File extension of rendered documents
    fn extension(&self) -> &str;

    fn render(&self, report: &DiffReport) -> Result<Vec<u8>>;
}

/// Posts comments to a review thread
#[async_trait]
pub trait ReviewCommenter: Send + Sync {
    fn name(&self) -> &str;

    async fn post_comment(&self, thread_id: &str, body: &str) -> Result<CommentReceipt>;
}

/// Confirmation of a posted comment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentReceipt {
    pub thread_id: String,

    /// Platform-assigned id, when the platform returns one
    pub comment_id: Option<String>,

    pub posted_at: DateTime<Utc>,
}

impl CommentReceipt {
    pub fn new(thread_id: impl Into<String>, comment_id: Option<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            comment_id,
            posted_at: Utc::now(),
        }
    }
}
