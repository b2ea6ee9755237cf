//! Diff Publisher: compares the generated code of two revisions.
//!
//! Both revisions are generated independently and concurrently, each into
//! its own scratch directory. The structured report is persisted first,
//! then rendered and persisted again, and only then announced on the
//! review thread. A failed comment leaves both documents in place so the
//! announcement can be retried with `republish`.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::adapters::{
    CommentReceipt, GenerationError, Generator, ObjectStore, PassthroughRevisions, ReportRenderer,
    ReviewCommenter, SourceControl, StoreError,
};
use crate::domain::{DiffReport, DiffSummary, DirectoryTree};

use super::errors::FailureCategory;
use super::event_store::hash_input;
use super::pipeline::{GenerationOptions, RetryPolicy};

/// Changed paths listed in a review comment before eliding the rest
const COMMENT_PATH_LIMIT: usize = 20;

/// Which side of a comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffSide {
    Base,
    Head,
}

impl std::fmt::Display for DiffSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base => f.write_str("base"),
            Self::Head => f.write_str("head"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Generation failed for {side} revision '{revision}': {source}")]
    Generation {
        side: DiffSide,
        revision: String,
        #[source]
        source: GenerationError,
    },

    #[error("Failed to persist {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to render diff report {report_key}: {reason}")]
    Render { report_key: String, reason: String },

    #[error("Failed to post review comment (report kept at {rendered_key}): {reason}")]
    Comment { rendered_key: String, reason: String },

    #[error("No stored diff report for {base}..{head}")]
    NotFound { base: String, head: String },
}

impl PublishError {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Generation { .. } => FailureCategory::DiffGeneration,
            _ => FailureCategory::Publish,
        }
    }
}

/// What a publish produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub base: String,
    pub head: String,

    /// Key of the structured report (`report.json`)
    pub report_key: String,

    /// Key of the rendered document
    pub rendered_key: String,

    pub summary: DiffSummary,

    pub headline: String,

    /// Posted comment, when a thread was given
    pub comment: Option<CommentReceipt>,

    pub published_at: DateTime<Utc>,
}

pub struct DiffPublisher {
    generator: Arc<dyn Generator>,
    source: Arc<dyn SourceControl>,
    objects: Arc<dyn ObjectStore>,
    renderer: Arc<dyn ReportRenderer>,
    commenter: Arc<dyn ReviewCommenter>,

    /// Key prefix shared with the artifact store
    namespace: String,

    /// Parent of the per-side scratch directories
    work_root: PathBuf,

    retry: RetryPolicy,
}

impl DiffPublisher {
    pub fn new(
        generator: Arc<dyn Generator>,
        objects: Arc<dyn ObjectStore>,
        renderer: Arc<dyn ReportRenderer>,
        commenter: Arc<dyn ReviewCommenter>,
        namespace: impl Into<String>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            generator,
            source: Arc::new(PassthroughRevisions),
            objects,
            renderer,
            commenter,
            namespace: namespace.into(),
            work_root: work_root.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Resolve references through a repository before generating
    pub fn with_source(mut self, source: Arc<dyn SourceControl>) -> Self {
        self.source = source;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Key prefix of the documents for one comparison.
    ///
    /// Revision names are sanitized for readability; the hash keeps
    /// distinct pairs apart even when their sanitized names collide.
    pub fn report_prefix(&self, base: &str, head: &str) -> String {
        let hash = hash_input(&format!("{}\0{}", base, head));
        format!(
            "{}/diffs/{}..{}-{}",
            self.namespace,
            sanitize(base),
            sanitize(head),
            &hash[..8]
        )
    }

    pub fn report_key(&self, base: &str, head: &str) -> String {
        format!("{}/report.json", self.report_prefix(base, head))
    }

    pub fn rendered_key(&self, base: &str, head: &str) -> String {
        format!(
            "{}/report.{}",
            self.report_prefix(base, head),
            self.renderer.extension()
        )
    }

    /// Generate both revisions and compute their diff, without persisting
    pub async fn compare(
        &self,
        base: &str,
        head: &str,
        options: &GenerationOptions,
    ) -> Result<DiffReport, PublishError> {
        let (base_tree, head_tree) = tokio::try_join!(
            self.generate_side(DiffSide::Base, base, options),
            self.generate_side(DiffSide::Head, head, options),
        )?;

        Ok(DiffReport::between(base, head, &base_tree, &head_tree))
    }

    /// Compare, persist, render and announce
    #[instrument(skip(self, options), fields(base = %base, head = %head))]
    pub async fn publish(
        &self,
        base: &str,
        head: &str,
        options: &GenerationOptions,
        thread_id: Option<&str>,
    ) -> Result<PublishReceipt, PublishError> {
        let report = self.compare(base, head, options).await?;
        info!(changes = report.changes.len(), "Diff computed");

        let report_key = self.store_report(&report).await?;
        let rendered_key = self.render_report(&report, &report_key).await?;

        self.announce(&report, report_key, rendered_key, thread_id).await
    }

    /// Re-render a persisted report (e.g. after a renderer change)
    #[instrument(skip(self))]
    pub async fn render_stored(&self, base: &str, head: &str) -> Result<String, PublishError> {
        let report = self.load_report(base, head).await?;
        let report_key = self.report_key(base, head);
        self.render_report(&report, &report_key).await
    }

    /// Announce a persisted report again, rendering it if needed
    #[instrument(skip(self))]
    pub async fn republish(
        &self,
        base: &str,
        head: &str,
        thread_id: Option<&str>,
    ) -> Result<PublishReceipt, PublishError> {
        let report = self.load_report(base, head).await?;
        let report_key = self.report_key(base, head);
        let rendered_key = self.rendered_key(base, head);

        let rendered = self
            .objects
            .exists(&rendered_key)
            .await
            .map_err(|source| PublishError::Store {
                key: rendered_key.clone(),
                source,
            })?;
        let rendered_key = if rendered {
            rendered_key
        } else {
            self.render_report(&report, &report_key).await?
        };

        self.announce(&report, report_key, rendered_key, thread_id).await
    }

    /// Load a persisted report
    pub async fn load_report(&self, base: &str, head: &str) -> Result<DiffReport, PublishError> {
        let key = self.report_key(base, head);
        let bytes = match self.objects.get(&key).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => {
                return Err(PublishError::NotFound {
                    base: base.to_string(),
                    head: head.to_string(),
                })
            }
            Err(source) => return Err(PublishError::Store { key, source }),
        };

        serde_json::from_slice(&bytes).map_err(|e| PublishError::Store {
            key,
            source: StoreError::Serialization(e),
        })
    }

    async fn generate_side(
        &self,
        side: DiffSide,
        revision: &str,
        options: &GenerationOptions,
    ) -> Result<DirectoryTree, PublishError> {
        let failed = |source: GenerationError| PublishError::Generation {
            side,
            revision: revision.to_string(),
            source,
        };

        let commit = self.source.resolve(revision).await.map_err(|e| {
            failed(GenerationError::Revision {
                revision: revision.to_string(),
                cause: e.to_string(),
            })
        })?;

        std::fs::create_dir_all(&self.work_root).map_err(|e| failed(e.into()))?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("diff-{}-", side))
            .tempdir_in(&self.work_root)
            .map_err(|e| failed(e.into()))?;

        let tree = self
            .generator
            .generate(&commit, options, &scratch.path().join("out"))
            .await
            .map_err(failed)?;

        if let Err(e) = scratch.close() {
            warn!(error = %e, "Failed to remove diff scratch directory");
        }
        Ok(tree)
    }

    async fn store_report(&self, report: &DiffReport) -> Result<String, PublishError> {
        let key = self.report_key(&report.base, &report.head);
        let json = serde_json::to_vec_pretty(report).map_err(|e| PublishError::Store {
            key: key.clone(),
            source: StoreError::Serialization(e),
        })?;

        self.objects
            .put(&key, &json)
            .await
            .map_err(|source| PublishError::Store {
                key: key.clone(),
                source,
            })?;

        info!(key = %key, "Diff report stored");
        Ok(key)
    }

    async fn render_report(
        &self,
        report: &DiffReport,
        report_key: &str,
    ) -> Result<String, PublishError> {
        let document = self
            .renderer
            .render(report)
            .map_err(|e| PublishError::Render {
                report_key: report_key.to_string(),
                reason: format!("{:#}", e),
            })?;

        let key = self.rendered_key(&report.base, &report.head);
        self.objects
            .put(&key, &document)
            .await
            .map_err(|source| PublishError::Store {
                key: key.clone(),
                source,
            })?;

        info!(key = %key, renderer = self.renderer.name(), "Diff report rendered");
        Ok(key)
    }

    async fn announce(
        &self,
        report: &DiffReport,
        report_key: String,
        rendered_key: String,
        thread_id: Option<&str>,
    ) -> Result<PublishReceipt, PublishError> {
        let comment = match thread_id {
            Some(thread) => {
                let body = comment_body(report, &rendered_key);
                Some(self.post_with_retry(thread, &body, &rendered_key).await?)
            }
            None => None,
        };

        Ok(PublishReceipt {
            base: report.base.clone(),
            head: report.head.clone(),
            report_key,
            rendered_key,
            summary: report.summary(),
            headline: report.headline(),
            comment,
            published_at: Utc::now(),
        })
    }

    async fn post_with_retry(
        &self,
        thread_id: &str,
        body: &str,
        rendered_key: &str,
    ) -> Result<CommentReceipt, PublishError> {
        let mut attempt = 1;
        loop {
            match self.commenter.post_comment(thread_id, body).await {
                Ok(receipt) => {
                    info!(thread_id, commenter = self.commenter.name(), "Review comment posted");
                    return Ok(receipt);
                }
                Err(e) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Comment failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(PublishError::Comment {
                        rendered_key: rendered_key.to_string(),
                        reason: format!("{:#}", e),
                    })
                }
            }
        }
    }
}

/// Review comment: headline, where the full report is, changed paths
fn comment_body(report: &DiffReport, rendered_key: &str) -> String {
    let mut body = format!("{}\n\nFull report: {}\n", report.headline(), rendered_key);

    if !report.is_empty() {
        body.push('\n');
        for change in report.changes.iter().take(COMMENT_PATH_LIMIT) {
            body.push_str(&format!("- {:?} `{}`\n", change.kind, change.path));
        }
        if report.changes.len() > COMMENT_PATH_LIMIT {
            body.push_str(&format!(
                "- ... and {} more\n",
                report.changes.len() - COMMENT_PATH_LIMIT
            ));
        }
    }

    body
}

/// Make a revision name safe as one key segment
fn sanitize(revision: &str) -> String {
    revision
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
