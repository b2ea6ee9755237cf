//! Main orchestrator for build execution.
//!
//! Sequences one build through generation, packaging, the verification
//! fan-out and the gate, recording every state change in the build's
//! ledger. Generation and packaging failures abort the build: every job is
//! recorded as skipped and the gate fails. Job failures never abort
//! anything; they are results.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{
    CommandGenerator, FsObjectStore, GenerationError, Generator, GitSourceControl, ObjectStore,
    PassthroughRevisions, SourceControl, StoreError,
};
use crate::config::ResolvedConfig;
use crate::domain::{
    Artifact, BuildId, BuildRun, DirectoryTree, ErrorKind, Event, EventType, JobResult, JobSpec,
};

use super::errors::{FailureCategory, PipelineError};
use super::event_store::{generate_idempotency_key, EventStore};
use super::gate::{Gate, GateDecision};
use super::packager;
use super::runner::JobRunner;
use super::store::ArtifactStore;

/// Why a build stopped before its jobs ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abort {
    pub category: FailureCategory,
    pub message: String,
}

/// Outcome of a full pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub build_id: BuildId,

    /// Commit the build was generated from
    pub revision: String,

    /// Published artifact (None when the build aborted)
    pub artifact: Option<Artifact>,

    /// Terminal result per job
    pub results: BTreeMap<String, JobResult>,

    pub decision: GateDecision,

    /// Set when generation or packaging failed
    pub aborted: Option<Abort>,
}

impl PipelineReport {
    /// The error the run ends with, if any: the aborted stage, else a
    /// failed gate
    pub fn failure(&self) -> Option<PipelineError> {
        if let Some(ref abort) = self.aborted {
            return Some(PipelineError::Aborted {
                build_id: self.build_id.clone(),
                category: abort.category,
                message: abort.message.clone(),
            });
        }
        if !self.decision.passed() {
            return Some(PipelineError::Gate {
                build_id: self.build_id.clone(),
            });
        }
        None
    }
}

/// A generated tree waiting in staging
#[derive(Debug, Clone)]
pub struct GeneratedBuild {
    pub build_id: BuildId,
    pub revision: String,
    pub tree: DirectoryTree,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    config: Arc<ResolvedConfig>,
    generator: Arc<dyn Generator>,
    source: Arc<dyn SourceControl>,
    artifacts: Arc<ArtifactStore>,
    runner: Arc<JobRunner>,
}

impl Orchestrator {
    pub fn new(
        config: ResolvedConfig,
        generator: Arc<dyn Generator>,
        source: Arc<dyn SourceControl>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let artifacts = Arc::new(ArtifactStore::new(
            objects,
            config.pipeline.storage.namespace.clone(),
        ));
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&artifacts),
            config.work_dir(),
            config.pipeline.limits.clone(),
            config.environment.clone(),
        ));

        Self {
            config: Arc::new(config),
            generator,
            source,
            artifacts,
            runner,
        }
    }

    /// Wire the default adapters: subprocess generator, filesystem store,
    /// git when a repository is configured
    pub fn from_config(config: ResolvedConfig) -> Result<Self> {
        let generator = CommandGenerator::from_config(&config.pipeline.generator)
            .ok_or_else(|| PipelineError::Config("generator command is empty".to_string()))?;

        let source: Arc<dyn SourceControl> = match config.repository {
            Some(ref repo) => Arc::new(GitSourceControl::new(repo)),
            None => Arc::new(PassthroughRevisions),
        };
        let objects = Arc::new(FsObjectStore::new(config.storage_root.clone()));

        Ok(Self::new(config, Arc::new(generator), source, objects))
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    fn jobs(&self) -> &[JobSpec] {
        &self.config.pipeline.jobs
    }

    async fn ledger(&self, build_id: &BuildId) -> Result<EventStore> {
        EventStore::open(&self.config.builds_dir(), build_id).await
    }

    /// Resolve a revision reference and derive the build id
    pub async fn resolve_build(&self, revision: &str, attempt: u32) -> Result<(String, BuildId)> {
        let commit = self.source.resolve(revision).await.map_err(|e| {
            PipelineError::Generation {
                revision: revision.to_string(),
                source: GenerationError::Revision {
                    revision: revision.to_string(),
                    cause: format!("{:#}", e),
                },
            }
        })?;

        let build_id = BuildId::derive(&commit, attempt);
        debug!(revision, commit = %commit, build_id = %build_id, "Revision resolved");
        Ok((commit, build_id))
    }

    /// Generate a revision into staging
    #[instrument(skip(self))]
    pub async fn generate(&self, revision: &str, attempt: u32) -> Result<GeneratedBuild> {
        let (commit, build_id) = self.resolve_build(revision, attempt).await?;
        self.ensure_unpublished(&build_id).await?;
        let ledger = self.ledger(&build_id).await?;

        match self.generate_tree(&ledger, &build_id, &commit).await {
            Ok(tree) => Ok(GeneratedBuild {
                build_id,
                revision: commit,
                tree,
            }),
            Err(e) => {
                self.abort_build(&ledger, &build_id, &e).await?;
                Err(e.into())
            }
        }
    }

    /// Pack the staged tree of a generated build and publish it
    #[instrument(skip(self), fields(build_id = %build_id))]
    pub async fn package(&self, build_id: &BuildId) -> Result<Artifact> {
        let ledger = self.ledger(build_id).await?;
        let run = ledger
            .build_run()
            .await?
            .ok_or_else(|| PipelineError::Packaging {
                build_id: build_id.clone(),
                reason: "no generation recorded; run generate first".to_string(),
            })?;

        if run.is_aborted() {
            return Err(PipelineError::Packaging {
                build_id: build_id.clone(),
                reason: "build already aborted".to_string(),
            }
            .into());
        }
        self.ensure_unpublished(build_id).await?;

        let revision = run.revision.clone().unwrap_or_default();
        let staging = self.config.staging_dir(build_id);
        let tree = tokio::task::spawn_blocking(move || DirectoryTree::from_dir(&staging))
            .await
            .context("Staging read task failed")?;

        let tree = match tree {
            Ok(tree) if !tree.is_empty() => tree,
            Ok(_) => {
                return Err(PipelineError::Packaging {
                    build_id: build_id.clone(),
                    reason: "staging directory is empty; run generate first".to_string(),
                }
                .into())
            }
            Err(e) => {
                return Err(PipelineError::Packaging {
                    build_id: build_id.clone(),
                    reason: format!("cannot read staged tree: {}", e),
                }
                .into())
            }
        };

        match self.package_tree(&ledger, build_id, &revision, tree).await {
            Ok(artifact) => Ok(artifact),
            Err(e) => {
                if !is_duplicate_publish(&e) {
                    self.abort_build(&ledger, build_id, &e).await?;
                }
                Err(e.into())
            }
        }
    }

    /// Run one job against a published build and record its result
    #[instrument(skip(self), fields(build_id = %build_id))]
    pub async fn verify(&self, build_id: &BuildId, job: &str) -> Result<JobResult> {
        let spec = self
            .config
            .pipeline
            .get_job(job)
            .ok_or_else(|| PipelineError::Config(format!("unknown job '{}'", job)))?
            .clone();

        let ledger = Arc::new(self.ledger(build_id).await?);

        if let Some(run) = ledger.build_run().await? {
            if run.is_aborted() {
                let result = JobResult::skipped(&spec.name, build_id.clone(), "build aborted");
                record_result(&ledger, &result).await?;
                return Ok(result);
            }
        }

        let result = run_job(&self.runner, &ledger, &spec, build_id).await;
        record_result(&ledger, &result).await?;
        Ok(result)
    }

    /// Evaluate the gate from the recorded results
    #[instrument(skip(self), fields(build_id = %build_id))]
    pub async fn gate(&self, build_id: &BuildId) -> Result<GateDecision> {
        let ledger = self.ledger(build_id).await?;
        let results = ledger
            .build_run()
            .await?
            .map(|run| run.results)
            .unwrap_or_default();

        self.record_gate(&ledger, build_id, &results).await
    }

    /// Ledger view of a build
    pub async fn status(&self, build_id: &BuildId) -> Result<Option<BuildRun>> {
        self.ledger(build_id).await?.build_run().await
    }

    /// Every build with a ledger
    pub async fn list_builds(&self) -> Result<Vec<BuildId>> {
        EventStore::list_builds(&self.config.builds_dir()).await
    }

    /// Generate, package, verify and gate one revision
    #[instrument(skip(self), fields(pipeline = %self.config.pipeline.name))]
    pub async fn run_pipeline(&self, revision: &str, attempt: u32) -> Result<PipelineReport> {
        let (commit, build_id) = self.resolve_build(revision, attempt).await?;
        self.ensure_unpublished(&build_id).await?;
        info!(build_id = %build_id, "Starting pipeline execution");

        let ledger = Arc::new(self.ledger(&build_id).await?);

        let tree = match self.generate_tree(&ledger, &build_id, &commit).await {
            Ok(tree) => tree,
            Err(e) => return self.aborted_report(&ledger, &build_id, &commit, &e).await,
        };

        let artifact = match self.package_tree(&ledger, &build_id, &commit, tree).await {
            Ok(artifact) => artifact,
            Err(e) if is_duplicate_publish(&e) => return Err(e.into()),
            Err(e) => return self.aborted_report(&ledger, &build_id, &commit, &e).await,
        };

        let results = self.fan_out(&ledger, &build_id).await;
        let decision = self.record_gate(&ledger, &build_id, &results).await?;

        Ok(PipelineReport {
            build_id,
            revision: commit,
            artifact: Some(artifact),
            results,
            decision,
            aborted: None,
        })
    }

    /// Build ids are write-once: a published build is never regenerated
    async fn ensure_unpublished(&self, build_id: &BuildId) -> Result<()> {
        if self.artifacts.exists(build_id).await? {
            return Err(PipelineError::Packaging {
                build_id: build_id.clone(),
                reason: format!("{} (start a new attempt)", DUPLICATE_PUBLISH),
            }
            .into());
        }
        Ok(())
    }

    async fn generate_tree(
        &self,
        ledger: &EventStore,
        build_id: &BuildId,
        commit: &str,
    ) -> Result<DirectoryTree, PipelineError> {
        let staging = self.config.staging_dir(build_id);
        let failed = |source: GenerationError| PipelineError::Generation {
            revision: commit.to_string(),
            source,
        };

        let started = Event::new(
            build_id.clone(),
            None,
            EventType::RunStarted,
            format!("{}:start", build_id),
            format!("Build of {} started", commit),
        )
        .with_revision(commit);
        if let Err(e) = ledger.append(&started).await {
            return Err(failed(GenerationError::Io(ledger_io(e))));
        }

        if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| failed(e.into()))?;
        }

        let start = Instant::now();
        let tree = self
            .generator
            .generate(commit, &self.config.pipeline.generation, &staging)
            .await
            .map_err(failed)?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let completed = Event::new(
            build_id.clone(),
            None,
            EventType::GenerationCompleted,
            generate_idempotency_key(build_id, "generate", commit),
            format!("Generated {} files", tree.len()),
        )
        .with_revision(commit)
        .with_duration(duration_ms);
        if let Err(e) = ledger.append(&completed).await {
            return Err(failed(GenerationError::Io(ledger_io(e))));
        }

        Ok(tree)
    }

    async fn package_tree(
        &self,
        ledger: &EventStore,
        build_id: &BuildId,
        revision: &str,
        tree: DirectoryTree,
    ) -> Result<Artifact, PipelineError> {
        let failed = |reason: String| PipelineError::Packaging {
            build_id: build_id.clone(),
            reason,
        };

        let file_count = tree.len();
        let bytes = tokio::task::spawn_blocking(move || packager::pack(&tree))
            .await
            .map_err(|e| failed(format!("pack task failed: {}", e)))?
            .map_err(|e| failed(e.to_string()))?;

        self.config
            .pipeline
            .limits
            .check_artifact_size(bytes.len() as u64)
            .map_err(|e| failed(e.to_string()))?;

        let artifact = self
            .artifacts
            .put(build_id, revision, &bytes, file_count)
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists(_) => {
                    failed(format!("{} (start a new attempt)", DUPLICATE_PUBLISH))
                }
                other => failed(other.to_string()),
            })?;

        let event = Event::new(
            build_id.clone(),
            None,
            EventType::ArtifactPublished,
            generate_idempotency_key(build_id, "package", &artifact.digest),
            format!("Published {} ({} bytes)", artifact.digest, artifact.size_bytes),
        )
        .with_artifact(artifact.clone());
        ledger.append(&event).await.map_err(|e| failed(format!("{:#}", e)))?;

        let staging = self.config.staging_dir(build_id);
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            debug!(error = %e, "Staging directory not removed");
        }

        Ok(artifact)
    }

    /// Run every job concurrently, bounded by `max_parallel_jobs`, until all
    /// finish or the run deadline passes
    async fn fan_out(
        &self,
        ledger: &Arc<EventStore>,
        build_id: &BuildId,
    ) -> BTreeMap<String, JobResult> {
        let limits = &self.config.pipeline.limits;
        let semaphore = Arc::new(Semaphore::new(limits.max_parallel_jobs));
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();

        for spec in self.jobs() {
            let runner = Arc::clone(&self.runner);
            let ledger = Arc::clone(ledger);
            let semaphore = Arc::clone(&semaphore);
            let spec = spec.clone();
            let build_id = build_id.clone();
            let name = spec.name.clone();

            let handle = tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                run_job(&runner, &ledger, &spec, &build_id).await
            });
            names.insert(handle.id(), name);
        }

        info!(jobs = names.len(), max_parallel = limits.max_parallel_jobs, "Jobs dispatched");

        let deadline = limits.run_deadline(tokio::time::Instant::now());
        if deadline.is_none() {
            warn!(
                timeout_seconds = limits.run_timeout_seconds,
                "Run deadline out of range, waiting for every job"
            );
        }
        let mut results = BTreeMap::new();

        loop {
            let next = tasks.join_next_with_id();
            let waited = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, next).await,
                None => Ok(next.await),
            };
            let joined = match waited {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        timeout_seconds = limits.run_timeout_seconds,
                        remaining = tasks.len(),
                        "Run deadline reached, cancelling remaining jobs"
                    );
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next_with_id().await {
                        let result = task_result(joined, &names, build_id);
                        self.collect(ledger, &mut results, result).await;
                    }
                    break;
                }
            };

            let result = task_result(joined, &names, build_id);
            self.collect(ledger, &mut results, result).await;
        }

        results
    }

    async fn collect(
        &self,
        ledger: &EventStore,
        results: &mut BTreeMap<String, JobResult>,
        result: JobResult,
    ) {
        if let Err(e) = record_result(ledger, &result).await {
            error!(job = %result.job, error = %e, "Failed to record job result");
        }
        results.insert(result.job.clone(), result);
    }

    async fn record_gate(
        &self,
        ledger: &EventStore,
        build_id: &BuildId,
        results: &BTreeMap<String, JobResult>,
    ) -> Result<GateDecision> {
        let gate = Gate::new(self.jobs());
        if !gate.is_ready(build_id, results) {
            warn!("Gate evaluated before every fatal job reported");
        }

        let decision = gate.decide(build_id, results);
        let event = Event::new(
            build_id.clone(),
            None,
            EventType::GateEvaluated,
            generate_idempotency_key(build_id, "gate", &decision.status.to_string()),
            decision.summary(),
        )
        .with_gate(decision.passed());
        ledger.append(&event).await?;

        info!(status = %decision.status, "Gate evaluated");
        Ok(decision)
    }

    /// Record the failure, skip every job and fail the gate
    async fn abort_build(
        &self,
        ledger: &EventStore,
        build_id: &BuildId,
        cause: &PipelineError,
    ) -> Result<(BTreeMap<String, JobResult>, GateDecision)> {
        let event_type = match cause.category() {
            FailureCategory::Packaging => EventType::PackagingFailed,
            _ => EventType::GenerationFailed,
        };
        error!(error = %cause, "Build aborted");

        let event = Event::new(
            build_id.clone(),
            None,
            event_type,
            format!("{}:abort", build_id),
            format!("Build aborted: {}", cause.category()),
        )
        .with_error(cause.to_string());
        ledger.append(&event).await?;

        let reason = format!("build aborted: {}", cause);
        let mut results = BTreeMap::new();
        for spec in self.jobs() {
            let result = JobResult::skipped(&spec.name, build_id.clone(), reason.clone());
            record_result(ledger, &result).await?;
            results.insert(spec.name.clone(), result);
        }

        let decision = self.record_gate(ledger, build_id, &results).await?;
        Ok((results, decision))
    }

    async fn aborted_report(
        &self,
        ledger: &EventStore,
        build_id: &BuildId,
        revision: &str,
        cause: &PipelineError,
    ) -> Result<PipelineReport> {
        let (results, decision) = self.abort_build(ledger, build_id, cause).await?;
        Ok(PipelineReport {
            build_id: build_id.clone(),
            revision: revision.to_string(),
            artifact: None,
            results,
            decision,
            aborted: Some(Abort {
                category: cause.category(),
                message: cause.to_string(),
            }),
        })
    }
}

const DUPLICATE_PUBLISH: &str = "artifact already published for this build id";

/// A second publish for the same build id leaves the first build intact
fn is_duplicate_publish(error: &PipelineError) -> bool {
    matches!(error, PipelineError::Packaging { reason, .. } if reason.starts_with(DUPLICATE_PUBLISH))
}

fn ledger_io(error: anyhow::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("{:#}", error))
}

/// Run one job, recording its start unless it is skipped up front
async fn run_job(
    runner: &JobRunner,
    ledger: &EventStore,
    spec: &JobSpec,
    build_id: &BuildId,
) -> JobResult {
    if runner.missing_inputs(spec).is_empty() {
        let started = Event::new(
            build_id.clone(),
            Some(spec.name.clone()),
            EventType::JobStarted,
            generate_idempotency_key(build_id, &spec.name, "start"),
            format!("Job '{}' started", spec.name),
        );
        if let Err(e) = ledger.append(&started).await {
            warn!(job = %spec.name, error = %e, "Failed to record job start");
        }
    }

    runner.run(spec, build_id).await
}

async fn record_result(ledger: &EventStore, result: &JobResult) -> Result<()> {
    let key = generate_idempotency_key(
        &result.build_id,
        &result.job,
        result.artifact_digest.as_deref().unwrap_or("none"),
    );
    ledger.append(&Event::job_result(result.clone(), key)).await
}

/// Turn a joined task into a result; panics and aborts are results too
fn task_result(
    joined: Result<(tokio::task::Id, JobResult), tokio::task::JoinError>,
    names: &HashMap<tokio::task::Id, String>,
    build_id: &BuildId,
) -> JobResult {
    match joined {
        Ok((_, result)) => result,
        Err(e) => {
            let job = names
                .get(&e.id())
                .cloned()
                .unwrap_or_else(|| "<unknown>".to_string());
            if e.is_panic() {
                error!(job = %job, "Job task panicked");
                JobResult::errored(job, build_id.clone(), ErrorKind::Crash, "job task panicked")
            } else {
                JobResult::cancelled(job, build_id.clone(), "run deadline exceeded")
            }
        }
    }
}
