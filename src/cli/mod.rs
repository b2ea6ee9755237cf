//! Command-line interface for gencheck.
//!
//! Each pipeline stage is its own command so CI systems can run them as
//! separate steps (`generate`, `package`, `verify`, `gate`); `run` chains
//! them in one process. Failures exit with a code per category.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::{
    CommandGenerator, FsObjectStore, GitSourceControl, LogCommenter, PassthroughRevisions,
    ReviewCommenter, SourceControl, TextRenderer, WebhookCommenter,
};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    DiffPublisher, GateDecision, Orchestrator, PipelineError, PipelineReport, PublishReceipt,
};
use crate::domain::{BuildId, JobResult, JobStatus};

/// gencheck - Generated-code build and verification pipeline
#[derive(Parser, Debug)]
#[command(name = "gencheck")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pipeline file (default: search for .gencheck/pipeline.yaml)
    #[arg(short, long, global = true, env = "GENCHECK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate code for a revision into staging
    Generate {
        /// Revision reference (branch, tag, commit)
        revision: String,

        /// Attempt number, part of the build id
        #[arg(short, long, default_value = "1")]
        attempt: u32,
    },

    /// Pack a generated build and publish the artifact
    Package {
        /// Build id printed by `generate`
        build_id: String,
    },

    /// Run one verification job against a published build
    Verify {
        build_id: String,

        /// Job name from the pipeline file
        job: String,
    },

    /// Decide pass/fail for a build from its recorded job results
    Gate {
        build_id: String,

        /// Print the decision as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate, package, verify and gate a revision in one process
    Run {
        revision: String,

        #[arg(short, long, default_value = "1")]
        attempt: u32,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare the generated code of two revisions and publish the diff
    Diff {
        base: String,
        head: String,

        /// Review thread to comment on (default: review.thread_id)
        #[arg(short, long)]
        thread: Option<String>,

        /// Store the report without commenting
        #[arg(long)]
        no_comment: bool,
    },

    /// Post the comment for an already stored diff again
    Republish {
        base: String,
        head: String,

        #[arg(short, long)]
        thread: Option<String>,
    },

    /// Re-render an already stored diff report
    Render { base: String, head: String },

    /// Show the recorded state of a build (or list builds)
    Status { build_id: Option<String> },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = config::load(self.config.as_deref())
            .map_err(|e| PipelineError::Config(format!("{:#}", e)))?;

        match self.command {
            Commands::Generate { revision, attempt } => generate(config, &revision, attempt).await,
            Commands::Package { build_id } => package(config, &build_id).await,
            Commands::Verify { build_id, job } => verify(config, &build_id, &job).await,
            Commands::Gate { build_id, json } => gate(config, &build_id, json).await,
            Commands::Run {
                revision,
                attempt,
                json,
            } => run(config, &revision, attempt, json).await,
            Commands::Diff {
                base,
                head,
                thread,
                no_comment,
            } => {
                let thread = if no_comment {
                    None
                } else {
                    thread.or_else(|| config.pipeline.review.thread_id.clone())
                };
                diff(config, &base, &head, thread).await
            }
            Commands::Republish { base, head, thread } => {
                let thread = thread.or_else(|| config.pipeline.review.thread_id.clone());
                republish(config, &base, &head, thread).await
            }
            Commands::Render { base, head } => render(config, &base, &head).await,
            Commands::Status { build_id } => status(config, build_id.as_deref()).await,
            Commands::Config => show_config(&config),
        }
    }
}

fn parse_build_id(raw: &str) -> Result<BuildId> {
    BuildId::new(raw).map_err(|e| PipelineError::Config(e.to_string()).into())
}

async fn generate(config: ResolvedConfig, revision: &str, attempt: u32) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let generated = orchestrator.generate(revision, attempt).await?;

    println!("{}", generated.build_id);
    eprintln!(
        "[Generated {} files ({} bytes) from {}]",
        generated.tree.len(),
        generated.tree.total_bytes(),
        generated.revision
    );
    Ok(())
}

async fn package(config: ResolvedConfig, build_id: &str) -> Result<()> {
    let build_id = parse_build_id(build_id)?;
    let orchestrator = Orchestrator::from_config(config)?;
    let artifact = orchestrator.package(&build_id).await?;

    println!("{}", artifact.digest);
    eprintln!(
        "[Published {} ({} files, {} bytes) at {}]",
        artifact.build_id,
        artifact.file_count,
        artifact.size_bytes,
        orchestrator.artifacts().blob_key(&build_id)
    );
    Ok(())
}

async fn verify(config: ResolvedConfig, build_id: &str, job: &str) -> Result<()> {
    let build_id = parse_build_id(build_id)?;
    let orchestrator = Orchestrator::from_config(config)?;
    let result = orchestrator.verify(&build_id, job).await?;

    print_result(&result);
    if result.status != JobStatus::Passed {
        return Err(PipelineError::Job {
            job: result.job,
            status: result.status,
        }
        .into());
    }
    Ok(())
}

async fn gate(config: ResolvedConfig, build_id: &str, json: bool) -> Result<()> {
    let build_id = parse_build_id(build_id)?;
    let orchestrator = Orchestrator::from_config(config)?;
    let decision = orchestrator.gate(&build_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        print_decision(&decision);
    }

    if !decision.passed() {
        return Err(PipelineError::Gate { build_id }.into());
    }
    Ok(())
}

async fn run(config: ResolvedConfig, revision: &str, attempt: u32, json: bool) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let report = orchestrator.run_pipeline(revision, attempt).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    match report.failure() {
        Some(failure) => Err(failure.into()),
        None => Ok(()),
    }
}

async fn diff(config: ResolvedConfig, base: &str, head: &str, thread: Option<String>) -> Result<()> {
    let publisher = diff_publisher(&config)?;
    let receipt = publisher
        .publish(base, head, &config.pipeline.generation, thread.as_deref())
        .await?;
    print_receipt(&receipt);
    Ok(())
}

async fn republish(
    config: ResolvedConfig,
    base: &str,
    head: &str,
    thread: Option<String>,
) -> Result<()> {
    let thread = thread.context("No review thread given (use --thread or review.thread_id)")?;
    let publisher = diff_publisher(&config)?;
    let receipt = publisher.republish(base, head, Some(&thread)).await?;
    print_receipt(&receipt);
    Ok(())
}

async fn render(config: ResolvedConfig, base: &str, head: &str) -> Result<()> {
    let publisher = diff_publisher(&config)?;
    let key = publisher.render_stored(base, head).await?;
    println!("{}", key);
    Ok(())
}

async fn status(config: ResolvedConfig, build_id: Option<&str>) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;

    let Some(build_id) = build_id else {
        let builds = orchestrator.list_builds().await?;
        if builds.is_empty() {
            println!("No builds found");
        }
        for id in builds {
            println!("{}", id);
        }
        return Ok(());
    };

    let build_id = parse_build_id(build_id)?;
    let run = orchestrator
        .status(&build_id)
        .await?
        .with_context(|| format!("No ledger for build {}", build_id))?;

    println!("Build: {}", run.build_id);
    println!("Revision: {}", run.revision.as_deref().unwrap_or("-"));
    println!("State: {:?}", run.state);
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(ref artifact) = run.artifact {
        println!("Artifact: {} ({} bytes)", artifact.digest, artifact.size_bytes);
    }
    println!("\nJobs:");
    for (job, status) in &run.job_statuses {
        println!("  {}: {}", job, status);
    }

    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    let pipeline = &cfg.pipeline;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none)".to_string()));
    println!("Pipeline:    {}", pipeline.name);
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Builds:     {}", cfg.builds_dir().display());
    println!("  Objects:    {}", cfg.storage_root.display());
    println!("  Repository: {}", cfg.repository.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - revisions used verbatim)".to_string()));
    println!();
    println!("Generator: {}", pipeline.generator.command.join(" "));
    println!("  Modules:  {}", pipeline.generation.modules.join(", "));
    println!("  Features: {}", pipeline.generation.features.join(", "));
    println!();
    println!("Jobs:");
    for job in &pipeline.jobs {
        println!("  {:<24} {:?}  {}", job.name, job.severity, job.command.join(" "));
    }
    println!();
    println!("Limits:");
    println!("  Job timeout:    {}s", pipeline.limits.job_timeout_seconds);
    println!("  Run timeout:    {}s", pipeline.limits.run_timeout_seconds);
    println!("  Parallel jobs:  {}", pipeline.limits.max_parallel_jobs);
    println!("  Max artifact:   {} bytes", pipeline.limits.max_artifact_bytes);
    println!();
    println!("Environment inputs:");
    for name in pipeline.environment_inputs() {
        let state = if cfg.env(&name).is_some() { "set" } else { "missing" };
        println!("  {}: {}", name, state);
    }

    Ok(())
}

/// Diff publisher over the configured adapters
fn diff_publisher(config: &ResolvedConfig) -> Result<DiffPublisher> {
    let generator = CommandGenerator::from_config(&config.pipeline.generator)
        .ok_or_else(|| PipelineError::Config("generator command is empty".to_string()))?;

    let source: Arc<dyn SourceControl> = match config.repository {
        Some(ref repo) => Arc::new(GitSourceControl::new(repo)),
        None => Arc::new(PassthroughRevisions),
    };

    let review = &config.pipeline.review;
    let commenter: Arc<dyn ReviewCommenter> = match review.webhook_url {
        Some(ref url) => {
            let token = review
                .token_env
                .as_deref()
                .and_then(|name| config.env(name))
                .map(str::to_string);
            Arc::new(WebhookCommenter::new(url.clone(), token))
        }
        None => Arc::new(LogCommenter),
    };

    Ok(DiffPublisher::new(
        Arc::new(generator),
        Arc::new(FsObjectStore::new(config.storage_root.clone())),
        Arc::new(TextRenderer),
        commenter,
        config.pipeline.storage.namespace.clone(),
        config.work_dir(),
    )
    .with_source(source)
    .with_retry(review.retry.clone()))
}

fn print_result(result: &JobResult) {
    println!("Job:    {}", result.job);
    println!("Build:  {}", result.build_id);
    println!("Status: {}", result.status);
    if let Some(kind) = result.error_kind {
        println!("Error:  {}", kind);
    }
    if let Some(ref reason) = result.reason {
        println!("Reason: {}", reason);
    }
    println!("Time:   {}ms", result.duration_ms);
    if !result.stdout.is_empty() {
        println!("\n--- stdout ---\n{}", result.stdout.trim_end());
    }
    if !result.stderr.is_empty() {
        println!("\n--- stderr ---\n{}", result.stderr.trim_end());
    }
}

fn print_decision(decision: &GateDecision) {
    println!("{:<28} {:<10} {:<10} {}", "JOB", "SEVERITY", "STATUS", "REASON");
    println!("{}", "-".repeat(75));

    for entry in &decision.entries {
        let marker = if entry.blocking { "*" } else { " " };
        println!(
            "{:<28} {:<10} {:<10} {}",
            format!("{}{}", marker, entry.job),
            format!("{:?}", entry.severity).to_lowercase(),
            entry.status.to_string(),
            entry.reason.as_deref().unwrap_or("")
        );
    }

    println!();
    println!("Gate: {}", decision.status);
    for reason in &decision.reasons {
        println!("  - {}", reason);
    }
}

fn print_report(report: &PipelineReport) {
    println!("Build:    {}", report.build_id);
    println!("Revision: {}", report.revision);
    if let Some(ref artifact) = report.artifact {
        println!("Artifact: {} ({} bytes)", artifact.digest, artifact.size_bytes);
    }
    println!();
    print_decision(&report.decision);
}

fn print_receipt(receipt: &PublishReceipt) {
    println!("{}", receipt.headline);
    println!("Report:   {}", receipt.report_key);
    println!("Rendered: {}", receipt.rendered_key);
    match receipt.comment {
        Some(ref comment) => println!(
            "Comment:  thread {} ({})",
            comment.thread_id,
            comment.comment_id.as_deref().unwrap_or("no id")
        ),
        None => println!("Comment:  (not posted)"),
    }
}
