//! Verification Job Runner.
//!
//! Runs one job against one build: fetch the artifact, unpack it into a
//! fresh private directory, run the job's command there under a timeout,
//! and capture the outcome. The directory is removed on every exit path,
//! including when the surrounding task is aborted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::domain::tree::normalize_relative_path;
use crate::domain::{BuildId, ErrorKind, JobLifecycle, JobResult, JobSpec, JobStatus};

use super::limits::{Limits, OutputTail};
use super::packager;
use super::store::ArtifactStore;

/// Pipe read size while capturing job output
const READ_CHUNK: usize = 8 * 1024;

pub struct JobRunner {
    artifacts: Arc<ArtifactStore>,

    /// Parent of every job's private working directory
    work_root: PathBuf,

    limits: Limits,

    /// Environment inputs captured when the configuration was resolved
    environment: BTreeMap<String, String>,
}

impl JobRunner {
    pub fn new(
        artifacts: Arc<ArtifactStore>,
        work_root: impl Into<PathBuf>,
        limits: Limits,
        environment: BTreeMap<String, String>,
    ) -> Self {
        Self {
            artifacts,
            work_root: work_root.into(),
            limits,
            environment,
        }
    }

    /// Required inputs that are not available
    pub fn missing_inputs<'a>(&self, spec: &'a JobSpec) -> Vec<&'a str> {
        spec.required_env
            .iter()
            .filter(|name| !self.environment.contains_key(name.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Run a job. Never fails: every problem becomes part of the result.
    #[instrument(skip(self, spec), fields(job = %spec.name, build_id = %build_id))]
    pub async fn run(&self, spec: &JobSpec, build_id: &BuildId) -> JobResult {
        let started = Instant::now();
        let mut lifecycle = JobLifecycle::new();

        let missing = self.missing_inputs(spec);
        if !missing.is_empty() {
            if let Err(e) = lifecycle.advance(JobStatus::Skipped) {
                warn!(error = %e, "Job skipped out of order");
            }
            info!(missing = ?missing, "Job skipped, required inputs unavailable");
            return JobResult::skipped(
                spec.name.clone(),
                build_id.clone(),
                format!("missing required inputs: {}", missing.join(", ")),
            );
        }

        if let Err(e) = lifecycle.advance(JobStatus::Running) {
            warn!(error = %e, "Job started out of order");
        }
        let result = self.execute(spec, build_id).await;

        if let Err(e) = lifecycle.advance(result.status) {
            warn!(error = %e, "Job produced an out-of-order status");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(status = %result.status, duration_ms, "Job finished");
        result.with_duration(duration_ms)
    }

    async fn execute(&self, spec: &JobSpec, build_id: &BuildId) -> JobResult {
        let errored = |kind: ErrorKind, reason: String| {
            JobResult::errored(spec.name.clone(), build_id.clone(), kind, reason)
        };

        let (artifact, bytes) = match self.artifacts.get(build_id).await {
            Ok(found) => found,
            Err(e) => return errored(ErrorKind::Unpack, format!("artifact unavailable: {}", e)),
        };

        let workspace = match self.create_workspace(spec, build_id) {
            Ok(dir) => dir,
            Err(e) => {
                return errored(ErrorKind::Workspace, format!("cannot create workspace: {}", e))
                    .with_artifact_digest(artifact.digest)
            }
        };
        debug!(workspace = %workspace.path().display(), "Workspace created");

        let unpack_dir = workspace.path().to_path_buf();
        let unpacked =
            tokio::task::spawn_blocking(move || packager::unpack(&bytes, &unpack_dir)).await;
        match unpacked {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return errored(ErrorKind::Unpack, e.to_string()).with_artifact_digest(artifact.digest)
            }
            Err(e) => {
                return errored(ErrorKind::Crash, format!("unpack task failed: {}", e))
                    .with_artifact_digest(artifact.digest)
            }
        }

        let cwd = match working_dir(workspace.path(), spec) {
            Ok(dir) => dir,
            Err(reason) => {
                return errored(ErrorKind::Workspace, reason).with_artifact_digest(artifact.digest)
            }
        };

        let digest = artifact.digest;
        let result = self
            .execute_command(spec, build_id, &cwd, &digest)
            .await
            .with_artifact_digest(digest.clone());

        if let Err(e) = workspace.close() {
            warn!(error = %e, "Failed to remove job workspace");
        }

        result
    }

    fn create_workspace(&self, spec: &JobSpec, build_id: &BuildId) -> std::io::Result<TempDir> {
        std::fs::create_dir_all(&self.work_root)?;
        let job: String = spec
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        tempfile::Builder::new()
            .prefix(&format!("{}-{}-", build_id, job))
            .tempdir_in(&self.work_root)
    }

    async fn execute_command(
        &self,
        spec: &JobSpec,
        build_id: &BuildId,
        cwd: &Path,
        digest: &str,
    ) -> JobResult {
        let errored = |kind: ErrorKind, reason: String| {
            JobResult::errored(spec.name.clone(), build_id.clone(), kind, reason)
        };

        let Some((program, args)) = spec.command.split_first() else {
            return errored(ErrorKind::Spawn, "empty command".to_string());
        };

        let passed_env = spec
            .pass_env
            .iter()
            .filter_map(|name| self.environment.get(name).map(|value| (name, value)));

        let child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .envs(&spec.env)
            .envs(passed_env)
            .env("GENCHECK_BUILD_ID", build_id.as_str())
            .env("GENCHECK_JOB", &spec.name)
            .env("GENCHECK_ARTIFACT_DIGEST", digest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => return errored(ErrorKind::Spawn, format!("failed to spawn '{}': {}", program, e)),
        };

        let limit = spec.timeout(self.limits.job_timeout_seconds);
        let stdout = read_tail(child.stdout.take(), self.limits.output_tail());
        let stderr = read_tail(child.stderr.take(), self.limits.output_tail());

        let finished = async {
            let (status, stdout, stderr) = tokio::join!(child.wait(), stdout, stderr);
            Ok::<_, std::io::Error>((status?, stdout?, stderr?))
        };

        // On timeout the child is dropped, which kills it
        let (status, stdout, stderr) = match timeout(limit, finished).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return errored(ErrorKind::Crash, format!("failed to wait for job: {}", e)),
            Err(_) => {
                warn!(timeout_seconds = limit.as_secs(), "Job timed out, killed");
                return errored(ErrorKind::Timeout, format!("exceeded {}s", limit.as_secs()));
            }
        };
        let output = Output {
            status,
            stdout: stdout.finish(),
            stderr: stderr.finish(),
        };

        if output.status.success() {
            return JobResult::new(spec.name.clone(), build_id.clone(), JobStatus::Passed)
                .with_exit_code(0)
                .with_output(output.stdout, output.stderr);
        }

        match output.status.code() {
            Some(code) => JobResult::new(spec.name.clone(), build_id.clone(), JobStatus::Failed)
                .with_exit_code(code)
                .with_reason(format!("exited with code {}", code))
                .with_output(output.stdout, output.stderr),
            None => errored(ErrorKind::Crash, describe_signal(&output.status))
                .with_output(output.stdout, output.stderr),
        }
    }
}

/// Decoded outcome of a finished job process
struct Output {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// Drain a pipe, keeping only its tail in memory
async fn read_tail<R>(pipe: Option<R>, mut tail: OutputTail) -> std::io::Result<OutputTail>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(tail);
    };

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            return Ok(tail);
        }
        tail.push(&buf[..n]);
    }
}

/// Resolve the job's working directory inside the unpacked artifact
fn working_dir(root: &Path, spec: &JobSpec) -> Result<PathBuf, String> {
    let Some(ref dir) = spec.working_dir else {
        return Ok(root.to_path_buf());
    };

    let rel = normalize_relative_path(dir).map_err(|e| e.to_string())?;
    let path = root.join(rel);
    if !path.is_dir() {
        return Err(format!("working directory '{}' not found in artifact", dir));
    }
    Ok(path)
}

#[cfg(unix)]
fn describe_signal(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("terminated by signal {}", signal),
        None => "terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_signal(_status: &std::process::ExitStatus) -> String {
    "terminated abnormally".to_string()
}
