//! Verification Job Runner Tests
//!
//! What a job sees (environment, workspace) and how its outcome is
//! classified.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::sync::Arc;

use gencheck::adapters::MemoryObjectStore;
use gencheck::core::packager::pack;
use gencheck::core::{ArtifactStore, JobRunner, Limits};
use gencheck::domain::{BuildId, DirectoryTree, ErrorKind, JobSpec, JobStatus};
use tempfile::TempDir;

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

async fn published(files: &[(&str, &str)]) -> (Arc<ArtifactStore>, BuildId) {
    let store = Arc::new(ArtifactStore::new(Arc::new(MemoryObjectStore::new()), "ci"));
    let id = BuildId::derive("0123456789abcdef", 1);

    let mut tree = DirectoryTree::new();
    for (path, contents) in files {
        tree.insert(path, 0o644, *contents).unwrap();
    }
    store
        .put(&id, "0123456789abcdef", &pack(&tree).unwrap(), tree.len())
        .await
        .unwrap();
    (store, id)
}

#[tokio::test]
async fn test_job_environment() {
    let temp = TempDir::new().unwrap();
    let (store, id) = published(&[("lib.rs", "")]).await;

    let environment = BTreeMap::from([
        ("SDK_REGION".to_string(), "us-west-2".to_string()),
        ("NOT_FORWARDED".to_string(), "secret".to_string()),
    ]);
    let runner = JobRunner::new(store, temp.path(), Limits::default(), environment);

    let mut spec = JobSpec::new(
        "env",
        sh("echo \"$GENCHECK_BUILD_ID $GENCHECK_JOB $SDK_REGION $PROFILE ${NOT_FORWARDED:-none}\""),
    );
    spec.pass_env = vec!["SDK_REGION".to_string()];
    spec.env.insert("PROFILE".to_string(), "ci".to_string());

    let result = runner.run(&spec, &id).await;

    assert_eq!(result.status, JobStatus::Passed);
    assert_eq!(result.stdout, format!("{} env us-west-2 ci none\n", id));
}

#[tokio::test]
async fn test_workspaces_are_private() {
    let temp = TempDir::new().unwrap();
    let (store, id) = published(&[("lib.rs", "original\n")]).await;
    let runner = JobRunner::new(store, temp.path(), Limits::default(), BTreeMap::new());

    let first = runner
        .run(&JobSpec::new("mutate", sh("echo changed > lib.rs")), &id)
        .await;
    assert_eq!(first.status, JobStatus::Passed);

    let second = runner.run(&JobSpec::new("read", sh("cat lib.rs")), &id).await;
    assert_eq!(second.stdout, "original\n");
}

#[tokio::test]
async fn test_output_keeps_tail() {
    let temp = TempDir::new().unwrap();
    let (store, id) = published(&[("lib.rs", "")]).await;
    let limits = Limits {
        max_output_bytes: 16,
        ..Limits::default()
    };
    let runner = JobRunner::new(store, temp.path(), limits, BTreeMap::new());

    let spec = JobSpec::new("noisy", sh("seq 1 1000; echo FAILED HERE >&2; exit 1"));
    let result = runner.run(&spec, &id).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.stdout.ends_with("999\n1000\n"));
    assert!(result.stdout.starts_with("[... "));
    assert_eq!(result.stderr, "FAILED HERE\n");
}

#[tokio::test]
async fn test_signal_is_a_crash() {
    let temp = TempDir::new().unwrap();
    let (store, id) = published(&[("lib.rs", "")]).await;
    let runner = JobRunner::new(store, temp.path(), Limits::default(), BTreeMap::new());

    let result = runner.run(&JobSpec::new("segv", sh("kill -KILL $$")), &id).await;

    assert_eq!(result.status, JobStatus::Errored);
    assert_eq!(result.error_kind, Some(ErrorKind::Crash));
    assert_eq!(result.exit_code, None);
}

#[tokio::test]
async fn test_unknown_program_fails_to_spawn() {
    let temp = TempDir::new().unwrap();
    let (store, id) = published(&[("lib.rs", "")]).await;
    let runner = JobRunner::new(store, temp.path(), Limits::default(), BTreeMap::new());

    let spec = JobSpec::new("missing", vec!["gencheck-no-such-program".to_string()]);
    let result = runner.run(&spec, &id).await;

    assert_eq!(result.status, JobStatus::Errored);
    assert_eq!(result.error_kind, Some(ErrorKind::Spawn));
    assert!(result.artifact_digest.is_some());
}

#[tokio::test]
async fn test_job_timeout_kills_process() {
    let temp = TempDir::new().unwrap();
    let (store, id) = published(&[("lib.rs", "")]).await;
    let runner = JobRunner::new(store, temp.path(), Limits::default(), BTreeMap::new());

    let started = std::time::Instant::now();
    let spec = JobSpec::new("hang", sh("sleep 30")).with_timeout(1);
    let result = runner.run(&spec, &id).await;

    assert!(started.elapsed().as_secs() < 10);
    assert_eq!(result.status, JobStatus::Errored);
    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_large_output_is_streamed() {
    let temp = TempDir::new().unwrap();
    let (store, id) = published(&[("lib.rs", "")]).await;
    let limits = Limits {
        max_output_bytes: 64,
        ..Limits::default()
    };
    let runner = JobRunner::new(store, temp.path(), limits, BTreeMap::new());

    let spec = JobSpec::new(
        "verbose",
        sh("head -c 20000000 /dev/zero | tr '\\0' x; echo; echo done"),
    );
    let result = runner.run(&spec, &id).await;

    assert_eq!(result.status, JobStatus::Passed);
    assert!(result.stdout.starts_with("[... 19999942 bytes truncated ...]"));
    assert!(result.stdout.ends_with("x\ndone\n"));
}
