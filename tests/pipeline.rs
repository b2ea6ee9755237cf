//! Pipeline Integration Tests
//!
//! End-to-end runs through the orchestrator: generation, packaging, the
//! job fan-out, the gate, and the ledger they leave behind.

#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use common::{orchestrator, pipeline, sh, ScriptedGenerator};
use gencheck::core::{categorize, FailureCategory, GateStatus};
use gencheck::domain::{BuildId, BuildState, ErrorKind, JobSpec, JobStatus};
use tempfile::TempDir;

fn sdk_generator() -> ScriptedGenerator {
    ScriptedGenerator::new().with(
        "abc123",
        &[
            ("Cargo.toml", "[package]\nname = \"sdk\"\n"),
            ("sdk/s3/lib.rs", "pub struct S3Client;\n"),
            ("sdk/sts/lib.rs", "pub struct StsClient;\n"),
        ],
    )
}

#[tokio::test]
async fn test_all_jobs_pass() {
    let temp = TempDir::new().unwrap();
    let jobs = vec![
        JobSpec::new("compile", sh("test -f Cargo.toml")),
        JobSpec::new("s3", sh("grep -q S3Client lib.rs")).with_working_dir("sdk/s3"),
        JobSpec::new("docs", sh("true")).advisory(),
    ];
    let (orchestrator, _) = orchestrator(temp.path(), pipeline(jobs), sdk_generator());

    let report = orchestrator.run_pipeline("abc123", 1).await.unwrap();

    assert!(report.aborted.is_none());
    assert_eq!(report.decision.status, GateStatus::Passed);
    assert_eq!(report.results.len(), 3);

    let artifact = report.artifact.unwrap();
    assert_eq!(artifact.file_count, 3);
    for result in report.results.values() {
        assert_eq!(result.artifact_digest.as_deref(), Some(artifact.digest.as_str()));
    }

    let run = orchestrator.status(&report.build_id).await.unwrap().unwrap();
    assert_eq!(run.state, BuildState::Gated { passed: true });
    assert_eq!(run.results.len(), 3);
}

#[tokio::test]
async fn test_failures_are_isolated() {
    let temp = TempDir::new().unwrap();
    let jobs = vec![
        JobSpec::new("compile", sh("true")),
        JobSpec::new("unit-tests", sh("echo 'test failed' >&2; exit 1")),
        JobSpec::new("semver", sh("exit 3")).advisory(),
        JobSpec::new("lint", sh("true")),
    ];
    let (orchestrator, _) = orchestrator(temp.path(), pipeline(jobs), sdk_generator());

    let report = orchestrator.run_pipeline("abc123", 1).await.unwrap();

    assert_eq!(report.decision.status, GateStatus::Failed);
    assert_eq!(report.results["compile"].status, JobStatus::Passed);
    assert_eq!(report.results["lint"].status, JobStatus::Passed);
    assert_eq!(report.results["unit-tests"].status, JobStatus::Failed);
    assert_eq!(report.results["unit-tests"].stderr, "test failed\n");
    assert_eq!(report.results["semver"].exit_code, Some(3));

    let blocking: Vec<&str> = report.decision.reasons.iter().map(|r| r.job()).collect();
    assert_eq!(blocking, vec!["unit-tests"]);
}

#[tokio::test]
async fn test_generation_failure_skips_every_job() {
    let temp = TempDir::new().unwrap();
    let jobs = vec![
        JobSpec::new("compile", sh("true")),
        JobSpec::new("docs", sh("true")).advisory(),
    ];
    let (orchestrator, objects) = orchestrator(temp.path(), pipeline(jobs), sdk_generator());

    let report = orchestrator.run_pipeline("unknown", 1).await.unwrap();

    let aborted = report.aborted.unwrap();
    assert_eq!(aborted.category, FailureCategory::Generation);
    assert!(report.artifact.is_none());
    assert!(report
        .results
        .values()
        .all(|r| r.status == JobStatus::Skipped));
    assert!(!report.decision.passed());

    assert!(objects.keys().await.is_empty());

    let run = orchestrator.status(&report.build_id).await.unwrap().unwrap();
    assert!(run.is_aborted());

    let verified = orchestrator.verify(&report.build_id, "compile").await.unwrap();
    assert_eq!(verified.status, JobStatus::Skipped);
}

#[tokio::test]
async fn test_job_timeout_is_errored() {
    let temp = TempDir::new().unwrap();
    let jobs = vec![
        JobSpec::new("quick", sh("true")),
        JobSpec::new("hang", sh("sleep 30")).with_timeout(1),
    ];
    let (orchestrator, _) = orchestrator(temp.path(), pipeline(jobs), sdk_generator());

    let started = Instant::now();
    let report = orchestrator.run_pipeline("abc123", 1).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(report.results["quick"].status, JobStatus::Passed);
    assert_eq!(report.results["hang"].status, JobStatus::Errored);
    assert_eq!(report.results["hang"].error_kind, Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn test_run_deadline_cancels_remaining_jobs() {
    let temp = TempDir::new().unwrap();
    let jobs = vec![
        JobSpec::new("quick", sh("true")),
        JobSpec::new("slow", sh("sleep 30")),
    ];
    let mut pipeline = pipeline(jobs);
    pipeline.limits.run_timeout_seconds = 1;
    let (orchestrator, _) = orchestrator(temp.path(), pipeline, sdk_generator());

    let started = Instant::now();
    let report = orchestrator.run_pipeline("abc123", 1).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(report.results["quick"].status, JobStatus::Passed);
    assert_eq!(report.results["slow"].status, JobStatus::Cancelled);
    assert!(!report.decision.passed());
}

#[tokio::test]
async fn test_parallelism_is_bounded() {
    let temp = TempDir::new().unwrap();
    let lock = temp.path().join("lock");
    let script = format!("mkdir '{0}' || exit 1; sleep 0.2; rmdir '{0}'", lock.display());

    let jobs = (0..4)
        .map(|i| JobSpec::new(format!("job{}", i), sh(&script)))
        .collect();
    let mut pipeline = pipeline(jobs);
    pipeline.limits.max_parallel_jobs = 1;
    let (orchestrator, _) = orchestrator(temp.path(), pipeline, sdk_generator());

    let report = orchestrator.run_pipeline("abc123", 1).await.unwrap();
    assert!(report.decision.passed(), "{}", report.decision.summary());
}

#[tokio::test]
async fn test_missing_input_skips_and_blocks() {
    let temp = TempDir::new().unwrap();
    let jobs = vec![
        JobSpec::new("compile", sh("true")),
        JobSpec::new("integration", sh("true")).with_required_env("AWS_ACCESS_KEY_ID"),
    ];
    let (orchestrator, _) = orchestrator(temp.path(), pipeline(jobs), sdk_generator());

    let report = orchestrator.run_pipeline("abc123", 1).await.unwrap();

    assert_eq!(report.results["integration"].status, JobStatus::Skipped);
    assert!(!report.decision.passed());
}

#[tokio::test]
async fn test_build_ids_are_write_once() {
    let temp = TempDir::new().unwrap();
    let jobs = vec![JobSpec::new("compile", sh("true"))];
    let (orchestrator, _) = orchestrator(temp.path(), pipeline(jobs), sdk_generator());

    let first = orchestrator.run_pipeline("abc123", 1).await.unwrap();
    assert!(first.decision.passed());

    let err = orchestrator.run_pipeline("abc123", 1).await.unwrap_err();
    assert_eq!(categorize(&err), FailureCategory::Packaging);

    let retry = orchestrator.run_pipeline("abc123", 2).await.unwrap();
    assert_ne!(retry.build_id, first.build_id);
    assert!(retry.decision.passed());
}

#[tokio::test]
async fn test_gate_reevaluates_from_ledger() {
    let temp = TempDir::new().unwrap();
    let jobs = vec![
        JobSpec::new("compile", sh("true")),
        JobSpec::new("unit-tests", sh("true")),
    ];
    let (orchestrator, _) = orchestrator(temp.path(), pipeline(jobs), sdk_generator());

    let generated = orchestrator.generate("abc123", 1).await.unwrap();
    orchestrator.package(&generated.build_id).await.unwrap();
    orchestrator.verify(&generated.build_id, "compile").await.unwrap();

    // unit-tests never reported
    let decision = orchestrator.gate(&generated.build_id).await.unwrap();
    assert!(!decision.passed());
    let entry = decision.entry("unit-tests").unwrap();
    assert!(entry.missing);
    assert_eq!(entry.status, JobStatus::Cancelled);

    orchestrator.verify(&generated.build_id, "unit-tests").await.unwrap();
    assert!(orchestrator.gate(&generated.build_id).await.unwrap().passed());
}

#[tokio::test]
async fn test_unbounded_run_deadline() {
    let temp = TempDir::new().unwrap();
    let mut pipeline = pipeline(vec![JobSpec::new("compile", sh("true"))]);
    pipeline.limits.run_timeout_seconds = u64::MAX;
    pipeline.limits.job_timeout_seconds = u64::MAX;
    pipeline.validate().unwrap();
    let (orchestrator, _) = orchestrator(temp.path(), pipeline, sdk_generator());

    let report = orchestrator.run_pipeline("abc123", 1).await.unwrap();

    assert!(report.decision.passed());
    assert!(report.failure().is_none());
}

#[tokio::test]
async fn test_report_failure_carries_exit_category() {
    let temp = TempDir::new().unwrap();
    let jobs = vec![JobSpec::new("unit-tests", sh("exit 1"))];
    let (orchestrator, _) = orchestrator(temp.path(), pipeline(jobs), sdk_generator());

    let aborted = orchestrator.run_pipeline("unknown", 1).await.unwrap();
    let err: anyhow::Error = aborted.failure().unwrap().into();
    assert_eq!(categorize(&err), FailureCategory::Generation);

    let gated = orchestrator.run_pipeline("abc123", 1).await.unwrap();
    let err: anyhow::Error = gated.failure().unwrap().into();
    assert_eq!(categorize(&err), FailureCategory::Gate);
}

#[tokio::test]
async fn test_package_without_generation_is_a_packaging_failure() {
    let temp = TempDir::new().unwrap();
    let jobs = vec![JobSpec::new("compile", sh("true"))];
    let (orchestrator, objects) = orchestrator(temp.path(), pipeline(jobs), sdk_generator());

    let never_generated = BuildId::derive("feedfacecafe", 1);
    let err = orchestrator.package(&never_generated).await.unwrap_err();

    assert_eq!(categorize(&err), FailureCategory::Packaging);
    assert!(objects.keys().await.is_empty());
}
