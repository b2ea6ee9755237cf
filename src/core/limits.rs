//! Resource limits for pipeline execution.
//!
//! Bounds the work a single build may do:
//! - Per-job and whole-run wall-clock timeouts
//! - Number of jobs running at once
//! - Packed artifact size
//! - Captured job output size

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Resource limits for a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Per-job timeout in seconds (default: 1800 = 30 min)
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,

    /// Deadline for the whole fan-out in seconds (default: 7200 = 2 hours)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Jobs allowed to run concurrently (default: 4)
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,

    /// Maximum packed artifact size in bytes (default: 512MB)
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,

    /// Captured stdout/stderr kept per stream in bytes (default: 64KB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_job_timeout() -> u64 {
    1800
}
fn default_run_timeout() -> u64 {
    7200
}
fn default_max_parallel_jobs() -> usize {
    4
}
fn default_max_artifact_bytes() -> u64 {
    512 * 1024 * 1024
}
fn default_max_output_bytes() -> usize {
    64 * 1024
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            job_timeout_seconds: default_job_timeout(),
            run_timeout_seconds: default_run_timeout(),
            max_parallel_jobs: default_max_parallel_jobs(),
            max_artifact_bytes: default_max_artifact_bytes(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Limits {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    /// Deadline for a run starting at `start`; None when it is too far
    /// away to represent, which means no deadline
    pub fn run_deadline(&self, start: Instant) -> Option<Instant> {
        start.checked_add(self.run_timeout())
    }

    /// Validate a packed artifact against the size limit
    pub fn check_artifact_size(&self, size: u64) -> Result<(), LimitViolation> {
        if size > self.max_artifact_bytes {
            return Err(LimitViolation::MaxArtifactBytes {
                actual: size,
                limit: self.max_artifact_bytes,
            });
        }
        Ok(())
    }

    /// Decode captured output, keeping only the last `max_output_bytes`
    pub fn truncate_output(&self, bytes: &[u8]) -> String {
        let mut tail = self.output_tail();
        tail.push(bytes);
        tail.finish()
    }

    /// Empty buffer for streaming one output stream
    pub fn output_tail(&self) -> OutputTail {
        OutputTail::new(self.max_output_bytes)
    }
}

/// The last `limit` bytes of a stream, plus a count of what was dropped
#[derive(Debug, Clone)]
pub struct OutputTail {
    limit: usize,
    kept: VecDeque<u8>,
    dropped: u64,
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            kept: VecDeque::with_capacity(limit.min(8 * 1024)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.limit {
            self.dropped += (self.kept.len() + chunk.len() - self.limit) as u64;
            self.kept.clear();
            self.kept.extend(&chunk[chunk.len() - self.limit..]);
            return;
        }

        let overflow = (self.kept.len() + chunk.len()).saturating_sub(self.limit);
        self.kept.drain(..overflow);
        self.dropped += overflow as u64;
        self.kept.extend(chunk);
    }

    /// Bytes currently held
    pub fn retained(&self) -> usize {
        self.kept.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Decode lossily, prefixed with a truncation marker when bytes were dropped
    pub fn finish(self) -> String {
        let dropped = self.dropped;
        let bytes: Vec<u8> = self.kept.into();
        let text = String::from_utf8_lossy(&bytes);
        if dropped == 0 {
            return text.into_owned();
        }
        format!("[... {} bytes truncated ...]\n{}", dropped, text)
    }
}

/// Limit violation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LimitViolation {
    #[error("Maximum artifact bytes exceeded: {actual} > {limit}")]
    MaxArtifactBytes { actual: u64, limit: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = Limits::default();
        assert_eq!(limits.job_timeout_seconds, 1800);
        assert_eq!(limits.max_parallel_jobs, 4);
        assert_eq!(limits.max_output_bytes, 64 * 1024);
    }

    #[test]
    fn test_streamed_output_is_bounded() {
        let mut tail = OutputTail::new(8);
        for i in 0..10_000u32 {
            tail.push(format!("line {}\n", i).as_bytes());
            assert!(tail.retained() <= 8);
        }
        tail.push(&[b'x'; 100]);
        assert_eq!(tail.retained(), 8);

        let out = tail.finish();
        assert!(out.starts_with("[... "));
        assert!(out.ends_with("xxxxxxxx"));
    }

    #[test]
    fn test_tail_matches_whole_buffer_truncation() {
        let limits = Limits {
            max_output_bytes: 5,
            ..Default::default()
        };
        let mut tail = limits.output_tail();
        for chunk in [&b"012"[..], &b"3456"[..], &b""[..], &b"789"[..]] {
            tail.push(chunk);
        }
        assert_eq!(tail.dropped(), 5);
        assert_eq!(tail.finish(), limits.truncate_output(b"0123456789"));
    }

    #[test]
    fn test_unrepresentable_run_deadline() {
        let now = Instant::now();
        let limits = Limits {
            run_timeout_seconds: 60,
            ..Default::default()
        };
        assert_eq!(limits.run_deadline(now), Some(now + Duration::from_secs(60)));

        let limits = Limits {
            run_timeout_seconds: u64::MAX,
            ..Default::default()
        };
        assert_eq!(limits.run_deadline(now), None);
    }

    #[test]
    fn test_artifact_size_check() {
        let limits = Limits {
            max_artifact_bytes: 100,
            ..Default::default()
        };

        assert!(limits.check_artifact_size(100).is_ok());
        assert!(matches!(
            limits.check_artifact_size(101),
            Err(LimitViolation::MaxArtifactBytes { actual: 101, limit: 100 })
        ));
    }

    #[test]
    fn test_output_keeps_tail() {
        let limits = Limits {
            max_output_bytes: 4,
            ..Default::default()
        };

        assert_eq!(limits.truncate_output(b"abc"), "abc");

        let out = limits.truncate_output(b"0123456789");
        assert!(out.starts_with("[... 6 bytes truncated ...]"));
        assert!(out.ends_with("6789"));
    }
}
