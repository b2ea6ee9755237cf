//! Append-only build ledger with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL), one file per build:
//! `<base>/<build_id>/events.jsonl`. Several `verify` processes may append
//! to the same ledger at once, so appends hold an exclusive file lock.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::domain::{BuildId, BuildRun, Event};

/// File-based ledger using JSONL format
pub struct EventStore {
    build_id: BuildId,

    /// Directory containing the build's ledger
    build_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl EventStore {
    /// Create or open the ledger for a build
    pub async fn open(base_dir: &Path, build_id: &BuildId) -> Result<Self> {
        let build_dir = base_dir.join(build_id.as_str());

        fs::create_dir_all(&build_dir)
            .await
            .with_context(|| format!("Failed to create build directory: {}", build_dir.display()))?;

        let events_path = build_dir.join("events.jsonl");

        Ok(Self {
            build_id: build_id.clone(),
            build_dir,
            events_path,
        })
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the build directory
    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        if event.build_id != self.build_id {
            anyhow::bail!(
                "Refusing to record an event of build {} in the ledger of {}",
                event.build_id,
                self.build_id
            );
        }

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        let events_path = self.events_path.clone();

        tokio::task::spawn_blocking(move || append_locked(&events_path, &json))
            .await
            .context("Ledger append task failed")?
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !fs::try_exists(&self.events_path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Reconstruct the build view (None if nothing was recorded yet)
    pub async fn build_run(&self) -> Result<Option<BuildRun>> {
        let events = self.replay().await?;
        Ok(BuildRun::from_events(&self.build_id, &events))
    }

    /// List all build ids with a ledger under `base_dir`
    pub async fn list_builds(base_dir: &Path) -> Result<Vec<BuildId>> {
        if !fs::try_exists(base_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut builds = Vec::new();
        let mut entries = fs::read_dir(base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(id) = BuildId::new(name) {
                        builds.push(id);
                    }
                }
            }
        }

        builds.sort();
        Ok(builds)
    }
}

/// Append one JSON line under an exclusive lock
fn append_locked(events_path: &Path, json: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(events_path)
        .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

    file.lock_exclusive()
        .context("Failed to acquire file lock on events.jsonl")?;

    writeln!(file, "{}", json).context("Failed to write event")?;
    file.flush().context("Failed to flush event")?;

    // Lock is released when file is dropped
    Ok(())
}

/// Generate an idempotency key for an action within a build
pub fn generate_idempotency_key(build_id: &BuildId, scope: &str, input: &str) -> String {
    format!("{}:{}:{}", build_id, scope, hash_input(input))
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
