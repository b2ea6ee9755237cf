//! In-memory directory trees.
//!
//! A `DirectoryTree` is the unit the generator produces, the packager
//! serializes, and the diff publisher compares. Paths are relative,
//! `/`-separated and validated on insert; modes keep only permission bits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

/// Permission bits kept on every entry
pub const MODE_MASK: u32 = 0o777;

/// Mode used where the platform cannot report one
pub const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Invalid tree path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Tree path '{path}' conflicts with '{existing}': a file cannot also be a directory")]
    Conflict { path: String, existing: String },

    #[error("Unsupported entry (symlinks and special files are not packaged): {0}")]
    UnsupportedEntry(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// One regular file in a tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// POSIX permission bits (masked with `MODE_MASK`)
    pub mode: u32,

    pub contents: Vec<u8>,
}

/// A set of files keyed by relative path, iterated in sorted order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryTree {
    files: BTreeMap<String, FileEntry>,
}

impl DirectoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file. The path is normalized first, and may not
    /// use an existing file as a directory or shadow existing files.
    pub fn insert(
        &mut self,
        path: &str,
        mode: u32,
        contents: impl Into<Vec<u8>>,
    ) -> Result<(), TreeError> {
        let path = normalize_relative_path(path)?;
        if let Some(existing) = self.conflict(&path) {
            return Err(TreeError::Conflict { path, existing });
        }
        self.files.insert(
            path,
            FileEntry {
                mode: mode & MODE_MASK,
                contents: contents.into(),
            },
        );
        Ok(())
    }

    /// An existing file that is an ancestor or a descendant of `path`
    fn conflict(&self, path: &str) -> Option<String> {
        let ancestor = path
            .match_indices('/')
            .map(|(i, _)| &path[..i])
            .find(|dir| self.files.contains_key(*dir));
        if let Some(dir) = ancestor {
            return Some(dir.to_string());
        }

        let dir = format!("{}/", path);
        self.files
            .range(dir.clone()..)
            .next()
            .filter(|(key, _)| key.starts_with(&dir))
            .map(|(key, _)| key.clone())
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &FileEntry)> {
        self.files.iter().map(|(path, entry)| (path.as_str(), entry))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sum of all file sizes
    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|e| e.contents.len() as u64).sum()
    }

    /// Read a directory from disk. Directories themselves are not recorded;
    /// symlinks and special files are rejected.
    pub fn from_dir(root: &Path) -> Result<Self, TreeError> {
        let mut tree = Self::new();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
        {
            let entry = entry?;
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| TreeError::InvalidPath {
                    path: entry.path().display().to_string(),
                    reason: "outside of tree root",
                })?;
            let rel = rel.to_string_lossy().replace('\\', "/");

            if !file_type.is_file() {
                return Err(TreeError::UnsupportedEntry(rel));
            }

            let metadata = entry.metadata()?;
            let contents = std::fs::read(entry.path()).map_err(|source| TreeError::Io {
                path: entry.path().to_path_buf(),
                source,
            })?;

            tree.insert(&rel, file_mode(&metadata), contents)?;
        }

        Ok(tree)
    }

    /// Materialize the tree under `dest`, creating parent directories.
    pub fn write_to(&self, dest: &Path) -> Result<(), TreeError> {
        for (path, entry) in &self.files {
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|source| TreeError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            std::fs::write(&target, &entry.contents).map_err(|source| TreeError::Io {
                path: target.clone(),
                source,
            })?;
            apply_mode(&target, entry.mode).map_err(|source| TreeError::Io {
                path: target.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Normalize a relative tree path: `/`-separated, no empty or `.` segments,
/// never absolute, never climbing with `..`.
pub fn normalize_relative_path(raw: &str) -> Result<String, TreeError> {
    let invalid = |reason| TreeError::InvalidPath {
        path: raw.to_string(),
        reason,
    };

    if raw.starts_with('/') {
        return Err(invalid("absolute path"));
    }
    if raw.contains('\0') {
        return Err(invalid("contains NUL"));
    }

    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(invalid("parent directory reference")),
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(invalid("empty path"));
    }

    Ok(segments.join("/"))
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & MODE_MASK
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        DEFAULT_FILE_MODE
    }
}

/// Apply permission bits to a file on disk
#[cfg(unix)]
pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & MODE_MASK))
}

#[cfg(not(unix))]
pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o222 == 0);
    std::fs::set_permissions(path, permissions)
}
