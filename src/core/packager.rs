//! Packing directory trees into transportable zip artifacts.
//!
//! Packing is deterministic: entries are written in sorted path order with a
//! fixed timestamp and compression method, so the same tree always yields
//! the same bytes. Unpacking trusts nothing: truncated archives, entries
//! escaping the destination, duplicate or conflicting entries and special
//! modes are errors.

use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use thiserror::Error;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::domain::tree::{normalize_relative_path, DEFAULT_FILE_MODE, MODE_MASK};
use crate::domain::{DirectoryTree, TreeError};

/// File type bits of a POSIX mode
const S_IFMT: u32 = 0o170000;
/// Regular file type
const S_IFREG: u32 = 0o100000;
/// setuid, setgid and sticky bits
const SPECIAL_BITS: u32 = 0o7000;
/// Largest buffer reserved up front for one entry
const PREALLOCATE_LIMIT: u64 = 1 << 20;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("Zip error: {0}")]
    Zip(#[from] ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("Malformed or truncated artifact: {0}")]
    Malformed(String),

    #[error("Entry escapes the destination: {0}")]
    PathTraversal(String),

    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("Entry {path} conflicts with {existing}")]
    Conflict { path: String, existing: String },

    #[error("Cannot apply mode {mode:o} to {path}")]
    UnsupportedMode { path: String, mode: u32 },

    #[error("IO error while unpacking: {0}")]
    Io(String),
}

/// Serialize a tree into zip bytes
pub fn pack(tree: &DirectoryTree) -> Result<Vec<u8>, PackError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for (path, entry) in tree.files() {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .unix_permissions(entry.mode & MODE_MASK);

        writer.start_file(path, options)?;
        writer.write_all(&entry.contents)?;
    }

    Ok(writer.finish()?.into_inner())
}

/// Decode zip bytes into a tree without touching the filesystem
pub fn read(bytes: &[u8]) -> Result<DirectoryTree, UnpackError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(malformed)?;
    let mut tree = DirectoryTree::new();
    let mut seen = HashSet::new();

    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(malformed)?;
        let raw_name = file.name().to_string();

        if file.enclosed_name().is_none() {
            return Err(UnpackError::PathTraversal(raw_name));
        }
        let path = normalize_relative_path(&raw_name)
            .map_err(|_| UnpackError::PathTraversal(raw_name.clone()))?;

        if file.is_dir() {
            continue;
        }

        let mode = entry_mode(&path, file.unix_mode())?;

        if !seen.insert(path.clone()) {
            return Err(UnpackError::DuplicateEntry(path));
        }

        // Sizes come from the archive and may lie
        let mut contents = Vec::with_capacity(file.size().min(PREALLOCATE_LIMIT) as usize);
        file.read_to_end(&mut contents)
            .map_err(|e| UnpackError::Malformed(format!("{}: {}", path, e)))?;

        tree.insert(&path, mode, contents).map_err(|e| match e {
            TreeError::Conflict { path, existing } => UnpackError::Conflict { path, existing },
            _ => UnpackError::PathTraversal(path.clone()),
        })?;
    }

    Ok(tree)
}

/// Unpack zip bytes into `destination` and return the tree written
pub fn unpack(bytes: &[u8], destination: &Path) -> Result<DirectoryTree, UnpackError> {
    let tree = read(bytes)?;

    std::fs::create_dir_all(destination)
        .map_err(|e| UnpackError::Io(format!("{}: {}", destination.display(), e)))?;
    tree.write_to(destination).map_err(|e| match e {
        TreeError::Io { path, source } => {
            UnpackError::Io(format!("{}: {}", path.display(), source))
        }
        other => UnpackError::Io(other.to_string()),
    })?;

    Ok(tree)
}

fn malformed(e: ZipError) -> UnpackError {
    UnpackError::Malformed(e.to_string())
}

/// Validate an entry's mode: regular files only, no special bits
fn entry_mode(path: &str, raw: Option<u32>) -> Result<u32, UnpackError> {
    let Some(mode) = raw else {
        return Ok(DEFAULT_FILE_MODE);
    };

    let file_type = mode & S_IFMT;
    if (file_type != 0 && file_type != S_IFREG) || mode & SPECIAL_BITS != 0 {
        return Err(UnpackError::UnsupportedMode {
            path: path.to_string(),
            mode,
        });
    }

    Ok(mode & MODE_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree() -> DirectoryTree {
        let mut tree = DirectoryTree::new();
        tree.insert("Cargo.toml", 0o644, "[package]\nname = \"sdk\"\n").unwrap();
        tree.insert("src/lib.rs", 0o644, "pub mod client;\n").unwrap();
        tree.insert("src/client.rs", 0o600, "pub struct Client;\n").unwrap();
        tree.insert("ci/check.sh", 0o755, "#!/bin/sh\ncargo test\n").unwrap();
        tree
    }

    #[test]
    fn test_pack_is_deterministic() {
        let tree = sample_tree();
        assert_eq!(pack(&tree).unwrap(), pack(&tree).unwrap());
    }

    #[test]
    fn test_unpack_restores_tree() {
        let temp = TempDir::new().unwrap();
        let tree = sample_tree();

        let bytes = pack(&tree).unwrap();
        let unpacked = unpack(&bytes, temp.path()).unwrap();

        assert_eq!(unpacked, tree);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("src/client.rs")).unwrap(),
            "pub struct Client;\n"
        );
        #[cfg(unix)]
        assert_eq!(DirectoryTree::from_dir(temp.path()).unwrap(), tree);
    }

    #[test]
    fn test_truncated_input() {
        let bytes = pack(&sample_tree()).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(read(truncated), Err(UnpackError::Malformed(_))));
        assert!(matches!(read(b""), Err(UnpackError::Malformed(_))));
    }

    fn raw_archive(name: &str, mode: u32) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().unix_permissions(mode);
        writer.start_file(name, options).unwrap();
        writer.write_all(b"payload").unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_rejects_path_traversal() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dest");

        let bytes = raw_archive("../evil.sh", 0o644);
        assert!(matches!(
            unpack(&bytes, &dest),
            Err(UnpackError::PathTraversal(_))
        ));
        assert!(!temp.path().join("evil.sh").exists());
    }

    #[test]
    fn test_rejects_special_mode_bits() {
        assert!(matches!(
            entry_mode("x", Some(S_IFREG | 0o4755)),
            Err(UnpackError::UnsupportedMode { .. })
        ));
        assert!(matches!(
            entry_mode("link", Some(0o120777)),
            Err(UnpackError::UnsupportedMode { .. })
        ));
        assert_eq!(entry_mode("f", Some(S_IFREG | 0o640)).unwrap(), 0o640);
        assert_eq!(entry_mode("f", None).unwrap(), DEFAULT_FILE_MODE);
    }
}
