//! Object storage backends.
//!
//! `FsObjectStore` keeps one file per key under a root directory.
//! `MemoryObjectStore` is an in-process map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::tree::normalize_relative_path;

use super::ObjectStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Artifact for build {0} does not match its recorded digest")]
    DigestMismatch(String),

    #[error("Storage IO error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn validate_key(key: &str) -> Result<String, StoreError> {
    let normalized =
        normalize_relative_path(key).map_err(|_| StoreError::InvalidKey(key.to_string()))?;
    if normalized != key {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(normalized)
}

/// Filesystem-backed object store
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(validate_key(key)?))
    }

    /// Write bytes to a fresh temporary file next to `path`
    async fn write_temp(&self, key: &str, path: &Path, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };

        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).await.map_err(io_err)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));
        fs::write(&temp, bytes).await.map_err(io_err)?;
        Ok(temp)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn name(&self) -> &str {
        "fs"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let temp = self.write_temp(key, &path, bytes).await?;

        // Rename is atomic: readers see the old or the new value, never a partial one
        if let Err(source) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StoreError::Io {
                key: key.to_string(),
                source,
            });
        }
        Ok(())
    }

    async fn put_new(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let temp = self.write_temp(key, &path, bytes).await?;

        // hard_link fails if the target exists, so only one writer can win
        let linked = fs::hard_link(&temp, &path).await;
        let _ = fs::remove_file(&temp).await;

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(key.to_string()))
            }
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        fs::try_exists(&path).await.map_err(|source| StoreError::Io {
            key: key.to_string(),
            source,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// In-memory object store
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored, in order
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let key = validate_key(key)?;
        self.objects.write().await.insert(key, bytes.to_vec());
        Ok(())
    }

    async fn put_new(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let key = validate_key(key)?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        objects.insert(key, bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_put_get() {
        let temp = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp.path());

        store.put("ns/a/report.json", b"{}").await.unwrap();
        assert!(store.exists("ns/a/report.json").await.unwrap());
        assert_eq!(store.get("ns/a/report.json").await.unwrap(), b"{}");

        store.put("ns/a/report.json", b"[]").await.unwrap();
        assert_eq!(store.get("ns/a/report.json").await.unwrap(), b"[]");
    }

    #[tokio::test]
    async fn test_fs_put_new_is_write_once() {
        let temp = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp.path());

        store.put_new("blob", b"first").await.unwrap();
        let err = store.put_new("blob", b"second").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.get("blob").await.unwrap(), b"first");

        // No temporary files left behind
        let leftovers: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_fs_missing_key() {
        let temp = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp.path());

        assert!(!store.exists("nope").await.unwrap());
        assert!(matches!(store.get("nope").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp.path());

        assert!(matches!(
            store.put("../outside", b"x").await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.put("/abs", b"x").await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_frees_key() {
        let temp = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp.path());

        store.put_new("ns/blob", b"first").await.unwrap();
        store.delete("ns/blob").await.unwrap();
        assert!(!store.exists("ns/blob").await.unwrap());
        store.delete("ns/blob").await.unwrap();

        store.put_new("ns/blob", b"second").await.unwrap();
        assert_eq!(store.get("ns/blob").await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_memory_store_write_once() {
        let store = MemoryObjectStore::new();
        store.put_new("k", b"1").await.unwrap();
        assert!(matches!(
            store.put_new("k", b"2").await,
            Err(StoreError::AlreadyExists(_))
        ));
        store.put("k", b"3").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"3");
        assert_eq!(store.keys().await, vec!["k".to_string()]);
    }
}
