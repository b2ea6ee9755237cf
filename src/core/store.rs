//! Artifact Store: write-once storage of packed builds.
//!
//! Each build id owns two keys under `<namespace>/artifacts/<build_id>/`:
//! the blob, written first, and the JSON metadata sidecar, written second.
//! An artifact exists once its sidecar exists. A failed sidecar write
//! removes the blob again so the build id can be published later. Reads
//! re-hash the blob.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::adapters::{ObjectStore, StoreError};
use crate::domain::{Artifact, BuildId};

pub struct ArtifactStore {
    objects: Arc<dyn ObjectStore>,
    namespace: String,
}

impl ArtifactStore {
    pub fn new(objects: Arc<dyn ObjectStore>, namespace: impl Into<String>) -> Self {
        Self {
            objects,
            namespace: namespace.into(),
        }
    }

    /// Underlying object store (shared with the diff publisher)
    pub fn objects(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.objects)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn blob_key(&self, build_id: &BuildId) -> String {
        format!("{}/artifacts/{}/artifact.zip", self.namespace, build_id)
    }

    pub fn metadata_key(&self, build_id: &BuildId) -> String {
        format!("{}/artifacts/{}/artifact.json", self.namespace, build_id)
    }

    /// Publish a packed tree. A second publish for the same build id fails
    /// with `AlreadyExists` and leaves the first one untouched.
    pub async fn put(
        &self,
        build_id: &BuildId,
        source_revision: &str,
        bytes: &[u8],
        file_count: usize,
    ) -> Result<Artifact, StoreError> {
        let metadata_key = self.metadata_key(build_id);
        if self.objects.exists(&metadata_key).await? {
            return Err(StoreError::AlreadyExists(metadata_key));
        }

        let blob_key = self.blob_key(build_id);
        self.objects.put_new(&blob_key, bytes).await?;

        let artifact = Artifact::new(
            build_id.clone(),
            source_revision.to_string(),
            bytes,
            file_count,
        );
        if let Err(e) = self.write_metadata(&metadata_key, &artifact).await {
            if let Err(cleanup) = self.objects.delete(&blob_key).await {
                warn!(build_id = %build_id, error = %cleanup, "Orphan artifact blob not removed");
            }
            return Err(e);
        }

        info!(
            build_id = %build_id,
            size_bytes = artifact.size_bytes,
            digest = %artifact.digest,
            "Artifact published"
        );
        Ok(artifact)
    }

    async fn write_metadata(&self, key: &str, artifact: &Artifact) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(artifact)?;
        self.objects.put_new(key, &json).await
    }

    pub async fn exists(&self, build_id: &BuildId) -> Result<bool, StoreError> {
        self.objects.exists(&self.metadata_key(build_id)).await
    }

    /// Metadata of a published artifact
    pub async fn metadata(&self, build_id: &BuildId) -> Result<Artifact, StoreError> {
        let json = self.objects.get(&self.metadata_key(build_id)).await?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Metadata and verified bytes of a published artifact
    pub async fn get(&self, build_id: &BuildId) -> Result<(Artifact, Vec<u8>), StoreError> {
        let artifact = self.metadata(build_id).await?;
        let bytes = self.objects.get(&self.blob_key(build_id)).await?;

        if !artifact.matches(&bytes) {
            return Err(StoreError::DigestMismatch(build_id.to_string()));
        }

        debug!(build_id = %build_id, size_bytes = bytes.len(), "Artifact fetched");
        Ok((artifact, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryObjectStore;

    fn store() -> (ArtifactStore, Arc<MemoryObjectStore>) {
        let objects = Arc::new(MemoryObjectStore::new());
        (ArtifactStore::new(objects.clone(), "ci"), objects)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (store, _) = store();
        let id = BuildId::new("rev-abc123").unwrap();

        assert!(!store.exists(&id).await.unwrap());
        let artifact = store.put(&id, "abc123", b"zipbytes", 2).await.unwrap();
        assert!(store.exists(&id).await.unwrap());

        let (fetched, bytes) = store.get(&id).await.unwrap();
        assert_eq!(fetched, artifact);
        assert_eq!(bytes, b"zipbytes");
    }

    #[tokio::test]
    async fn test_second_write_rejected() {
        let (store, _) = store();
        let id = BuildId::new("rev-abc123").unwrap();

        store.put(&id, "abc123", b"first", 1).await.unwrap();
        let err = store.put(&id, "abc123", b"second", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let (_, bytes) = store.get(&id).await.unwrap();
        assert_eq!(bytes, b"first");
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let (store, objects) = store();
        let id = BuildId::new("rev-abc123").unwrap();

        store.put(&id, "abc123", b"original", 1).await.unwrap();
        objects.put(&store.blob_key(&id), b"tampered").await.unwrap();

        assert!(matches!(
            store.get(&id).await,
            Err(StoreError::DigestMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let (store, _) = store();
        let id = BuildId::new("rev-missing").unwrap();
        assert!(matches!(store.get(&id).await, Err(StoreError::NotFound(_))));
    }
}
