//! Content-addressed object model: blobs, commits and the verified store
//!
//! Objects are immutable values. Writing the same object twice yields the
//! same key; reads verify that stored bytes still hash to the requested
//! key and surface `Corrupt` if they do not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::canonical::{canonical_json, object_digest};
use crate::error::{EngramError, Result};
use crate::storage::StorageBackend;
use crate::types::{ActionType, Hash, ObjectKind};

/// Marker prefix for encrypted payloads at rest.
///
/// Canonical JSON always starts with a JSON token, so the prefix is
/// unambiguous. A plaintext reader that encounters it knows the tenant
/// requires a passphrase.
pub(crate) const ENVELOPE_MAGIC: &[u8] = b"ENG1";

/// Content-addressed blob holding one serialized agent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    pub data: Value,
}

impl Blob {
    pub fn new(data: Value) -> Self {
        Blob { data }
    }

    /// The canonical byte form; this is both the wire format and the
    /// hashing input.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_json(&self.data)
    }

    pub fn hash(&self) -> Hash {
        object_digest(&self.canonical_bytes())
    }
}

/// A commit linking a state blob to zero, one or two parents.
///
/// `parent_hashes` is empty for a root commit, one entry for a linear
/// commit and two for a merge. The identity hash covers every field, with
/// parents in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub tree_hash: Hash,
    pub parent_hashes: Vec<Hash>,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub action_type: ActionType,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl Commit {
    /// Canonical byte form of the commit record.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let value = serde_json::json!({
            "action_type": self.action_type,
            "author": self.author,
            "message": self.message,
            "metadata": self.metadata,
            "parent_hashes": self.parent_hashes,
            "timestamp": self.timestamp.to_rfc3339(),
            "tree_hash": self.tree_hash,
        });
        canonical_json(&value)
    }

    pub fn hash(&self) -> Hash {
        object_digest(&self.canonical_bytes())
    }
}

/// Verified object access on top of a storage backend.
///
/// All writes are idempotent: storing an object whose hash is already
/// present is a no-op returning the same key.
#[derive(Clone)]
pub struct ObjectStore {
    backend: Arc<dyn StorageBackend>,
}

impl ObjectStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        ObjectStore { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Store a blob, returning its content address.
    pub async fn put_blob(&self, blob: &Blob) -> Result<Hash> {
        let bytes = blob.canonical_bytes();
        let hash = object_digest(&bytes);
        self.backend
            .put_object(ObjectKind::Blob, hash.as_str(), &bytes)
            .await?;
        Ok(hash)
    }

    /// Load and verify a blob.
    pub async fn get_blob(&self, hash: &Hash) -> Result<Blob> {
        let bytes = self.fetch_verified(ObjectKind::Blob, hash).await?;
        let data: Value = serde_json::from_slice(&bytes)
            .map_err(|_| EngramError::Corrupt { hash: hash.0.clone() })?;
        Ok(Blob { data })
    }

    /// Store a commit, returning its content address.
    pub async fn put_commit(&self, commit: &Commit) -> Result<Hash> {
        let bytes = commit.canonical_bytes();
        let hash = object_digest(&bytes);
        self.backend
            .put_object(ObjectKind::Commit, hash.as_str(), &bytes)
            .await?;
        Ok(hash)
    }

    /// Load and verify a commit.
    pub async fn get_commit(&self, hash: &Hash) -> Result<Commit> {
        let bytes = self.fetch_verified(ObjectKind::Commit, hash).await?;
        serde_json::from_slice(&bytes).map_err(|_| EngramError::Corrupt { hash: hash.0.clone() })
    }

    /// Load a commit if present; `None` instead of `NotFound`.
    pub async fn try_get_commit(&self, hash: &Hash) -> Result<Option<Commit>> {
        match self.get_commit(hash).await {
            Ok(commit) => Ok(Some(commit)),
            Err(EngramError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, kind: ObjectKind, hash: &Hash) -> Result<bool> {
        self.backend.has_object(kind, hash.as_str()).await
    }

    async fn fetch_verified(&self, kind: ObjectKind, hash: &Hash) -> Result<Vec<u8>> {
        let bytes = self
            .backend
            .get_object(kind, hash.as_str())
            .await?
            .ok_or_else(|| EngramError::NotFound { hash: hash.0.clone() })?;

        if bytes.starts_with(ENVELOPE_MAGIC) {
            // Encrypted payload reached a plaintext reader.
            return Err(EngramError::EncryptionKeyMissing);
        }
        if object_digest(&bytes) != *hash {
            return Err(EngramError::Corrupt { hash: hash.0.clone() });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryBackend;
    use serde_json::json;

    fn store() -> ObjectStore {
        ObjectStore::new(Arc::new(InMemoryBackend::new()))
    }

    fn sample_commit(tree: &str, parents: Vec<Hash>) -> Commit {
        Commit {
            tree_hash: Hash::from(tree),
            parent_hashes: parents,
            message: "test".to_string(),
            author: "agent".to_string(),
            timestamp: Utc::now(),
            action_type: ActionType::ToolCall,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_blob_hash_deterministic() {
        let b1 = Blob::new(json!({"counter": 42}));
        let b2 = Blob::new(json!({"counter": 42}));
        assert_eq!(b1.hash(), b2.hash());
    }

    #[test]
    fn test_blob_different_data_different_hash() {
        assert_ne!(
            Blob::new(json!({"counter": 1})).hash(),
            Blob::new(json!({"counter": 2})).hash()
        );
    }

    #[test]
    fn test_commit_hash_covers_parents_in_order() {
        let ts = Utc::now();
        let mut a = sample_commit("abc", vec![Hash::from("p1"), Hash::from("p2")]);
        let mut b = sample_commit("abc", vec![Hash::from("p2"), Hash::from("p1")]);
        a.timestamp = ts;
        b.timestamp = ts;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_commit_decodes_from_canonical_bytes() {
        let commit = sample_commit("abc123", vec![]);
        let bytes = commit.canonical_bytes();
        let decoded: Commit = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.message, commit.message);
        assert_eq!(decoded.hash(), commit.hash());
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = store();
        let blob = Blob::new(json!({"memory": {"facts": [1, 2, 3]}}));
        let hash = store.put_blob(&blob).await.unwrap();
        let loaded = store.get_blob(&hash).await.unwrap();
        assert_eq!(loaded.data, blob.data);
    }

    #[tokio::test]
    async fn test_put_idempotent() {
        let store = store();
        let blob = Blob::new(json!({"x": 1}));
        let h1 = store.put_blob(&blob).await.unwrap();
        let h2 = store.put_blob(&blob).await.unwrap();
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = store();
        let missing = Hash::from("00".repeat(32));
        let err = store.get_blob(&missing).await.unwrap_err();
        assert!(matches!(err, EngramError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_tampered_bytes_surface_corrupt() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = ObjectStore::new(backend.clone());
        let blob = Blob::new(json!({"x": 1}));
        let hash = store.put_blob(&blob).await.unwrap();

        backend
            .put_object_unchecked(ObjectKind::Blob, hash.as_str(), b"{\"x\":2}")
            .await;

        let err = store.get_blob(&hash).await.unwrap_err();
        assert!(matches!(err, EngramError::Corrupt { .. }));
    }
}
