//! At-rest encryption as a storage wrapper
//!
//! `EncryptedBackend` implements the full backend capability set and
//! delegates to an inner backend, transparently sealing blob payloads and
//! audit-entry details in an AEAD envelope. Content addresses are always
//! computed over plaintext, so encryption never changes an object's hash;
//! the envelope is storage-layer metadata only.
//!
//! Keys are derived per tenant from a passphrase with Argon2id and a
//! random salt. The salt travels inside each envelope, and derived keys
//! are cached per salt (objects written under older salts stay readable)
//! and zeroized on close. Nonces are random per object; a failed
//! authentication tag surfaces as `Corrupt`.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

use super::{ObjectStream, StorageBackend};
use crate::audit::AuditEntry;
use crate::error::{EngramError, Result};
use crate::objects::ENVELOPE_MAGIC;
use crate::types::ObjectKind;

const ALGORITHM: &str = "aes-256-gcm";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Marker prefix for encrypted audit details.
const DETAILS_MAGIC: &str = "ENG1:";

/// Authenticated-encryption envelope stored in place of plaintext bytes.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    algorithm: String,
    salt: String,
    nonce: String,
    ciphertext: String,
    tag: String,
}

/// Encrypting wrapper around any storage backend.
pub struct EncryptedBackend {
    inner: Arc<dyn StorageBackend>,
    passphrase: Zeroizing<String>,
    write_salt: [u8; SALT_LEN],
    keys: Mutex<HashMap<String, Zeroizing<[u8; 32]>>>,
}

impl EncryptedBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, passphrase: &str) -> Self {
        let mut write_salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut write_salt);
        EncryptedBackend {
            inner,
            passphrase: Zeroizing::new(passphrase.to_string()),
            write_salt,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped backend, for layering-aware callers such as migration.
    pub fn inner(&self) -> &Arc<dyn StorageBackend> {
        &self.inner
    }

    fn derive_key(&self, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        let cache_key = hex::encode(salt);
        {
            let keys = self.keys.lock().unwrap();
            if let Some(key) = keys.get(&cache_key) {
                return Ok(key.clone());
            }
        }
        let mut key = Zeroizing::new([0u8; 32]);
        argon2::Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, key.as_mut())
            .map_err(|e| EngramError::BackendUnavailable {
                cause: format!("key derivation failed: {e}"),
            })?;
        self.keys.lock().unwrap().insert(cache_key, key.clone());
        Ok(key)
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.derive_key(&self.write_salt)?;
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_ref()));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| EngramError::BackendUnavailable {
                cause: format!("encryption failed: {e}"),
            })?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        let envelope = Envelope {
            algorithm: ALGORITHM.to_string(),
            salt: hex::encode(self.write_salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(&sealed),
            tag: hex::encode(&tag),
        };

        let mut out = Vec::from(ENVELOPE_MAGIC);
        out.extend_from_slice(&serde_json::to_vec(&envelope)?);
        Ok(out)
    }

    fn open(&self, sealed: &[u8], object_id: &str) -> Result<Vec<u8>> {
        let corrupt = || EngramError::Corrupt {
            hash: object_id.to_string(),
        };

        let body = sealed.strip_prefix(ENVELOPE_MAGIC).ok_or_else(corrupt)?;
        let envelope: Envelope = serde_json::from_slice(body).map_err(|_| corrupt())?;
        if envelope.algorithm != ALGORITHM {
            return Err(corrupt());
        }

        let salt = hex::decode(&envelope.salt).map_err(|_| corrupt())?;
        let nonce_bytes = hex::decode(&envelope.nonce).map_err(|_| corrupt())?;
        let mut ciphertext = hex::decode(&envelope.ciphertext).map_err(|_| corrupt())?;
        let tag = hex::decode(&envelope.tag).map_err(|_| corrupt())?;
        if nonce_bytes.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(corrupt());
        }
        ciphertext.extend_from_slice(&tag);

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_ref()));
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| corrupt())
    }

    fn seal_details(&self, details: &serde_json::Value) -> Result<serde_json::Value> {
        let sealed = self.seal(&serde_json::to_vec(details)?)?;
        Ok(serde_json::Value::String(format!(
            "{DETAILS_MAGIC}{}",
            hex::encode(&sealed)
        )))
    }

    fn open_details(&self, details: &serde_json::Value, seq: u64) -> Result<serde_json::Value> {
        match details {
            serde_json::Value::String(s) if s.starts_with(DETAILS_MAGIC) => {
                let object_id = format!("log:{seq}");
                let sealed = hex::decode(&s[DETAILS_MAGIC.len()..])
                    .map_err(|_| EngramError::Corrupt { hash: object_id.clone() })?;
                let plain = self.open(&sealed, &object_id)?;
                serde_json::from_slice(&plain)
                    .map_err(|_| EngramError::Corrupt { hash: object_id })
            }
            other => Ok(other.clone()),
        }
    }
}

#[async_trait]
impl StorageBackend for EncryptedBackend {
    async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    async fn close(&self) -> Result<()> {
        // Zeroizing wipes key bytes as the cache entries drop.
        self.keys.lock().unwrap().clear();
        self.inner.close().await
    }

    async fn healthcheck(&self) -> Result<()> {
        self.inner.healthcheck().await
    }

    async fn put_object(&self, kind: ObjectKind, hash: &str, data: &[u8]) -> Result<()> {
        match kind {
            ObjectKind::Blob => {
                // Keep the put idempotent across differing nonces.
                if self.inner.has_object(kind, hash).await? {
                    return Ok(());
                }
                let sealed = self.seal(data)?;
                self.inner.put_object(kind, hash, &sealed).await
            }
            ObjectKind::Commit => self.inner.put_object(kind, hash, data).await,
        }
    }

    async fn get_object(&self, kind: ObjectKind, hash: &str) -> Result<Option<Vec<u8>>> {
        let bytes = self.inner.get_object(kind, hash).await?;
        match bytes {
            Some(b) if kind == ObjectKind::Blob && b.starts_with(ENVELOPE_MAGIC) => {
                Ok(Some(self.open(&b, hash)?))
            }
            other => Ok(other),
        }
    }

    async fn has_object(&self, kind: ObjectKind, hash: &str) -> Result<bool> {
        self.inner.has_object(kind, hash).await
    }

    async fn delete_object(&self, kind: ObjectKind, hash: &str) -> Result<bool> {
        self.inner.delete_object(kind, hash).await
    }

    async fn iter_objects(&self, kind: ObjectKind) -> Result<ObjectStream<'_>> {
        let inner = self.inner.iter_objects(kind).await?;
        let stream = inner.map(move |item| {
            let (hash, bytes) = item?;
            if kind == ObjectKind::Blob && bytes.starts_with(ENVELOPE_MAGIC) {
                let plain = self.open(&bytes, &hash)?;
                Ok((hash, plain))
            } else {
                Ok((hash, bytes))
            }
        });
        Ok(stream.boxed())
    }

    async fn get_ref(&self, name: &str) -> Result<Option<String>> {
        self.inner.get_ref(name).await
    }

    async fn set_ref(&self, name: &str, target: &str) -> Result<()> {
        self.inner.set_ref(name, target).await
    }

    async fn delete_ref(&self, name: &str) -> Result<bool> {
        self.inner.delete_ref(name).await
    }

    async fn list_refs(&self) -> Result<HashMap<String, String>> {
        self.inner.list_refs().await
    }

    async fn cas_ref(&self, name: &str, expected: Option<&str>, target: &str) -> Result<()> {
        self.inner.cas_ref(name, expected, target).await
    }

    async fn append_log(&self, entry: &AuditEntry) -> Result<()> {
        let mut sealed = entry.clone();
        sealed.details = self.seal_details(&entry.details)?;
        self.inner.append_log(&sealed).await
    }

    async fn read_log(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut entries = self.inner.read_log(start_seq, limit).await?;
        for entry in &mut entries {
            entry.details = self.open_details(&entry.details, entry.seq)?;
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryBackend;
    use chrono::Utc;
    use serde_json::json;

    fn encrypted() -> (Arc<InMemoryBackend>, EncryptedBackend) {
        let inner = Arc::new(InMemoryBackend::new());
        let backend = EncryptedBackend::new(inner.clone(), "correct horse battery");
        (inner, backend)
    }

    #[tokio::test]
    async fn test_blob_roundtrip() {
        let (_inner, backend) = encrypted();
        backend
            .put_object(ObjectKind::Blob, "h1", b"{\"memory\":1}")
            .await
            .unwrap();
        let plain = backend.get_object(ObjectKind::Blob, "h1").await.unwrap();
        assert_eq!(plain, Some(b"{\"memory\":1}".to_vec()));
    }

    #[tokio::test]
    async fn test_blob_sealed_at_rest() {
        let (inner, backend) = encrypted();
        backend
            .put_object(ObjectKind::Blob, "h1", b"secret plaintext")
            .await
            .unwrap();
        let raw = inner.get_object(ObjectKind::Blob, "h1").await.unwrap().unwrap();
        assert!(raw.starts_with(ENVELOPE_MAGIC));
        assert!(!raw.windows(6).any(|w| w == b"secret"));

        let envelope: Envelope = serde_json::from_slice(&raw[ENVELOPE_MAGIC.len()..]).unwrap();
        assert_eq!(envelope.algorithm, ALGORITHM);
        assert_eq!(hex::decode(envelope.nonce).unwrap().len(), NONCE_LEN);
        assert_eq!(hex::decode(envelope.tag).unwrap().len(), TAG_LEN);
    }

    #[tokio::test]
    async fn test_commits_pass_through() {
        let (inner, backend) = encrypted();
        backend
            .put_object(ObjectKind::Commit, "c1", b"{\"message\":\"m\"}")
            .await
            .unwrap();
        let raw = inner.get_object(ObjectKind::Commit, "c1").await.unwrap().unwrap();
        assert_eq!(raw, b"{\"message\":\"m\"}".to_vec());
    }

    #[tokio::test]
    async fn test_wrong_passphrase_is_corrupt() {
        let inner = Arc::new(InMemoryBackend::new());
        let writer = EncryptedBackend::new(inner.clone(), "right passphrase");
        writer
            .put_object(ObjectKind::Blob, "h1", b"payload")
            .await
            .unwrap();

        let reader = EncryptedBackend::new(inner, "wrong passphrase");
        let err = reader.get_object(ObjectKind::Blob, "h1").await.unwrap_err();
        assert!(matches!(err, EngramError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_new_instance_reads_old_salt() {
        let inner = Arc::new(InMemoryBackend::new());
        let first = EncryptedBackend::new(inner.clone(), "pass");
        first.put_object(ObjectKind::Blob, "h1", b"old-salt-object").await.unwrap();

        // Fresh instance generates a fresh write salt but still opens the
        // old envelope via the salt it carries.
        let second = EncryptedBackend::new(inner, "pass");
        let plain = second.get_object(ObjectKind::Blob, "h1").await.unwrap();
        assert_eq!(plain, Some(b"old-salt-object".to_vec()));
    }

    #[tokio::test]
    async fn test_log_details_sealed_and_restored() {
        let (inner, backend) = encrypted();
        let entry = AuditEntry {
            seq: 0,
            prev_hash: "0".repeat(64),
            timestamp: Utc::now(),
            actor: "agent".to_string(),
            action: "commit".to_string(),
            commit_hash: None,
            details: json!({"tool": "search", "query": "confidential"}),
            self_hash: "h".to_string(),
        };
        backend.append_log(&entry).await.unwrap();

        let raw = inner.read_log(0, 10).await.unwrap();
        match &raw[0].details {
            serde_json::Value::String(s) => assert!(s.starts_with(DETAILS_MAGIC)),
            other => panic!("details not sealed: {other:?}"),
        }

        let restored = backend.read_log(0, 10).await.unwrap();
        assert_eq!(restored[0].details, entry.details);
    }

    #[tokio::test]
    async fn test_iter_objects_yields_plaintext() {
        use futures::StreamExt;
        let (_inner, backend) = encrypted();
        backend.put_object(ObjectKind::Blob, "h1", b"visible").await.unwrap();

        let mut stream = backend.iter_objects(ObjectKind::Blob).await.unwrap();
        let (hash, bytes) = stream.next().await.unwrap().unwrap();
        assert_eq!(hash, "h1");
        assert_eq!(bytes, b"visible".to_vec());
    }
}
