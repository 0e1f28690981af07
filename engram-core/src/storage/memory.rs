//! In-memory backend for unit tests and prototyping
//!
//! Stores everything in process-local maps behind std locks; the locks are
//! only held for short synchronous sections, never across awaits.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{ObjectStream, StorageBackend};
use crate::audit::AuditEntry;
use crate::error::{EngramError, Result};
use crate::types::ObjectKind;

/// Volatile single-tenant backend.
#[derive(Default)]
pub struct InMemoryBackend {
    objects: RwLock<HashMap<(ObjectKind, String), Vec<u8>>>,
    refs: RwLock<HashMap<String, String>>,
    log: RwLock<Vec<AuditEntry>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite stored object bytes without the idempotence guard.
    ///
    /// Test support: lets corruption tests plant bytes that no longer
    /// re-hash to their key.
    pub async fn put_object_unchecked(&self, kind: ObjectKind, hash: &str, data: &[u8]) {
        let mut objects = self.objects.write().unwrap();
        objects.insert((kind, hash.to_string()), data.to_vec());
    }

    /// Mutate a stored log entry in place. Test support for
    /// tamper-detection scenarios.
    pub fn mutate_log_entry<F>(&self, seq: u64, mutate: F)
    where
        F: FnOnce(&mut AuditEntry),
    {
        let mut log = self.log.write().unwrap();
        if let Some(entry) = log.iter_mut().find(|e| e.seq == seq) {
            mutate(entry);
        }
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn healthcheck(&self) -> Result<()> {
        Ok(())
    }

    async fn put_object(&self, kind: ObjectKind, hash: &str, data: &[u8]) -> Result<()> {
        let mut objects = self.objects.write().unwrap();
        objects
            .entry((kind, hash.to_string()))
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    async fn get_object(&self, kind: ObjectKind, hash: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.read().unwrap();
        Ok(objects.get(&(kind, hash.to_string())).cloned())
    }

    async fn has_object(&self, kind: ObjectKind, hash: &str) -> Result<bool> {
        let objects = self.objects.read().unwrap();
        Ok(objects.contains_key(&(kind, hash.to_string())))
    }

    async fn delete_object(&self, kind: ObjectKind, hash: &str) -> Result<bool> {
        let mut objects = self.objects.write().unwrap();
        Ok(objects.remove(&(kind, hash.to_string())).is_some())
    }

    async fn iter_objects(&self, kind: ObjectKind) -> Result<ObjectStream<'_>> {
        let snapshot: Vec<(String, Vec<u8>)> = {
            let objects = self.objects.read().unwrap();
            objects
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|((_, hash), data)| (hash.clone(), data.clone()))
                .collect()
        };
        Ok(stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn get_ref(&self, name: &str) -> Result<Option<String>> {
        let refs = self.refs.read().unwrap();
        Ok(refs.get(name).cloned())
    }

    async fn set_ref(&self, name: &str, target: &str) -> Result<()> {
        let mut refs = self.refs.write().unwrap();
        refs.insert(name.to_string(), target.to_string());
        Ok(())
    }

    async fn delete_ref(&self, name: &str) -> Result<bool> {
        let mut refs = self.refs.write().unwrap();
        Ok(refs.remove(name).is_some())
    }

    async fn list_refs(&self) -> Result<HashMap<String, String>> {
        let refs = self.refs.read().unwrap();
        Ok(refs.clone())
    }

    async fn cas_ref(&self, name: &str, expected: Option<&str>, target: &str) -> Result<()> {
        let mut refs = self.refs.write().unwrap();
        let actual = refs.get(name).cloned();
        if actual.as_deref() != expected {
            return Err(EngramError::Conflict {
                name: name.to_string(),
                expected: expected.map(|s| s.to_string()),
                actual,
            });
        }
        refs.insert(name.to_string(), target.to_string());
        Ok(())
    }

    async fn append_log(&self, entry: &AuditEntry) -> Result<()> {
        let mut log = self.log.write().unwrap();
        if log.iter().any(|e| e.seq == entry.seq) {
            return Err(EngramError::Conflict {
                name: format!("log:{}", entry.seq),
                expected: None,
                actual: Some(entry.seq.to_string()),
            });
        }
        log.push(entry.clone());
        log.sort_by_key(|e| e.seq);
        Ok(())
    }

    async fn read_log(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let log = self.log.read().unwrap();
        Ok(log
            .iter()
            .filter(|e| e.seq >= start_seq)
            .take(limit)
            .cloned()
            .collect())
    }
}
