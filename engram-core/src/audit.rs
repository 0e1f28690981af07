//! Tamper-evident audit log
//!
//! Every state-mutating operation appends one entry. Entries are chained:
//! `self_hash = sha256(prev_hash || canonical(rest))` where `rest` is the
//! entry minus both hash fields, and entry 0 links to a fixed all-zero
//! sentinel. Appends within a tenant are totally ordered by `seq`;
//! the backend's uniqueness constraint on the sequence number turns
//! cross-instance races into `Conflict`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::canonical::canonical_json;
use crate::error::{EngramError, Result};
use crate::storage::StorageBackend;

/// `prev_hash` of the first entry in a chain.
pub const CHAIN_SENTINEL: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

const SCAN_PAGE: usize = 256;

/// One hash-chained audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub prev_hash: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    pub details: Value,
    pub self_hash: String,
}

impl AuditEntry {
    /// Recompute the chained hash from this entry's own fields.
    pub fn compute_self_hash(&self) -> String {
        chain_hash(
            &self.prev_hash,
            &chain_payload(
                self.seq,
                &self.timestamp,
                &self.actor,
                &self.action,
                self.commit_hash.as_deref(),
                &self.details,
            ),
        )
    }
}

fn chain_payload(
    seq: u64,
    timestamp: &DateTime<Utc>,
    actor: &str,
    action: &str,
    commit_hash: Option<&str>,
    details: &Value,
) -> Vec<u8> {
    let value = serde_json::json!({
        "action": action,
        "actor": actor,
        "commit_hash": commit_hash,
        "details": details,
        "seq": seq,
        "timestamp": timestamp.to_rfc3339(),
    });
    canonical_json(&value)
}

fn chain_hash(prev_hash: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// In-memory filter for audit queries; applied over `read_log` output.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Chained append/verify service over a storage backend.
pub struct AuditLog {
    backend: Arc<dyn StorageBackend>,
    // Serializes appends from this repository instance and caches the tip.
    tip: Mutex<Option<ChainTip>>,
}

#[derive(Debug, Clone)]
struct ChainTip {
    seq: u64,
    self_hash: String,
}

impl AuditLog {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        AuditLog {
            backend,
            tip: Mutex::new(None),
        }
    }

    /// Append one entry, assigning the next sequence number and chaining
    /// it to the predecessor. On `Conflict` the cached tip is dropped so a
    /// caller retry re-resolves the chain head.
    pub async fn append(
        &self,
        actor: &str,
        action: &str,
        commit_hash: Option<&str>,
        details: Value,
    ) -> Result<AuditEntry> {
        let mut tip = self.tip.lock().await;
        if tip.is_none() {
            *tip = self.scan_tip().await?;
        }

        let (seq, prev_hash) = match tip.as_ref() {
            Some(t) => (t.seq + 1, t.self_hash.clone()),
            None => (0, CHAIN_SENTINEL.to_string()),
        };

        let timestamp = Utc::now();
        let self_hash = chain_hash(
            &prev_hash,
            &chain_payload(seq, &timestamp, actor, action, commit_hash, &details),
        );
        let entry = AuditEntry {
            seq,
            prev_hash,
            timestamp,
            actor: actor.to_string(),
            action: action.to_string(),
            commit_hash: commit_hash.map(|s| s.to_string()),
            details,
            self_hash: self_hash.clone(),
        };

        match self.backend.append_log(&entry).await {
            Ok(()) => {
                *tip = Some(ChainTip { seq, self_hash });
                Ok(entry)
            }
            Err(e) => {
                *tip = None;
                Err(e)
            }
        }
    }

    /// Ordered entries starting at `start_seq`, at most `limit`.
    pub async fn read(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        self.backend.read_log(start_seq, limit).await
    }

    /// Filtered query over the stored chain.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let mut out = Vec::new();
        let mut next = 0u64;
        loop {
            let page = self.backend.read_log(next, SCAN_PAGE).await?;
            if page.is_empty() {
                break;
            }
            next = page[page.len() - 1].seq + 1;
            for entry in page {
                if let Some(actor) = &filter.actor {
                    if &entry.actor != actor {
                        continue;
                    }
                }
                if let Some(action) = &filter.action {
                    if &entry.action != action {
                        continue;
                    }
                }
                if let Some(since) = &filter.since {
                    if entry.timestamp < *since {
                        continue;
                    }
                }
                out.push(entry);
            }
        }
        // Newest first, like commit logs.
        out.sort_by(|a, b| b.seq.cmp(&a.seq));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Recompute every hash in `[from_seq, to_seq]` and check the links.
    ///
    /// Fails with `ChainBroken` at the first entry whose recomputed hash or
    /// predecessor link does not match. A `from_seq > 0` anchors trust at
    /// the stored hash of entry `from_seq - 1`.
    pub async fn verify_chain(&self, from_seq: Option<u64>, to_seq: Option<u64>) -> Result<()> {
        let start = from_seq.unwrap_or(0);

        let mut expected_prev = if start == 0 {
            CHAIN_SENTINEL.to_string()
        } else {
            let anchor = self.backend.read_log(start - 1, 1).await?;
            match anchor.first() {
                Some(e) if e.seq == start - 1 => e.self_hash.clone(),
                _ => return Err(EngramError::ChainBroken { seq: start }),
            }
        };

        let mut expected_seq = start;
        loop {
            let page = self.backend.read_log(expected_seq, SCAN_PAGE).await?;
            if page.is_empty() {
                return Ok(());
            }
            for entry in page {
                if let Some(to) = to_seq {
                    if entry.seq > to {
                        return Ok(());
                    }
                }
                if entry.seq != expected_seq {
                    return Err(EngramError::ChainBroken { seq: expected_seq });
                }
                if entry.prev_hash != expected_prev
                    || entry.compute_self_hash() != entry.self_hash
                {
                    return Err(EngramError::ChainBroken { seq: entry.seq });
                }
                expected_prev = entry.self_hash.clone();
                expected_seq += 1;
            }
        }
    }

    async fn scan_tip(&self) -> Result<Option<ChainTip>> {
        let mut tip: Option<ChainTip> = None;
        let mut next = 0u64;
        loop {
            let page = self.backend.read_log(next, SCAN_PAGE).await?;
            match page.last() {
                None => return Ok(tip),
                Some(last) => {
                    tip = Some(ChainTip {
                        seq: last.seq,
                        self_hash: last.self_hash.clone(),
                    });
                    next = last.seq + 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryBackend;
    use serde_json::json;

    fn log() -> (Arc<InMemoryBackend>, AuditLog) {
        let backend = Arc::new(InMemoryBackend::new());
        let log = AuditLog::new(backend.clone());
        (backend, log)
    }

    #[tokio::test]
    async fn test_first_entry_links_sentinel() {
        let (_b, log) = log();
        let entry = log
            .append("agent-1", "commit", Some("abc"), json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(entry.seq, 0);
        assert_eq!(entry.prev_hash, CHAIN_SENTINEL);
        assert_eq!(entry.compute_self_hash(), entry.self_hash);
    }

    #[tokio::test]
    async fn test_entries_chain() {
        let (_b, log) = log();
        let e0 = log.append("a", "commit", None, json!({})).await.unwrap();
        let e1 = log.append("a", "commit", None, json!({})).await.unwrap();
        let e2 = log.append("a", "merge", None, json!({})).await.unwrap();
        assert_eq!(e1.prev_hash, e0.self_hash);
        assert_eq!(e2.prev_hash, e1.self_hash);
        assert_eq!(e2.seq, 2);
    }

    #[tokio::test]
    async fn test_verify_chain_ok() {
        let (_b, log) = log();
        for i in 0..10 {
            log.append("a", "commit", None, json!({"i": i})).await.unwrap();
        }
        log.verify_chain(None, None).await.unwrap();
        log.verify_chain(Some(4), Some(8)).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_empty_chain_ok() {
        let (_b, log) = log();
        log.verify_chain(None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_tampered_details_break_chain() {
        let (backend, log) = log();
        for i in 0..5 {
            log.append("a", "commit", None, json!({"i": i})).await.unwrap();
        }
        backend.mutate_log_entry(2, |e| e.details = json!({"i": 999}));

        let err = log.verify_chain(None, None).await.unwrap_err();
        assert!(matches!(err, EngramError::ChainBroken { seq: 2 }));
    }

    #[tokio::test]
    async fn test_tampered_link_detected_downstream() {
        let (backend, log) = log();
        for _ in 0..4 {
            log.append("a", "commit", None, json!({})).await.unwrap();
        }
        // Re-forge entry 1 so its own hash is consistent; entry 2's link
        // must then fail.
        backend.mutate_log_entry(1, |e| {
            e.details = json!({"forged": true});
            e.self_hash = e.compute_self_hash();
        });

        let err = log.verify_chain(None, None).await.unwrap_err();
        assert!(matches!(err, EngramError::ChainBroken { seq: 2 }));
    }

    #[tokio::test]
    async fn test_resumes_existing_chain() {
        let (backend, log) = log();
        log.append("a", "commit", None, json!({})).await.unwrap();
        log.append("a", "commit", None, json!({})).await.unwrap();

        // A second instance over the same backend continues the sequence.
        let log2 = AuditLog::new(backend);
        let entry = log2.append("a", "revert", None, json!({})).await.unwrap();
        assert_eq!(entry.seq, 2);
        log2.verify_chain(None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_filters() {
        let (_b, log) = log();
        log.append("alice", "commit", None, json!({})).await.unwrap();
        log.append("bob", "commit", None, json!({})).await.unwrap();
        log.append("alice", "merge", None, json!({})).await.unwrap();

        let by_actor = log
            .query(&AuditFilter {
                actor: Some("alice".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_actor.len(), 2);

        let by_action = log
            .query(&AuditFilter {
                action: Some("merge".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_action.len(), 1);
        assert_eq!(by_action[0].actor, "alice");
    }
}
