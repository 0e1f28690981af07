//! One-way transfer of a tenant's data between storage backends
//!
//! Copies every object, ref and audit entry from a source backend to a
//! destination backend. Idempotent and resumable: objects already present
//! in the destination are skipped, and the log transfer continues from the
//! destination's highest sequence number.

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::StorageBackend;
use crate::types::ObjectKind;

const LOG_PAGE: usize = 256;

/// Running counters, reported after every copied item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub objects_copied: usize,
    pub objects_total: usize,
    pub refs_copied: usize,
    pub logs_copied: usize,
}

/// Transfer everything from `source` to `destination`.
pub async fn migrate<F>(
    source: &dyn StorageBackend,
    destination: &dyn StorageBackend,
    mut on_progress: Option<F>,
) -> Result<MigrationProgress>
where
    F: FnMut(&MigrationProgress),
{
    destination.initialize().await?;

    let mut progress = MigrationProgress::default();

    // Size the work up front so the callback can report a total.
    for kind in [ObjectKind::Blob, ObjectKind::Commit] {
        let mut stream = source.iter_objects(kind).await?;
        while let Some(item) = stream.next().await {
            item?;
            progress.objects_total += 1;
        }
    }

    for kind in [ObjectKind::Blob, ObjectKind::Commit] {
        let mut stream = source.iter_objects(kind).await?;
        while let Some(item) = stream.next().await {
            let (hash, bytes) = item?;
            if !destination.has_object(kind, &hash).await? {
                destination.put_object(kind, &hash, &bytes).await?;
            }
            progress.objects_copied += 1;
            if let Some(cb) = on_progress.as_mut() {
                cb(&progress);
            }
        }
    }

    for (name, target) in source.list_refs().await? {
        destination.set_ref(&name, &target).await?;
        progress.refs_copied += 1;
        if let Some(cb) = on_progress.as_mut() {
            cb(&progress);
        }
    }

    // Resume the log from wherever the destination chain ends.
    let mut next_seq = destination_tail(destination).await?;
    loop {
        let page = source.read_log(next_seq, LOG_PAGE).await?;
        if page.is_empty() {
            break;
        }
        next_seq = page[page.len() - 1].seq + 1;
        for entry in page {
            destination.append_log(&entry).await?;
            progress.logs_copied += 1;
            if let Some(cb) = on_progress.as_mut() {
                cb(&progress);
            }
        }
    }

    Ok(progress)
}

/// First sequence number missing from the destination's log.
async fn destination_tail(destination: &dyn StorageBackend) -> Result<u64> {
    let mut next = 0u64;
    loop {
        let page = destination.read_log(next, LOG_PAGE).await?;
        match page.last() {
            Some(last) => next = last.seq + 1,
            None => return Ok(next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::storage::memory::InMemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    async fn seeded_source() -> Arc<InMemoryBackend> {
        let source = Arc::new(InMemoryBackend::new());
        source.put_object(ObjectKind::Blob, "b1", b"blob-1").await.unwrap();
        source.put_object(ObjectKind::Blob, "b2", b"blob-2").await.unwrap();
        source.put_object(ObjectKind::Commit, "c1", b"commit-1").await.unwrap();
        source.set_ref("main", "c1").await.unwrap();
        source.set_ref("HEAD", "ref:main").await.unwrap();

        let log = AuditLog::new(source.clone());
        log.append("agent", "commit", Some("c1"), json!({"n": 1})).await.unwrap();
        log.append("agent", "commit", None, json!({"n": 2})).await.unwrap();
        source
    }

    #[tokio::test]
    async fn test_full_transfer() {
        let source = seeded_source().await;
        let destination = InMemoryBackend::new();

        let progress = migrate(source.as_ref(), &destination, None::<fn(&MigrationProgress)>)
            .await
            .unwrap();

        assert_eq!(progress.objects_total, 3);
        assert_eq!(progress.objects_copied, 3);
        assert_eq!(progress.refs_copied, 2);
        assert_eq!(progress.logs_copied, 2);

        assert_eq!(
            destination.get_object(ObjectKind::Blob, "b1").await.unwrap(),
            Some(b"blob-1".to_vec())
        );
        assert_eq!(destination.get_ref("main").await.unwrap(), Some("c1".to_string()));
        assert_eq!(destination.read_log(0, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rerun_skips_existing() {
        let source = seeded_source().await;
        let destination = InMemoryBackend::new();

        migrate(source.as_ref(), &destination, None::<fn(&MigrationProgress)>)
            .await
            .unwrap();
        let progress = migrate(source.as_ref(), &destination, None::<fn(&MigrationProgress)>)
            .await
            .unwrap();

        // Second pass finds everything in place and appends no logs.
        assert_eq!(progress.logs_copied, 0);
        assert_eq!(destination.read_log(0, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resumes_partial_log() {
        let source = seeded_source().await;
        let destination = InMemoryBackend::new();

        // Simulate a partial previous run: one log entry already copied.
        let first = source.read_log(0, 1).await.unwrap().remove(0);
        destination.append_log(&first).await.unwrap();

        let progress = migrate(source.as_ref(), &destination, None::<fn(&MigrationProgress)>)
            .await
            .unwrap();
        assert_eq!(progress.logs_copied, 1);
        assert_eq!(destination.read_log(0, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_progress_callback_sees_totals() {
        let source = seeded_source().await;
        let destination = InMemoryBackend::new();

        let mut snapshots = Vec::new();
        migrate(
            source.as_ref(),
            &destination,
            Some(|p: &MigrationProgress| snapshots.push(p.clone())),
        )
        .await
        .unwrap();

        assert!(!snapshots.is_empty());
        assert!(snapshots.iter().all(|p| p.objects_total == 3));
        let last = snapshots.last().unwrap();
        assert_eq!(last.objects_copied, 3);
        assert_eq!(last.logs_copied, 2);
    }
}
