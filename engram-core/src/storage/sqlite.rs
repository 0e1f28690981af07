//! Embedded single-file backend on SQLite
//!
//! Uses the bundled SQLite through `tokio_rusqlite`, which runs all
//! database work on a dedicated thread: readers scale with WAL, writers
//! are serialized behind the connection. CAS runs in an immediate
//! transaction so two processes sharing the file cannot interleave a
//! read-check-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use tokio_rusqlite::Connection;

use super::{ObjectStream, StorageBackend};
use crate::audit::AuditEntry;
use crate::error::{EngramError, Result};
use crate::types::ObjectKind;

/// Embedded file-store backend, tenant-scoped.
pub struct SqliteBackend {
    conn: Connection,
    tenant: String,
}

enum CasOutcome {
    Applied,
    Mismatch(Option<String>),
}

fn unavailable(e: impl std::fmt::Display) -> EngramError {
    EngramError::BackendUnavailable { cause: e.to_string() }
}

impl SqliteBackend {
    /// Open (or create) the store at `path` for one tenant. `":memory:"`
    /// opens a volatile database.
    pub async fn new(path: &str, tenant: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().await.map_err(unavailable)?
        } else {
            Connection::open(path).await.map_err(unavailable)?
        };

        let backend = SqliteBackend {
            conn,
            tenant: tenant.to_string(),
        };
        backend.initialize().await?;
        Ok(backend)
    }

    fn row_to_entry(
        row: (i64, String, String, String, String, Option<String>, String, String),
    ) -> Result<AuditEntry> {
        let (seq, prev_hash, ts, actor, action, commit_hash, details, self_hash) = row;
        let timestamp = DateTime::parse_from_rfc3339(&ts)
            .map_err(|e| EngramError::Serialization(e.to_string()))?
            .with_timezone(&Utc);
        Ok(AuditEntry {
            seq: seq as u64,
            prev_hash,
            timestamp,
            actor,
            action,
            commit_hash,
            details: serde_json::from_str(&details)?,
            self_hash,
        })
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn initialize(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                // WAL for concurrent readers, bounded waits on the writer.
                conn.execute_batch(
                    "
                    PRAGMA journal_mode = WAL;
                    PRAGMA synchronous = NORMAL;
                    PRAGMA cache_size = -64000;
                    PRAGMA busy_timeout = 5000;
                    ",
                )?;
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS objects (
                        tenant     TEXT NOT NULL,
                        kind       TEXT NOT NULL,
                        hash       TEXT NOT NULL,
                        data       BLOB NOT NULL,
                        created_at TEXT NOT NULL DEFAULT (datetime('now')),
                        PRIMARY KEY (tenant, kind, hash)
                    );
                    CREATE TABLE IF NOT EXISTS refs (
                        tenant     TEXT NOT NULL,
                        name       TEXT NOT NULL,
                        target     TEXT NOT NULL,
                        updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                        PRIMARY KEY (tenant, name)
                    );
                    CREATE TABLE IF NOT EXISTS logs (
                        tenant      TEXT NOT NULL,
                        seq         INTEGER NOT NULL,
                        prev_hash   TEXT NOT NULL,
                        timestamp   TEXT NOT NULL,
                        actor       TEXT NOT NULL,
                        action      TEXT NOT NULL,
                        commit_hash TEXT,
                        details     TEXT NOT NULL,
                        self_hash   TEXT NOT NULL,
                        PRIMARY KEY (tenant, seq)
                    );
                    CREATE INDEX IF NOT EXISTS idx_objects_kind ON objects(tenant, kind);
                    CREATE INDEX IF NOT EXISTS idx_logs_actor ON logs(tenant, actor);
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(unavailable)
    }

    async fn close(&self) -> Result<()> {
        // The connection thread shuts down when the backend drops.
        Ok(())
    }

    async fn healthcheck(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await
            .map_err(unavailable)
    }

    async fn put_object(&self, kind: ObjectKind, hash: &str, data: &[u8]) -> Result<()> {
        let tenant = self.tenant.clone();
        let hash = hash.to_string();
        let kind = kind.as_str();
        let data = data.to_vec();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO objects (tenant, kind, hash, data) VALUES (?1, ?2, ?3, ?4)",
                    params![tenant, kind, hash, data],
                )?;
                Ok(())
            })
            .await
            .map_err(unavailable)
    }

    async fn get_object(&self, kind: ObjectKind, hash: &str) -> Result<Option<Vec<u8>>> {
        let tenant = self.tenant.clone();
        let hash = hash.to_string();
        let kind = kind.as_str();
        self.conn
            .call(move |conn| {
                let result = conn
                    .query_row(
                        "SELECT data FROM objects WHERE tenant = ?1 AND kind = ?2 AND hash = ?3",
                        params![tenant, kind, hash],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .optional()?;
                Ok(result)
            })
            .await
            .map_err(unavailable)
    }

    async fn has_object(&self, kind: ObjectKind, hash: &str) -> Result<bool> {
        let tenant = self.tenant.clone();
        let hash = hash.to_string();
        let kind = kind.as_str();
        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM objects WHERE tenant = ?1 AND kind = ?2 AND hash = ?3",
                    params![tenant, kind, hash],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(unavailable)
    }

    async fn delete_object(&self, kind: ObjectKind, hash: &str) -> Result<bool> {
        let tenant = self.tenant.clone();
        let hash = hash.to_string();
        let kind = kind.as_str();
        self.conn
            .call(move |conn| {
                let count = conn.execute(
                    "DELETE FROM objects WHERE tenant = ?1 AND kind = ?2 AND hash = ?3",
                    params![tenant, kind, hash],
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(unavailable)
    }

    async fn iter_objects(&self, kind: ObjectKind) -> Result<ObjectStream<'_>> {
        let tenant = self.tenant.clone();
        let kind = kind.as_str();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT hash, data FROM objects WHERE tenant = ?1 AND kind = ?2")?;
                let rows = stmt
                    .query_map(params![tenant, kind], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(unavailable)?;
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn get_ref(&self, name: &str) -> Result<Option<String>> {
        let tenant = self.tenant.clone();
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                let result = conn
                    .query_row(
                        "SELECT target FROM refs WHERE tenant = ?1 AND name = ?2",
                        params![tenant, name],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(result)
            })
            .await
            .map_err(unavailable)
    }

    async fn set_ref(&self, name: &str, target: &str) -> Result<()> {
        let tenant = self.tenant.clone();
        let name = name.to_string();
        let target = target.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO refs (tenant, name, target) VALUES (?1, ?2, ?3)
                     ON CONFLICT (tenant, name)
                     DO UPDATE SET target = excluded.target, updated_at = datetime('now')",
                    params![tenant, name, target],
                )?;
                Ok(())
            })
            .await
            .map_err(unavailable)
    }

    async fn delete_ref(&self, name: &str) -> Result<bool> {
        let tenant = self.tenant.clone();
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                let count = conn.execute(
                    "DELETE FROM refs WHERE tenant = ?1 AND name = ?2",
                    params![tenant, name],
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(unavailable)
    }

    async fn list_refs(&self) -> Result<HashMap<String, String>> {
        let tenant = self.tenant.clone();
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT name, target FROM refs WHERE tenant = ?1")?;
                let rows = stmt
                    .query_map(params![tenant], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows.into_iter().collect::<HashMap<_, _>>())
            })
            .await
            .map_err(unavailable)
    }

    async fn cas_ref(&self, name: &str, expected: Option<&str>, target: &str) -> Result<()> {
        let tenant = self.tenant.clone();
        let name_owned = name.to_string();
        let expected_owned = expected.map(|s| s.to_string());
        let target = target.to_string();

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let actual: Option<String> = tx
                    .query_row(
                        "SELECT target FROM refs WHERE tenant = ?1 AND name = ?2",
                        params![tenant, name_owned],
                        |row| row.get(0),
                    )
                    .optional()?;
                if actual != expected_owned {
                    return Ok(CasOutcome::Mismatch(actual));
                }
                tx.execute(
                    "INSERT INTO refs (tenant, name, target) VALUES (?1, ?2, ?3)
                     ON CONFLICT (tenant, name)
                     DO UPDATE SET target = excluded.target, updated_at = datetime('now')",
                    params![tenant, name_owned, target],
                )?;
                tx.commit()?;
                Ok(CasOutcome::Applied)
            })
            .await
            .map_err(unavailable)?;

        match outcome {
            CasOutcome::Applied => Ok(()),
            CasOutcome::Mismatch(actual) => Err(EngramError::Conflict {
                name: name.to_string(),
                expected: expected.map(|s| s.to_string()),
                actual,
            }),
        }
    }

    async fn append_log(&self, entry: &AuditEntry) -> Result<()> {
        let tenant = self.tenant.clone();
        let entry = entry.clone();
        let details = serde_json::to_string(&entry.details)?;
        let seq = entry.seq;

        let inserted = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    "INSERT OR IGNORE INTO logs
                     (tenant, seq, prev_hash, timestamp, actor, action, commit_hash, details, self_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        tenant,
                        entry.seq as i64,
                        entry.prev_hash,
                        entry.timestamp.to_rfc3339(),
                        entry.actor,
                        entry.action,
                        entry.commit_hash,
                        details,
                        entry.self_hash,
                    ],
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(unavailable)?;

        if inserted {
            Ok(())
        } else {
            Err(EngramError::Conflict {
                name: format!("log:{seq}"),
                expected: None,
                actual: Some(seq.to_string()),
            })
        }
    }

    async fn read_log(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let tenant = self.tenant.clone();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT seq, prev_hash, timestamp, actor, action, commit_hash, details, self_hash
                     FROM logs WHERE tenant = ?1 AND seq >= ?2
                     ORDER BY seq ASC LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(params![tenant, start_seq as i64, limit as i64], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(unavailable)?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }
}
