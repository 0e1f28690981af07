//! Pooled relational backend on PostgreSQL
//!
//! One connection pool (bounded, default 16) shared across all operations;
//! every call acquires a connection for its own duration. The tenant is a
//! discriminating column on each table, and `cas_ref` is a conditional
//! UPDATE in a short transaction. Enable with the `postgres` feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, PoolConfig, Runtime};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use tokio_postgres::NoTls;

use super::{ObjectStream, StorageBackend};
use crate::audit::AuditEntry;
use crate::error::{EngramError, Result};
use crate::types::ObjectKind;

/// Default bound on the connection pool.
pub const DEFAULT_POOL_MAX: usize = 16;

/// SQLSTATE for unique-constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

pub struct PostgresBackend {
    pool: Pool,
    tenant: String,
}

fn unavailable(e: impl std::fmt::Display) -> EngramError {
    EngramError::BackendUnavailable { cause: e.to_string() }
}

impl PostgresBackend {
    /// Connect with a connection string such as
    /// `"host=localhost user=postgres dbname=engram"`.
    pub async fn new(connection_str: &str, tenant: &str, pool_max: usize) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.url = Some(connection_str.to_string());
        cfg.pool = Some(PoolConfig {
            max_size: pool_max.max(1),
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(unavailable)?;

        let backend = PostgresBackend {
            pool,
            tenant: tenant.to_string(),
        };
        backend.initialize().await?;
        Ok(backend)
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool.get().await.map_err(unavailable)
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    async fn initialize(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(
                "
                CREATE TABLE IF NOT EXISTS objects (
                    tenant      TEXT        NOT NULL,
                    kind        TEXT        NOT NULL,
                    hash        TEXT        NOT NULL,
                    data        BYTEA       NOT NULL,
                    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (tenant, kind, hash)
                );

                CREATE TABLE IF NOT EXISTS refs (
                    tenant      TEXT        NOT NULL,
                    name        TEXT        NOT NULL,
                    target      TEXT        NOT NULL,
                    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (tenant, name)
                );

                CREATE TABLE IF NOT EXISTS logs (
                    tenant      TEXT        NOT NULL,
                    seq         BIGINT      NOT NULL,
                    prev_hash   TEXT        NOT NULL,
                    timestamp   TEXT        NOT NULL,
                    actor       TEXT        NOT NULL,
                    action      TEXT        NOT NULL,
                    commit_hash TEXT,
                    details     JSONB       NOT NULL,
                    self_hash   TEXT        NOT NULL,
                    PRIMARY KEY (tenant, seq)
                );

                CREATE INDEX IF NOT EXISTS idx_objects_tenant_kind ON objects(tenant, kind);
                CREATE INDEX IF NOT EXISTS idx_logs_tenant_actor ON logs(tenant, actor);
                ",
            )
            .await
            .map_err(unavailable)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }

    async fn healthcheck(&self) -> Result<()> {
        let client = self.client().await?;
        client.query_one("SELECT 1", &[]).await.map_err(unavailable)?;
        Ok(())
    }

    async fn put_object(&self, kind: ObjectKind, hash: &str, data: &[u8]) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO objects (tenant, kind, hash, data)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (tenant, kind, hash) DO NOTHING",
                &[&self.tenant, &kind.as_str(), &hash, &data],
            )
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get_object(&self, kind: ObjectKind, hash: &str) -> Result<Option<Vec<u8>>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT data FROM objects WHERE tenant = $1 AND kind = $2 AND hash = $3",
                &[&self.tenant, &kind.as_str(), &hash],
            )
            .await
            .map_err(unavailable)?;
        Ok(rows.first().map(|row| row.get::<_, Vec<u8>>(0)))
    }

    async fn has_object(&self, kind: ObjectKind, hash: &str) -> Result<bool> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT 1 FROM objects WHERE tenant = $1 AND kind = $2 AND hash = $3 LIMIT 1",
                &[&self.tenant, &kind.as_str(), &hash],
            )
            .await
            .map_err(unavailable)?;
        Ok(!rows.is_empty())
    }

    async fn delete_object(&self, kind: ObjectKind, hash: &str) -> Result<bool> {
        let client = self.client().await?;
        let count = client
            .execute(
                "DELETE FROM objects WHERE tenant = $1 AND kind = $2 AND hash = $3",
                &[&self.tenant, &kind.as_str(), &hash],
            )
            .await
            .map_err(unavailable)?;
        Ok(count > 0)
    }

    async fn iter_objects(&self, kind: ObjectKind) -> Result<ObjectStream<'_>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT hash, data FROM objects WHERE tenant = $1 AND kind = $2",
                &[&self.tenant, &kind.as_str()],
            )
            .await
            .map_err(unavailable)?;
        let items: Vec<(String, Vec<u8>)> = rows
            .into_iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, Vec<u8>>(1)))
            .collect();
        Ok(stream::iter(items.into_iter().map(Ok)).boxed())
    }

    async fn get_ref(&self, name: &str) -> Result<Option<String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT target FROM refs WHERE tenant = $1 AND name = $2",
                &[&self.tenant, &name],
            )
            .await
            .map_err(unavailable)?;
        Ok(rows.first().map(|row| row.get::<_, String>(0)))
    }

    async fn set_ref(&self, name: &str, target: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO refs (tenant, name, target)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (tenant, name)
                 DO UPDATE SET target = EXCLUDED.target, updated_at = NOW()",
                &[&self.tenant, &name, &target],
            )
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete_ref(&self, name: &str) -> Result<bool> {
        let client = self.client().await?;
        let count = client
            .execute(
                "DELETE FROM refs WHERE tenant = $1 AND name = $2",
                &[&self.tenant, &name],
            )
            .await
            .map_err(unavailable)?;
        Ok(count > 0)
    }

    async fn list_refs(&self) -> Result<HashMap<String, String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT name, target FROM refs WHERE tenant = $1",
                &[&self.tenant],
            )
            .await
            .map_err(unavailable)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    async fn cas_ref(&self, name: &str, expected: Option<&str>, target: &str) -> Result<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(unavailable)?;

        let applied = match expected {
            Some(expected) => tx
                .execute(
                    "UPDATE refs SET target = $3, updated_at = NOW()
                     WHERE tenant = $1 AND name = $2 AND target = $4",
                    &[&self.tenant, &name, &target, &expected],
                )
                .await
                .map_err(unavailable)?,
            None => tx
                .execute(
                    "INSERT INTO refs (tenant, name, target)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (tenant, name) DO NOTHING",
                    &[&self.tenant, &name, &target],
                )
                .await
                .map_err(unavailable)?,
        };

        if applied == 1 {
            tx.commit().await.map_err(unavailable)?;
            return Ok(());
        }

        let rows = tx
            .query(
                "SELECT target FROM refs WHERE tenant = $1 AND name = $2",
                &[&self.tenant, &name],
            )
            .await
            .map_err(unavailable)?;
        let actual = rows.first().map(|row| row.get::<_, String>(0));
        tx.rollback().await.map_err(unavailable)?;

        Err(EngramError::Conflict {
            name: name.to_string(),
            expected: expected.map(|s| s.to_string()),
            actual,
        })
    }

    async fn append_log(&self, entry: &AuditEntry) -> Result<()> {
        let client = self.client().await?;
        let details = serde_json::to_value(&entry.details)?;
        let result = client
            .execute(
                "INSERT INTO logs
                 (tenant, seq, prev_hash, timestamp, actor, action, commit_hash, details, self_hash)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &self.tenant,
                    &(entry.seq as i64),
                    &entry.prev_hash,
                    &entry.timestamp.to_rfc3339(),
                    &entry.actor,
                    &entry.action,
                    &entry.commit_hash,
                    &tokio_postgres::types::Json(&details),
                    &entry.self_hash,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code().map(|c| c.code()) == Some(UNIQUE_VIOLATION) => {
                Err(EngramError::Conflict {
                    name: format!("log:{}", entry.seq),
                    expected: None,
                    actual: Some(entry.seq.to_string()),
                })
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn read_log(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT seq, prev_hash, timestamp, actor, action, commit_hash, details, self_hash
                 FROM logs WHERE tenant = $1 AND seq >= $2
                 ORDER BY seq ASC LIMIT $3",
                &[&self.tenant, &(start_seq as i64), &(limit as i64)],
            )
            .await
            .map_err(unavailable)?;

        rows.into_iter()
            .map(|row| {
                let ts: String = row.get(2);
                let timestamp = DateTime::parse_from_rfc3339(&ts)
                    .map_err(|e| EngramError::Serialization(e.to_string()))?
                    .with_timezone(&Utc);
                let tokio_postgres::types::Json(details) =
                    row.get::<_, tokio_postgres::types::Json<serde_json::Value>>(6);
                Ok(AuditEntry {
                    seq: row.get::<_, i64>(0) as u64,
                    prev_hash: row.get(1),
                    timestamp,
                    actor: row.get(3),
                    action: row.get(4),
                    commit_hash: row.get(5),
                    details,
                    self_hash: row.get(7),
                })
            })
            .collect()
    }
}
