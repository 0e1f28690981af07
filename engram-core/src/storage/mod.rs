//! Pluggable storage backends
//!
//! One capability set served by very different substrates:
//!
//! - `SqliteBackend`: embedded single-file store, concurrent readers with
//!   a serialized writer
//! - `PostgresBackend`: pooled relational store (feature `postgres`)
//! - `S3Backend`: eventually-consistent blob store (feature `s3`)
//! - `InMemoryBackend`: tests and prototyping
//! - `EncryptedBackend`: at-rest encryption wrapper over any of the above
//!
//! Every operation is scoped to the tenant the backend was constructed
//! for; objects, refs and log chains are never visible across tenants.
//! `cas_ref` is the one primitive that serializes concurrent branch
//! advances; everything else composes on top of it. Writes are durable
//! before an operation returns success.

pub mod encrypted;
pub mod memory;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "s3")]
pub mod s3;

pub use encrypted::EncryptedBackend;
pub use memory::InMemoryBackend;
pub use sqlite::SqliteBackend;

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

#[cfg(feature = "s3")]
pub use s3::S3Backend;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;

use crate::audit::AuditEntry;
use crate::error::Result;
use crate::types::ObjectKind;

/// Lazy sequence of `(hash, bytes)` pairs from an object scan.
pub type ObjectStream<'a> = BoxStream<'a, Result<(String, Vec<u8>)>>;

/// The storage capability set implemented by every backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Idempotent schema/bucket/table setup.
    async fn initialize(&self) -> Result<()>;

    /// Release connections and clear any cached key material.
    async fn close(&self) -> Result<()>;

    /// Verify the backend is reachable and serving this tenant.
    async fn healthcheck(&self) -> Result<()>;

    /// Store a content-addressed object. Idempotent: re-putting an
    /// existing hash is a no-op.
    async fn put_object(&self, kind: ObjectKind, hash: &str, data: &[u8]) -> Result<()>;

    /// Fetch object bytes, `None` when absent.
    async fn get_object(&self, kind: ObjectKind, hash: &str) -> Result<Option<Vec<u8>>>;

    async fn has_object(&self, kind: ObjectKind, hash: &str) -> Result<bool>;

    /// Remove an object; `true` if it existed. Only the garbage collector
    /// calls this.
    async fn delete_object(&self, kind: ObjectKind, hash: &str) -> Result<bool>;

    /// Scan all objects of one kind.
    async fn iter_objects(&self, kind: ObjectKind) -> Result<ObjectStream<'_>>;

    async fn get_ref(&self, name: &str) -> Result<Option<String>>;

    /// Unconditional ref write.
    async fn set_ref(&self, name: &str, target: &str) -> Result<()>;

    /// Remove a ref; `true` if it existed.
    async fn delete_ref(&self, name: &str) -> Result<bool>;

    async fn list_refs(&self) -> Result<HashMap<String, String>>;

    /// Compare-and-set: atomically move `name` from `expected` to
    /// `target`. `expected = None` asserts the ref does not exist. Fails
    /// with `Conflict` carrying the actual value when the assertion does
    /// not hold.
    async fn cas_ref(&self, name: &str, expected: Option<&str>, target: &str) -> Result<()>;

    /// Append one audit entry. Atomic with respect to its own ordering:
    /// a duplicate sequence number fails with `Conflict`.
    async fn append_log(&self, entry: &AuditEntry) -> Result<()>;

    /// Entries with `seq >= start_seq`, ordered ascending, at most `limit`.
    async fn read_log(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>>;
}
