//! # engram-core
//!
//! Content-addressed version control for autonomous agent state. Each
//! commit captures a snapshot of arbitrary JSON-shaped memory and world
//! state, organized into a DAG of commits with named branches:
//!
//! - **Deterministic identity**: canonical JSON serialization hashed with
//!   SHA-256, bit-identical across platforms and language bindings
//! - **Structural diff & three-way merge** over arbitrary JSON trees,
//!   pruned by memoized Merkle subtree hashes
//! - **Pluggable storage**: embedded SQLite, pooled PostgreSQL (feature
//!   `postgres`), S3 blob store (feature `s3`), plus an in-memory backend
//!   for tests; optional per-tenant at-rest encryption wraps any of them
//! - **Tamper-evident audit log**: hash-chained entries with chain
//!   verification
//! - **History management**: mark–sweep GC, squash, retention sweeps and
//!   backend-to-backend migration
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use engram_core::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let repo = Repository::open(RepositoryConfig::file("./agent.db", "agent-1")).await?;
//!
//!     let state = AgentState::new(json!({"step": 1}), json!({}));
//!     let hash = repo.commit(&state, "first step", ActionType::ToolCall, "agent-1").await?;
//!
//!     let restored = repo.checkout(hash.as_str()).await?;
//!     assert_eq!(restored.memory, json!({"step": 1}));
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod canonical;
pub mod config;
pub mod error;
pub mod gc;
pub mod migration;
pub mod objects;
pub mod refs;
pub mod repository;
pub mod retention;
pub mod state;
pub mod storage;
pub mod types;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{AuditEntry, AuditFilter, AuditLog};
    pub use crate::config::{BackendConfig, RepositoryConfig};
    pub use crate::error::{EngramError, Result};
    pub use crate::gc::{GcPolicy, GcReport, SquashReport};
    pub use crate::migration::{migrate, MigrationProgress};
    pub use crate::objects::{Blob, Commit, ObjectStore};
    pub use crate::refs::{HeadState, RefManager};
    pub use crate::repository::{MergeOutcome, RepoStatus, Repository};
    pub use crate::retention::{RetentionPolicy, RetentionReport};
    pub use crate::state::{AgentState, DiffEntry, MergeResolution, StateDiff};
    pub use crate::storage::{EncryptedBackend, InMemoryBackend, SqliteBackend, StorageBackend};
    pub use crate::types::{ActionType, ChangeType, Hash, MergeStrategy, ObjectKind};

    #[cfg(feature = "postgres")]
    pub use crate::storage::PostgresBackend;

    #[cfg(feature = "s3")]
    pub use crate::storage::S3Backend;
}
