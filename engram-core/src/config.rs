//! Repository configuration

use serde::{Deserialize, Serialize};

/// Default bound on merge-base ancestor traversal.
pub const DEFAULT_MERGE_BASE_DEPTH_LIMIT: usize = 10_000;

/// Default number of commits returned by `log`.
pub const DEFAULT_LOG_LIMIT: usize = 50;

/// Backend selection and connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Embedded single-file store (SQLite). `":memory:"` is volatile.
    File { path: String },

    /// Pooled PostgreSQL store.
    #[cfg(feature = "postgres")]
    Relational {
        url: String,
        /// Connection pool bound.
        #[serde(default = "default_pool_max")]
        pool_max: usize,
    },

    /// S3 blob store.
    #[cfg(feature = "s3")]
    Blob {
        bucket: String,
        #[serde(default)]
        prefix: String,
        /// Optional queue notified on every audit append.
        #[serde(default)]
        sqs_notify_url: Option<String>,
        /// Payloads at or above this size are zstd-compressed.
        #[serde(default = "default_compress_threshold")]
        compress_threshold_bytes: usize,
    },

    /// Volatile in-process store, for tests and prototyping.
    Memory,
}

#[cfg(feature = "postgres")]
fn default_pool_max() -> usize {
    crate::storage::postgres::DEFAULT_POOL_MAX
}

#[cfg(feature = "s3")]
fn default_compress_threshold() -> usize {
    crate::storage::s3::DEFAULT_COMPRESS_THRESHOLD
}

/// Everything the engine needs to open one tenant's repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub backend: BackendConfig,

    /// Namespacing key; required. Objects, refs, logs and keys of one
    /// tenant are invisible to every other tenant.
    pub tenant_id: String,

    /// Enables per-tenant at-rest encryption when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_passphrase: Option<String>,

    /// Bound on merge-base ancestor traversal.
    #[serde(default = "default_depth_limit")]
    pub merge_base_depth_limit: usize,

    /// Default `log` length when the caller passes no limit.
    #[serde(default = "default_log_limit")]
    pub log_limit_default: usize,

    /// Fail `ThreeWay` merges with `MergeConflict` instead of resolving
    /// conflicts to ours.
    #[serde(default)]
    pub strict_merge: bool,
}

fn default_depth_limit() -> usize {
    DEFAULT_MERGE_BASE_DEPTH_LIMIT
}

fn default_log_limit() -> usize {
    DEFAULT_LOG_LIMIT
}

impl RepositoryConfig {
    /// Embedded store at a path.
    pub fn file(path: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self::with_backend(
            BackendConfig::File { path: path.into() },
            tenant_id,
        )
    }

    /// Volatile store, mainly for tests.
    pub fn in_memory(tenant_id: impl Into<String>) -> Self {
        Self::with_backend(BackendConfig::Memory, tenant_id)
    }

    pub fn with_backend(backend: BackendConfig, tenant_id: impl Into<String>) -> Self {
        RepositoryConfig {
            backend,
            tenant_id: tenant_id.into(),
            encryption_passphrase: None,
            merge_base_depth_limit: DEFAULT_MERGE_BASE_DEPTH_LIMIT,
            log_limit_default: DEFAULT_LOG_LIMIT,
            strict_merge: false,
        }
    }

    pub fn with_encryption(mut self, passphrase: impl Into<String>) -> Self {
        self.encryption_passphrase = Some(passphrase.into());
        self
    }

    pub fn with_strict_merge(mut self, strict: bool) -> Self {
        self.strict_merge = strict;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RepositoryConfig::in_memory("tenant-a");
        assert_eq!(config.merge_base_depth_limit, 10_000);
        assert_eq!(config.log_limit_default, 50);
        assert!(!config.strict_merge);
        assert!(config.encryption_passphrase.is_none());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = RepositoryConfig::file("/tmp/engram.db", "tenant-a")
            .with_encryption("hunter2")
            .with_strict_merge(true);
        let json = serde_json::to_string(&config).unwrap();
        let back: RepositoryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tenant_id, "tenant-a");
        assert!(back.strict_merge);
        assert_eq!(back.encryption_passphrase.as_deref(), Some("hunter2"));
        assert!(matches!(back.backend, BackendConfig::File { .. }));
    }
}
