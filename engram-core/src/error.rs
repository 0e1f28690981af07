//! Error types for engram operations

/// Result type for engram operations
pub type Result<T> = std::result::Result<T, EngramError>;

/// Error taxonomy for the version control engine.
///
/// Every condition maps to exactly one kind and is propagated to callers
/// unchanged; the engine retries nothing on its own.
#[derive(Debug, thiserror::Error)]
pub enum EngramError {
    /// A content-addressed object is absent from storage
    #[error("object not found: {hash}")]
    NotFound { hash: String },

    /// A named reference (branch or HEAD) could not be resolved
    #[error("ref not found: {name}")]
    RefNotFound { name: String },

    /// Branch creation collided with an existing branch
    #[error("branch already exists: {name}")]
    AlreadyExists { name: String },

    /// Malformed branch name
    #[error("invalid branch name: {name:?}")]
    InvalidName { name: String },

    /// Stored bytes do not re-hash to their key, or AEAD authentication failed
    #[error("corrupt object: {hash}")]
    Corrupt { hash: String },

    /// Compare-and-set on a ref lost to a concurrent writer; safe to retry
    /// after re-resolving HEAD
    #[error("ref update conflict on {name:?}: expected {expected:?}, actual {actual:?}")]
    Conflict {
        name: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Merge or delete named a branch that does not exist
    #[error("branch not found: {name}")]
    BranchNotFound { name: String },

    /// Strict three-way merge found irreconcilable changes
    #[error("merge conflict at: {}", paths.join(", "))]
    MergeConflict { paths: Vec<String> },

    /// Ancestor traversal hit the configured depth bound
    #[error("ancestor traversal depth limit exceeded")]
    DepthLimitExceeded,

    /// Audit chain verification failed at the given sequence number
    #[error("audit chain broken at seq {seq}")]
    ChainBroken { seq: u64 },

    /// Transient I/O or connection error from the storage backend
    #[error("backend unavailable: {cause}")]
    BackendUnavailable { cause: String },

    /// Tenant data is encrypted but no passphrase was supplied
    #[error("tenant requires an encryption passphrase that was not supplied")]
    EncryptionKeyMissing,

    /// Operation requires a checked-out branch but HEAD is detached
    #[error("detached HEAD: operation requires a checked-out branch")]
    DetachedHead,

    /// A well-formed request that cannot be satisfied (e.g. squash of zero
    /// commits)
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Encoding or decoding of a stored value failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EngramError {
    fn from(e: serde_json::Error) -> Self {
        EngramError::Serialization(e.to_string())
    }
}
