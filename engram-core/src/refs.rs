//! Branch references and the HEAD selector
//!
//! Branches are mutable name → commit mappings living in the storage
//! backend; HEAD either names the checked-out branch (attached) or holds a
//! commit hash directly (detached). HEAD persists under the reserved ref
//! name `HEAD`, encoded as `ref:<branch>` when attached and as the raw
//! hash when detached. Branch advances go through the backend's
//! compare-and-set so concurrent writers cannot clobber each other.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{EngramError, Result};
use crate::storage::StorageBackend;
use crate::types::Hash;

/// Reserved ref name for the HEAD selector.
pub const HEAD_REF: &str = "HEAD";

/// Default branch, auto-created by the first commit.
pub const DEFAULT_BRANCH: &str = "main";

const ATTACHED_PREFIX: &str = "ref:";

/// Where HEAD currently points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadState {
    /// Checked out on a branch; commits advance it.
    Attached(String),
    /// Pinned to a specific commit.
    Detached(Hash),
}

/// Branch and HEAD management over a storage backend.
pub struct RefManager {
    backend: Arc<dyn StorageBackend>,
    head: RwLock<HeadState>,
}

impl RefManager {
    /// Load the persisted HEAD, defaulting to an unborn `main`.
    pub async fn load(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let head = match backend.get_ref(HEAD_REF).await? {
            Some(value) => match value.strip_prefix(ATTACHED_PREFIX) {
                Some(branch) => HeadState::Attached(branch.to_string()),
                None => HeadState::Detached(Hash(value)),
            },
            None => HeadState::Attached(DEFAULT_BRANCH.to_string()),
        };
        Ok(RefManager {
            backend,
            head: RwLock::new(head),
        })
    }

    /// Branch name rules: non-empty, no whitespace, and the characters
    /// reserved by the persistence layer are refused.
    pub fn validate_name(name: &str) -> Result<()> {
        let invalid = name.is_empty()
            || name == HEAD_REF
            || name.contains(char::is_whitespace)
            || name.contains(':');
        if invalid {
            return Err(EngramError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub async fn head(&self) -> HeadState {
        self.head.read().await.clone()
    }

    pub async fn current_branch(&self) -> Option<String> {
        match &*self.head.read().await {
            HeadState::Attached(name) => Some(name.clone()),
            HeadState::Detached(_) => None,
        }
    }

    /// Resolve HEAD to a commit hash; `None` on an unborn branch.
    pub async fn resolve_head(&self) -> Result<Option<Hash>> {
        match self.head().await {
            HeadState::Attached(branch) => {
                Ok(self.backend.get_ref(&branch).await?.map(Hash))
            }
            HeadState::Detached(hash) => Ok(Some(hash)),
        }
    }

    /// Resolve a branch name to its tip.
    pub async fn resolve_branch(&self, name: &str) -> Result<Hash> {
        self.backend
            .get_ref(name)
            .await?
            .map(Hash)
            .ok_or_else(|| EngramError::BranchNotFound {
                name: name.to_string(),
            })
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool> {
        if name == HEAD_REF {
            return Ok(false);
        }
        Ok(self.backend.get_ref(name).await?.is_some())
    }

    /// All branches and their tips; the HEAD selector is not a branch.
    pub async fn list_branches(&self) -> Result<HashMap<String, Hash>> {
        let refs = self.backend.list_refs().await?;
        Ok(refs
            .into_iter()
            .filter(|(name, _)| name != HEAD_REF)
            .map(|(name, target)| (name, Hash(target)))
            .collect())
    }

    /// Create a branch at a commit; fails if the name is taken.
    pub async fn create_branch(&self, name: &str, at: &Hash) -> Result<()> {
        Self::validate_name(name)?;
        match self.backend.cas_ref(name, None, at.as_str()).await {
            Ok(()) => Ok(()),
            Err(EngramError::Conflict { .. }) => Err(EngramError::AlreadyExists {
                name: name.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Unconditionally point a branch at a commit.
    pub async fn set_branch(&self, name: &str, at: &Hash) -> Result<()> {
        Self::validate_name(name)?;
        self.backend.set_ref(name, at.as_str()).await
    }

    /// Delete a branch. The currently attached branch is refused.
    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        if self.current_branch().await.as_deref() == Some(name) {
            return Err(EngramError::InvalidOperation(format!(
                "cannot delete the checked-out branch '{name}'"
            )));
        }
        if !self.backend.delete_ref(name).await? {
            return Err(EngramError::BranchNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Advance a branch tip with the expected previous value; loses to
    /// concurrent writers with `Conflict`.
    pub async fn advance(&self, branch: &str, expected: Option<&Hash>, new: &Hash) -> Result<()> {
        self.backend
            .cas_ref(branch, expected.map(|h| h.as_str()), new.as_str())
            .await
    }

    /// Attach HEAD to a branch.
    pub async fn attach(&self, branch: &str) -> Result<()> {
        let state = HeadState::Attached(branch.to_string());
        self.persist_head(&state).await?;
        *self.head.write().await = state;
        Ok(())
    }

    /// Detach HEAD at a commit.
    pub async fn detach(&self, hash: &Hash) -> Result<()> {
        let state = HeadState::Detached(hash.clone());
        self.persist_head(&state).await?;
        *self.head.write().await = state;
        Ok(())
    }

    async fn persist_head(&self, state: &HeadState) -> Result<()> {
        let encoded = match state {
            HeadState::Attached(branch) => format!("{ATTACHED_PREFIX}{branch}"),
            HeadState::Detached(hash) => hash.0.clone(),
        };
        self.backend.set_ref(HEAD_REF, &encoded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryBackend;

    async fn manager() -> (Arc<InMemoryBackend>, RefManager) {
        let backend = Arc::new(InMemoryBackend::new());
        let refs = RefManager::load(backend.clone()).await.unwrap();
        (backend, refs)
    }

    #[tokio::test]
    async fn test_fresh_repo_head_attached_to_unborn_main() {
        let (_b, refs) = manager().await;
        assert_eq!(refs.current_branch().await, Some("main".to_string()));
        assert_eq!(refs.resolve_head().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_and_resolve_branch() {
        let (_b, refs) = manager().await;
        refs.create_branch("feature", &Hash::from("abc")).await.unwrap();
        assert_eq!(refs.resolve_branch("feature").await.unwrap(), Hash::from("abc"));

        let err = refs.create_branch("feature", &Hash::from("def")).await.unwrap_err();
        assert!(matches!(err, EngramError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_invalid_names() {
        let (_b, refs) = manager().await;
        for bad in ["", "has space", "tab\tname", "HEAD", "with:colon"] {
            let err = refs.create_branch(bad, &Hash::from("abc")).await.unwrap_err();
            assert!(matches!(err, EngramError::InvalidName { .. }), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn test_delete_branch_rules() {
        let (_b, refs) = manager().await;
        refs.create_branch("main", &Hash::from("h1")).await.unwrap();
        refs.create_branch("feature", &Hash::from("h1")).await.unwrap();

        // Current branch is protected.
        let err = refs.delete_branch("main").await.unwrap_err();
        assert!(matches!(err, EngramError::InvalidOperation(_)));

        refs.delete_branch("feature").await.unwrap();
        let err = refs.delete_branch("feature").await.unwrap_err();
        assert!(matches!(err, EngramError::BranchNotFound { .. }));
    }

    #[tokio::test]
    async fn test_advance_cas() {
        let (_b, refs) = manager().await;
        refs.create_branch("main", &Hash::from("h1")).await.unwrap();
        refs.advance("main", Some(&Hash::from("h1")), &Hash::from("h2"))
            .await
            .unwrap();

        let err = refs
            .advance("main", Some(&Hash::from("h1")), &Hash::from("h3"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngramError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_head_persistence_roundtrip() {
        let (backend, refs) = manager().await;
        refs.create_branch("dev", &Hash::from("abc")).await.unwrap();
        refs.attach("dev").await.unwrap();

        let reloaded = RefManager::load(backend.clone()).await.unwrap();
        assert_eq!(reloaded.current_branch().await, Some("dev".to_string()));

        refs.detach(&Hash::from("abc")).await.unwrap();
        let reloaded = RefManager::load(backend).await.unwrap();
        assert_eq!(reloaded.current_branch().await, None);
        assert_eq!(reloaded.resolve_head().await.unwrap(), Some(Hash::from("abc")));
    }

    #[tokio::test]
    async fn test_list_branches_excludes_head() {
        let (_b, refs) = manager().await;
        refs.create_branch("main", &Hash::from("h1")).await.unwrap();
        refs.attach("main").await.unwrap();
        let branches = refs.list_branches().await.unwrap();
        assert_eq!(branches.len(), 1);
        assert!(branches.contains_key("main"));
    }
}
