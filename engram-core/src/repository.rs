//! The repository orchestrator
//!
//! Ties the object store, reference manager and audit log together into
//! the version-control surface: commit, branch, checkout, diff, merge,
//! revert, log, status, plus GC, squash, retention, chain verification and
//! migration helpers. All methods take `&self`; callers may invoke them
//! from multiple tasks in parallel. Branch advances serialize through the
//! backend's CAS, and the garbage collector excludes concurrent commits
//! with a repository-wide lock (commits hold the shared side).
//!
//! Write ordering is objects first, ref CAS second, audit append last, so
//! a cancelled operation can only leave unreachable objects behind.

use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::audit::{AuditEntry, AuditFilter, AuditLog};
use crate::config::{BackendConfig, RepositoryConfig};
use crate::error::{EngramError, Result};
use crate::gc::{self, GcPolicy, GcReport, SquashReport};
use crate::objects::{Blob, Commit, ObjectStore};
use crate::refs::{HeadState, RefManager};
use crate::retention::{self, RetentionPolicy, RetentionReport};
use crate::state::{diff_values, three_way_merge, AgentState, StateDiff};
use crate::storage::{EncryptedBackend, InMemoryBackend, SqliteBackend, StorageBackend};
use crate::types::{ActionType, Hash, MergeStrategy, ObjectKind};

/// Snapshot of where the repository currently points.
#[derive(Debug, Clone)]
pub struct RepoStatus {
    pub head: Option<Hash>,
    pub current_branch: Option<String>,
    pub branches: HashMap<String, Hash>,
}

/// Result of a merge: the merge commit plus any conflict paths that were
/// resolved in favor of the current branch.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub commit: Hash,
    pub conflicts: Vec<String>,
}

/// One tenant's version-controlled agent state.
pub struct Repository {
    backend: Arc<dyn StorageBackend>,
    objects: ObjectStore,
    refs: RefManager,
    audit: AuditLog,
    tenant_id: String,
    merge_base_depth_limit: usize,
    log_limit_default: usize,
    strict_merge: bool,
    // Mutating operations hold the read side; GC holds the write side.
    gc_lock: RwLock<()>,
}

impl Repository {
    /// Open a repository from configuration, constructing the selected
    /// backend and wrapping it for encryption when a passphrase is set.
    pub async fn open(config: RepositoryConfig) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = match &config.backend {
            BackendConfig::File { path } => {
                Arc::new(SqliteBackend::new(path, &config.tenant_id).await?)
            }
            #[cfg(feature = "postgres")]
            BackendConfig::Relational { url, pool_max } => Arc::new(
                crate::storage::PostgresBackend::new(url, &config.tenant_id, *pool_max).await?,
            ),
            #[cfg(feature = "s3")]
            BackendConfig::Blob {
                bucket,
                prefix,
                sqs_notify_url,
                compress_threshold_bytes,
            } => Arc::new(
                crate::storage::S3Backend::new(
                    bucket.clone(),
                    prefix.clone(),
                    &config.tenant_id,
                    sqs_notify_url.clone(),
                    *compress_threshold_bytes,
                )
                .await?,
            ),
            BackendConfig::Memory => Arc::new(InMemoryBackend::new()),
        };
        Self::init(backend, config).await
    }

    /// Open a repository over an already-constructed backend.
    pub async fn init(backend: Arc<dyn StorageBackend>, config: RepositoryConfig) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = match &config.encryption_passphrase {
            Some(passphrase) => Arc::new(EncryptedBackend::new(backend, passphrase)),
            None => backend,
        };
        backend.initialize().await?;

        let refs = RefManager::load(backend.clone()).await?;
        Ok(Repository {
            objects: ObjectStore::new(backend.clone()),
            audit: AuditLog::new(backend.clone()),
            refs,
            backend,
            tenant_id: config.tenant_id,
            merge_base_depth_limit: config.merge_base_depth_limit,
            log_limit_default: config.log_limit_default,
            strict_merge: config.strict_merge,
            gc_lock: RwLock::new(()),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Commit a state snapshot, returning the new commit hash.
    ///
    /// The current branch advances by CAS against the observed parent, so
    /// exactly one of two concurrent committers succeeds; the loser gets
    /// `Conflict` and may retry after re-resolving HEAD.
    pub async fn commit(
        &self,
        state: &AgentState,
        message: &str,
        action_type: ActionType,
        author: &str,
    ) -> Result<Hash> {
        self.commit_with_metadata(state, message, action_type, author, serde_json::Map::new())
            .await
    }

    #[tracing::instrument(skip(self, state, metadata), fields(tenant = %self.tenant_id))]
    pub async fn commit_with_metadata(
        &self,
        state: &AgentState,
        message: &str,
        action_type: ActionType,
        author: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Hash> {
        let _shared = self.gc_lock.read().await;

        let blob = Blob::new(state.to_value());
        let tree_hash = self.objects.put_blob(&blob).await?;

        let head = self.refs.head().await;
        let parent = self.refs.resolve_head().await?;
        let commit = Commit {
            tree_hash,
            parent_hashes: parent.clone().into_iter().collect(),
            message: message.to_string(),
            author: author.to_string(),
            timestamp: Utc::now(),
            action_type,
            metadata,
        };
        let commit_hash = self.objects.put_commit(&commit).await?;

        match head {
            HeadState::Attached(branch) => {
                self.refs
                    .advance(&branch, parent.as_ref(), &commit_hash)
                    .await?;
            }
            HeadState::Detached(_) => {
                self.refs.detach(&commit_hash).await?;
            }
        }

        self.audit
            .append(
                author,
                "commit",
                Some(commit_hash.as_str()),
                json!({"message": message, "action_type": action_type.as_str()}),
            )
            .await?;

        tracing::debug!(hash = %commit_hash.short(), "committed state");
        Ok(commit_hash)
    }

    /// Create a branch at `from` (default: current HEAD).
    pub async fn branch(&self, name: &str, from: Option<&str>) -> Result<()> {
        let source = match from {
            Some(target) => self.resolve_target(target).await?,
            None => self
                .refs
                .resolve_head()
                .await?
                .ok_or_else(|| EngramError::RefNotFound {
                    name: "HEAD".to_string(),
                })?,
        };
        self.refs.create_branch(name, &source).await?;
        self.audit
            .append(
                &self.tenant_id,
                "branch",
                Some(source.as_str()),
                json!({"name": name}),
            )
            .await?;
        Ok(())
    }

    /// Delete a branch; the checked-out branch is refused.
    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        self.refs.delete_branch(name).await?;
        self.audit
            .append(&self.tenant_id, "delete_branch", None, json!({"name": name}))
            .await?;
        Ok(())
    }

    /// Check out a branch (attaching HEAD) or a commit (detaching it),
    /// returning the state at that point.
    pub async fn checkout(&self, target: &str) -> Result<AgentState> {
        let _shared = self.gc_lock.read().await;

        // Branch resolution wins over commit resolution.
        let hash = if self.refs.branch_exists(target).await? {
            let hash = self.refs.resolve_branch(target).await?;
            self.refs.attach(target).await?;
            hash
        } else if self
            .backend
            .has_object(ObjectKind::Commit, target)
            .await?
        {
            let hash = Hash::from(target);
            self.refs.detach(&hash).await?;
            hash
        } else {
            return Err(EngramError::RefNotFound {
                name: target.to_string(),
            });
        };

        let state = self.get_state(&hash).await?;
        self.audit
            .append(
                &self.tenant_id,
                "checkout",
                Some(hash.as_str()),
                json!({"target": target}),
            )
            .await?;
        Ok(state)
    }

    /// Structural diff between the states at two commits.
    pub async fn diff(&self, base: &Hash, target: &Hash) -> Result<StateDiff> {
        let base_state = self.get_state(base).await?;
        let target_state = self.get_state(target).await?;
        Ok(StateDiff {
            base_hash: base.clone(),
            target_hash: target.clone(),
            entries: diff_values(&base_state.to_value(), &target_state.to_value()),
        })
    }

    /// Merge a branch into the current branch.
    #[tracing::instrument(skip(self), fields(tenant = %self.tenant_id))]
    pub async fn merge(&self, branch: &str, strategy: MergeStrategy) -> Result<MergeOutcome> {
        let _shared = self.gc_lock.read().await;

        let current = self
            .refs
            .current_branch()
            .await
            .ok_or(EngramError::DetachedHead)?;
        let ours_hash = self.refs.resolve_branch(&current).await?;
        let theirs_hash = self.refs.resolve_branch(branch).await?;

        // Identical tips merge to a no-op.
        if ours_hash == theirs_hash {
            return Ok(MergeOutcome {
                commit: ours_hash,
                conflicts: Vec::new(),
            });
        }

        let base_hash = self.find_merge_base(&ours_hash, &theirs_hash).await?;
        let base_state = self.get_state(&base_hash).await?;
        let ours_state = self.get_state(&ours_hash).await?;
        let theirs_state = self.get_state(&theirs_hash).await?;

        let mut conflicts = Vec::new();
        let merged_state = match strategy {
            MergeStrategy::Ours => ours_state,
            MergeStrategy::Theirs => theirs_state,
            MergeStrategy::ThreeWay => {
                // The outcome table applies to the whole serialized state,
                // timestamp and cost included.
                let resolution = three_way_merge(
                    &base_state.to_value(),
                    &ours_state.to_value(),
                    &theirs_state.to_value(),
                );
                if self.strict_merge && !resolution.is_clean() {
                    return Err(EngramError::MergeConflict {
                        paths: resolution.conflict_paths(),
                    });
                }
                conflicts = resolution.conflict_paths();
                AgentState::from_value(resolution.value)?
            }
        };

        let blob = Blob::new(merged_state.to_value());
        let tree_hash = self.objects.put_blob(&blob).await?;
        let commit = Commit {
            tree_hash,
            parent_hashes: vec![ours_hash.clone(), theirs_hash],
            message: format!("merge branch '{branch}' into '{current}'"),
            author: self.tenant_id.clone(),
            timestamp: Utc::now(),
            action_type: ActionType::Merge,
            metadata: serde_json::Map::new(),
        };
        let commit_hash = self.objects.put_commit(&commit).await?;

        self.refs
            .advance(&current, Some(&ours_hash), &commit_hash)
            .await?;

        self.audit
            .append(
                &self.tenant_id,
                "merge",
                Some(commit_hash.as_str()),
                json!({
                    "branch": branch,
                    "into": current,
                    "strategy": strategy,
                    "conflicts": conflicts,
                }),
            )
            .await?;

        Ok(MergeOutcome {
            commit: commit_hash,
            conflicts,
        })
    }

    /// Restore the state at `target` by committing it anew on top of the
    /// current HEAD. History is never rewritten.
    #[tracing::instrument(skip(self), fields(tenant = %self.tenant_id))]
    pub async fn revert(&self, target: &Hash) -> Result<AgentState> {
        let state = self.get_state(target).await?;
        let message = format!("revert to {}", target.short());
        self.commit(&state, &message, ActionType::Rollback, &self.tenant_id)
            .await?;
        Ok(state)
    }

    /// Commit history from a branch tip (default HEAD): breadth-first
    /// over parents, each commit once, newest-first by timestamp.
    pub async fn log(&self, branch: Option<&str>, limit: Option<usize>) -> Result<Vec<(Hash, Commit)>> {
        let limit = limit.unwrap_or(self.log_limit_default);
        let start = match branch {
            Some(name) => self.refs.resolve_branch(name).await?,
            None => self
                .refs
                .resolve_head()
                .await?
                .ok_or_else(|| EngramError::RefNotFound {
                    name: "HEAD".to_string(),
                })?,
        };

        let mut commits: Vec<(Hash, Commit)> = Vec::new();
        let mut visited: HashSet<Hash> = HashSet::new();
        let mut queue = VecDeque::from([start]);

        while let Some(hash) = queue.pop_front() {
            if commits.len() >= limit
                || visited.len() >= self.merge_base_depth_limit
                || visited.contains(&hash)
            {
                continue;
            }
            visited.insert(hash.clone());

            if let Some(commit) = self.objects.try_get_commit(&hash).await? {
                for parent in &commit.parent_hashes {
                    if !visited.contains(parent) {
                        queue.push_back(parent.clone());
                    }
                }
                commits.push((hash, commit));
            }
        }

        commits.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));
        commits.truncate(limit);
        Ok(commits)
    }

    /// Current HEAD, branch and branch tips.
    pub async fn status(&self) -> Result<RepoStatus> {
        Ok(RepoStatus {
            head: self.refs.resolve_head().await?,
            current_branch: self.refs.current_branch().await,
            branches: self.refs.list_branches().await?,
        })
    }

    /// Decode the state stored at a commit.
    pub async fn get_state(&self, hash: &Hash) -> Result<AgentState> {
        let commit = self.objects.get_commit(hash).await?;
        let blob = self.objects.get_blob(&commit.tree_hash).await?;
        AgentState::from_value(blob.data)
    }

    /// Lowest common ancestor of two commits by bounded breadth-first
    /// traversal; falls back to `a` for disjoint histories.
    pub async fn find_merge_base(&self, a: &Hash, b: &Hash) -> Result<Hash> {
        let ancestors = self.collect_ancestors(a).await?;

        let mut queue = VecDeque::from([b.clone()]);
        let mut visited: HashSet<Hash> = HashSet::new();
        while let Some(hash) = queue.pop_front() {
            if ancestors.contains(&hash) {
                return Ok(hash);
            }
            if !visited.insert(hash.clone()) {
                continue;
            }
            if visited.len() > self.merge_base_depth_limit {
                return Err(EngramError::DepthLimitExceeded);
            }
            if let Some(commit) = self.objects.try_get_commit(&hash).await? {
                for parent in commit.parent_hashes {
                    if !visited.contains(&parent) {
                        queue.push_back(parent);
                    }
                }
            }
        }

        Ok(a.clone())
    }

    /// Mark–sweep unreachable objects. Takes the exclusive side of the
    /// repository lock, so no commit can run concurrently on this tenant.
    #[tracing::instrument(skip(self), fields(tenant = %self.tenant_id))]
    pub async fn gc(&self, policy: &GcPolicy) -> Result<GcReport> {
        let _exclusive = self.gc_lock.write().await;
        let report = gc::run(&self.objects, &self.refs, policy).await?;
        if !policy.dry_run {
            self.audit
                .append(
                    &self.tenant_id,
                    "gc",
                    None,
                    json!({
                        "objects_removed": report.objects_removed,
                        "objects_after": report.objects_after,
                    }),
                )
                .await?;
        }
        Ok(report)
    }

    /// Collapse the newest `n` commits of a branch into one commit whose
    /// state equals the tip's. The superseded commits become garbage.
    pub async fn squash(&self, branch: &str, n: usize) -> Result<SquashReport> {
        let _shared = self.gc_lock.read().await;
        let report = gc::squash(&self.objects, &self.refs, &self.tenant_id, branch, n).await?;
        self.audit
            .append(
                &self.tenant_id,
                "squash",
                Some(report.new_commit.as_str()),
                json!({"branch": branch, "commits_squashed": report.commits_squashed}),
            )
            .await?;
        Ok(report)
    }

    /// Apply a retention policy. Composes squash-style truncation with a
    /// later GC; idempotent and resumable.
    pub async fn apply_retention(&self, policy: &RetentionPolicy) -> Result<RetentionReport> {
        let _shared = self.gc_lock.read().await;
        let report = retention::apply(&self.objects, &self.refs, &self.tenant_id, policy).await?;
        if report.branches_truncated > 0 {
            self.audit
                .append(
                    &self.tenant_id,
                    "retention",
                    None,
                    json!({
                        "branches_truncated": report.branches_truncated,
                        "commits_squashed": report.commits_squashed,
                    }),
                )
                .await?;
        }
        Ok(report)
    }

    /// Verify the audit chain; see [`AuditLog::verify_chain`].
    pub async fn verify_chain(&self, from_seq: Option<u64>, to_seq: Option<u64>) -> Result<()> {
        self.audit.verify_chain(from_seq, to_seq).await
    }

    /// Filtered audit query, newest first.
    pub async fn audit_log(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.audit.query(filter).await
    }

    /// Raw audit entries ordered by sequence number.
    pub async fn read_audit(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        self.audit.read(start_seq, limit).await
    }

    pub async fn healthcheck(&self) -> Result<()> {
        self.backend.healthcheck().await
    }

    /// Release backend resources and zeroize cached encryption keys.
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    /// The underlying backend handle, for migration tooling.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    // Resolve a user-supplied target: branch first, then commit hash.
    async fn resolve_target(&self, target: &str) -> Result<Hash> {
        if self.refs.branch_exists(target).await? {
            return self.refs.resolve_branch(target).await;
        }
        if self.backend.has_object(ObjectKind::Commit, target).await? {
            return Ok(Hash::from(target));
        }
        Err(EngramError::RefNotFound {
            name: target.to_string(),
        })
    }

    async fn collect_ancestors(&self, start: &Hash) -> Result<HashSet<Hash>> {
        let mut ancestors: HashSet<Hash> = HashSet::new();
        let mut queue = VecDeque::from([start.clone()]);

        while let Some(hash) = queue.pop_front() {
            if !ancestors.insert(hash.clone()) {
                continue;
            }
            if ancestors.len() > self.merge_base_depth_limit {
                return Err(EngramError::DepthLimitExceeded);
            }
            if let Some(commit) = self.objects.try_get_commit(&hash).await? {
                queue.extend(commit.parent_hashes);
            }
        }
        Ok(ancestors)
    }
}
