//! Garbage collection and history squashing
//!
//! GC is mark–sweep: the mark phase walks the commit DAG from every branch
//! tip (and a detached HEAD, if any), marking commits, their parents and
//! their state blobs; the sweep deletes whatever was never marked. Refs
//! are never touched. The repository holds its coarse exclusive lock while
//! this runs, so no commit can interleave on the same tenant.
//!
//! Squash collapses the newest `n` commits of a branch into one commit
//! carrying the tip's state; the superseded commits become garbage for a
//! later GC pass.

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::error::{EngramError, Result};
use crate::objects::{Commit, ObjectStore};
use crate::refs::{HeadState, RefManager};
use crate::types::{ActionType, Hash, ObjectKind};

/// Tuning for a garbage collection run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcPolicy {
    /// Branches whose tips must be treated as roots even if their refs
    /// were somehow absent. Every existing ref is a root regardless.
    pub keep_branches: HashSet<String>,
    /// Additionally mark this many ancestors per branch tip.
    pub keep_last_n: usize,
    /// Report what would be deleted without deleting it.
    pub dry_run: bool,
}

/// Outcome of a garbage collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcReport {
    pub objects_before: usize,
    pub objects_removed: usize,
    pub objects_after: usize,
    pub dry_run: bool,
}

/// Outcome of a squash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquashReport {
    pub new_commit: Hash,
    pub commits_squashed: usize,
    pub message: String,
}

type MarkSet = HashSet<(ObjectKind, String)>;

/// Mark every object reachable from the given commit roots.
pub(crate) async fn collect_reachable(objects: &ObjectStore, roots: &[Hash]) -> Result<MarkSet> {
    let mut marked = MarkSet::new();
    let mut queue: VecDeque<Hash> = roots.iter().cloned().collect();

    while let Some(hash) = queue.pop_front() {
        if !marked.insert((ObjectKind::Commit, hash.0.clone())) {
            continue;
        }
        if let Some(commit) = objects.try_get_commit(&hash).await? {
            marked.insert((ObjectKind::Blob, commit.tree_hash.0.clone()));
            for parent in commit.parent_hashes {
                if !marked.contains(&(ObjectKind::Commit, parent.0.clone())) {
                    queue.push_back(parent);
                }
            }
        }
    }
    Ok(marked)
}

/// Run a mark–sweep collection.
pub(crate) async fn run(
    objects: &ObjectStore,
    refs: &RefManager,
    policy: &GcPolicy,
) -> Result<GcReport> {
    let branches = refs.list_branches().await?;
    let mut roots: Vec<Hash> = branches.values().cloned().collect();
    if let HeadState::Detached(hash) = refs.head().await {
        roots.push(hash);
    }
    // keep_branches entries are roots already when their refs exist; an
    // explicit lookup keeps them pinned even under a racing ref rewrite.
    for name in &policy.keep_branches {
        if !branches.contains_key(name) {
            if let Ok(tip) = refs.resolve_branch(name).await {
                roots.push(tip);
            }
        }
    }

    let mut marked = collect_reachable(objects, &roots).await?;

    // Belt over the reachability closure: pin the newest keep_last_n
    // commits of every root explicitly.
    if policy.keep_last_n > 0 {
        for root in &roots {
            let mut queue = VecDeque::from([root.clone()]);
            let mut kept = 0usize;
            let mut seen = HashSet::new();
            while let Some(hash) = queue.pop_front() {
                if kept >= policy.keep_last_n || !seen.insert(hash.0.clone()) {
                    continue;
                }
                kept += 1;
                marked.insert((ObjectKind::Commit, hash.0.clone()));
                if let Some(commit) = objects.try_get_commit(&hash).await? {
                    marked.insert((ObjectKind::Blob, commit.tree_hash.0.clone()));
                    queue.extend(commit.parent_hashes);
                }
            }
        }
    }

    let mut objects_before = 0usize;
    let mut sweep: Vec<(ObjectKind, String)> = Vec::new();
    for kind in [ObjectKind::Commit, ObjectKind::Blob] {
        let mut stream = objects.backend().iter_objects(kind).await?;
        while let Some(item) = stream.next().await {
            let (hash, _bytes) = item?;
            objects_before += 1;
            if !marked.contains(&(kind, hash.clone())) {
                sweep.push((kind, hash));
            }
        }
    }

    let mut objects_removed = 0usize;
    for (kind, hash) in sweep {
        if policy.dry_run {
            objects_removed += 1;
        } else if objects.backend().delete_object(kind, &hash).await? {
            objects_removed += 1;
        }
    }

    tracing::debug!(
        objects_before,
        objects_removed,
        dry_run = policy.dry_run,
        "garbage collection finished"
    );

    Ok(GcReport {
        objects_before,
        objects_removed,
        objects_after: objects_before - objects_removed,
        dry_run: policy.dry_run,
    })
}

/// Collapse the newest `n` commits of a branch into a single commit.
///
/// The new commit keeps the tip's state, takes the parents of the oldest
/// squashed commit, and concatenates the squashed messages oldest-first.
/// The branch is advanced with CAS against the observed tip.
pub(crate) async fn squash(
    objects: &ObjectStore,
    refs: &RefManager,
    author: &str,
    branch: &str,
    n: usize,
) -> Result<SquashReport> {
    if n == 0 {
        return Err(EngramError::InvalidOperation(
            "cannot squash zero commits".to_string(),
        ));
    }

    let tip = refs.resolve_branch(branch).await?;
    squash_at(objects, refs, author, branch, &tip, n).await
}

pub(crate) async fn squash_at(
    objects: &ObjectStore,
    refs: &RefManager,
    author: &str,
    branch: &str,
    tip: &Hash,
    n: usize,
) -> Result<SquashReport> {
    // Walk the first-parent chain for up to n commits.
    let mut chain: Vec<Commit> = Vec::new();
    let mut current = tip.clone();
    loop {
        let commit = objects.get_commit(&current).await?;
        let next = commit.parent_hashes.first().cloned();
        chain.push(commit);
        if chain.len() == n {
            break;
        }
        match next {
            Some(parent) => current = parent,
            None => break,
        }
    }

    let oldest = chain.last().map(|c| c.parent_hashes.clone()).unwrap_or_default();
    let tip_tree = chain[0].tree_hash.clone();

    let messages: Vec<&str> = chain.iter().rev().map(|c| c.message.as_str()).collect();
    let message = format!("squash {} commits: {}", chain.len(), messages.join("; "));

    let squashed = Commit {
        tree_hash: tip_tree,
        parent_hashes: oldest,
        message: message.clone(),
        author: author.to_string(),
        timestamp: Utc::now(),
        action_type: ActionType::Checkpoint,
        metadata: serde_json::Map::new(),
    };

    let new_commit = objects.put_commit(&squashed).await?;
    refs.advance(branch, Some(tip), &new_commit).await?;

    Ok(SquashReport {
        new_commit,
        commits_squashed: chain.len(),
        message,
    })
}
