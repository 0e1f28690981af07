//! Retention policies: bounded history per branch
//!
//! A retention sweep walks each branch's first-parent chain and finds the
//! first commit that violates the policy (too old, or beyond the commit
//! budget). Everything from that point down is squashed into a single
//! parentless rollup commit carrying the boundary state, and the kept
//! commits are rebuilt on top of it; parents participate in commit
//! identity, so the kept commits get new hashes while keeping their
//! messages, authors and timestamps. The branch is CAS'd to the rebuilt
//! tip and the superseded chain is left for the garbage collector.
//!
//! The sweep is idempotent: a branch that already satisfies the policy is
//! left untouched, and re-running after a partial failure simply redoes
//! the remaining branches.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::objects::{Commit, ObjectStore};
use crate::refs::RefManager;
use crate::types::{ActionType, Hash};

/// Configurable retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Drop commits older than this from non-protected branches.
    pub max_age: Option<Duration>,
    /// Cap per-branch history length, rollup commit included.
    pub max_commits: Option<usize>,
    /// Branches never truncated.
    pub keep_branches: Vec<String>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: None,
            max_commits: None,
            keep_branches: vec!["main".to_string()],
        }
    }
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionReport {
    pub branches_truncated: usize,
    pub commits_squashed: usize,
    pub commits_retained: usize,
}

pub(crate) async fn apply(
    objects: &ObjectStore,
    refs: &RefManager,
    author: &str,
    policy: &RetentionPolicy,
) -> Result<RetentionReport> {
    let mut report = RetentionReport::default();
    let now = Utc::now();

    for (branch, tip) in refs.list_branches().await? {
        if policy.keep_branches.contains(&branch) {
            continue;
        }

        // First-parent chain, tip first.
        let mut chain: Vec<(Hash, Commit)> = Vec::new();
        let mut current = Some(tip.clone());
        while let Some(hash) = current {
            match objects.try_get_commit(&hash).await? {
                Some(commit) => {
                    current = commit.parent_hashes.first().cloned();
                    chain.push((hash, commit));
                }
                None => break,
            }
        }

        let Some(cut) = cut_index(&chain, policy, &now) else {
            report.commits_retained += chain.len();
            continue;
        };

        let (kept, old) = chain.split_at(cut);
        let boundary = &old[0].1;

        // One parentless rollup commit holding the boundary state.
        let rollup = Commit {
            tree_hash: boundary.tree_hash.clone(),
            parent_hashes: Vec::new(),
            message: format!("retention: squashed {} commits", old.len()),
            author: author.to_string(),
            timestamp: Utc::now(),
            action_type: ActionType::Checkpoint,
            metadata: serde_json::Map::new(),
        };
        let mut new_parent = objects.put_commit(&rollup).await?;

        // Rebuild the kept suffix oldest-first on top of the rollup.
        for (_, commit) in kept.iter().rev() {
            let mut rebuilt = commit.clone();
            let mut parents = vec![new_parent.clone()];
            parents.extend(commit.parent_hashes.iter().skip(1).cloned());
            rebuilt.parent_hashes = parents;
            new_parent = objects.put_commit(&rebuilt).await?;
        }

        refs.advance(&branch, Some(&tip), &new_parent).await?;

        tracing::debug!(
            branch = %branch,
            squashed = old.len(),
            retained = kept.len(),
            "retention truncated branch"
        );
        report.branches_truncated += 1;
        report.commits_squashed += old.len();
        report.commits_retained += kept.len() + 1;
    }

    Ok(report)
}

/// Index of the first commit that violates the policy; `None` when the
/// whole chain conforms.
fn cut_index(
    chain: &[(Hash, Commit)],
    policy: &RetentionPolicy,
    now: &chrono::DateTime<Utc>,
) -> Option<usize> {
    let mut cut: Option<usize> = None;

    if let Some(max_commits) = policy.max_commits {
        if chain.len() > max_commits {
            // The rollup itself counts toward the budget.
            cut = Some(max_commits.max(1) - 1);
        }
    }

    if let Some(max_age) = policy.max_age {
        let age_cut = chain.iter().position(|(_, commit)| {
            let age = now.signed_duration_since(commit.timestamp);
            age.num_seconds() > max_age.as_secs() as i64
        });
        cut = match (cut, age_cut) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    cut.filter(|c| *c < chain.len())
}
