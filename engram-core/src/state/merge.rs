//! Three-way structural merge against a common ancestor
//!
//! At each position a side counts as changed when its canonical subtree
//! hash differs from the base. Where both sides changed incompatibly and
//! the values are not both objects, the position is a conflict: the merge
//! resolves it to `ours` and records the path, so callers that cannot
//! block on human resolution still get a usable result. Strict handling is
//! a caller policy on top of the recorded paths.

use serde_json::Value;
use std::collections::BTreeSet;

use super::merkle::MerkleNode;

/// Result of a three-way merge: the merged value plus every conflict path
/// that was resolved in favor of `ours`.
#[derive(Debug, Clone)]
pub struct MergeResolution {
    pub value: Value,
    pub conflicts: Vec<Vec<String>>,
}

impl MergeResolution {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Conflict paths in dotted form, for error reporting.
    pub fn conflict_paths(&self) -> Vec<String> {
        self.conflicts.iter().map(|p| p.join(".")).collect()
    }
}

/// Merge `ours` and `theirs` given their common ancestor `base`.
pub fn three_way_merge(base: &Value, ours: &Value, theirs: &Value) -> MergeResolution {
    let base_tree = MerkleNode::build(base);
    let ours_tree = MerkleNode::build(ours);
    let theirs_tree = MerkleNode::build(theirs);

    let mut conflicts = Vec::new();
    let value = merge_nodes(
        Some(base),
        Some(ours),
        Some(theirs),
        Some(&base_tree),
        Some(&ours_tree),
        Some(&theirs_tree),
        &mut Vec::new(),
        &mut conflicts,
    )
    .unwrap_or(Value::Null);

    MergeResolution { value, conflicts }
}

fn node_hash<'a>(node: Option<&'a MerkleNode>) -> &'a str {
    node.map(|n| n.hash.as_str()).unwrap_or("")
}

/// Merge one position. `None` means the key is absent on that side; a
/// `None` return means the key stays absent in the result.
#[allow(clippy::too_many_arguments)]
fn merge_nodes(
    base: Option<&Value>,
    ours: Option<&Value>,
    theirs: Option<&Value>,
    base_node: Option<&MerkleNode>,
    ours_node: Option<&MerkleNode>,
    theirs_node: Option<&MerkleNode>,
    path: &mut Vec<String>,
    conflicts: &mut Vec<Vec<String>>,
) -> Option<Value> {
    let changed_ours = node_hash(ours_node) != node_hash(base_node);
    let changed_theirs = node_hash(theirs_node) != node_hash(base_node);

    match (changed_ours, changed_theirs) {
        (false, false) => base.cloned(),
        (true, false) => ours.cloned(),
        (false, true) => theirs.cloned(),
        (true, true) => {
            if node_hash(ours_node) == node_hash(theirs_node) {
                return ours.cloned();
            }
            match (ours, theirs) {
                (Some(Value::Object(ours_map)), Some(Value::Object(theirs_map))) => {
                    let empty = serde_json::Map::new();
                    let base_map = match base {
                        Some(Value::Object(m)) => m,
                        _ => &empty,
                    };

                    let mut keys: BTreeSet<&String> = BTreeSet::new();
                    keys.extend(base_map.keys());
                    keys.extend(ours_map.keys());
                    keys.extend(theirs_map.keys());

                    let mut result = serde_json::Map::new();
                    for key in keys {
                        path.push(key.clone());
                        let merged = merge_nodes(
                            base_map.get(key),
                            ours_map.get(key),
                            theirs_map.get(key),
                            base_node.and_then(|n| n.child(key)),
                            ours_node.and_then(|n| n.child(key)),
                            theirs_node.and_then(|n| n.child(key)),
                            path,
                            conflicts,
                        );
                        path.pop();
                        if let Some(value) = merged {
                            result.insert(key.clone(), value);
                        }
                    }
                    Some(Value::Object(result))
                }
                _ => {
                    conflicts.push(path.clone());
                    ours.cloned()
                }
            }
        }
    }
}
