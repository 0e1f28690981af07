//! Recursive structural diff between two JSON states
//!
//! Comparison at every level is by canonical subtree hash, pruned through
//! the memoized Merkle trees. Arrays are compared by whole value; a
//! positional mismatch yields a single `Changed` entry at the array path.

use serde_json::Value;

use super::merkle::MerkleNode;
use super::DiffEntry;
use crate::types::ChangeType;

/// Compute the list of change entries turning `base` into `target`.
pub fn diff_values(base: &Value, target: &Value) -> Vec<DiffEntry> {
    let base_tree = MerkleNode::build(base);
    let target_tree = MerkleNode::build(target);
    let mut entries = Vec::new();
    walk(base, target, &base_tree, &target_tree, &mut Vec::new(), &mut entries);
    entries
}

fn walk(
    base: &Value,
    target: &Value,
    base_node: &MerkleNode,
    target_node: &MerkleNode,
    path: &mut Vec<String>,
    entries: &mut Vec<DiffEntry>,
) {
    if base_node.same(target_node) {
        return;
    }

    match (base, target) {
        (Value::Object(base_map), Value::Object(target_map)) => {
            for (key, base_val) in base_map {
                path.push(key.clone());
                match target_map.get(key) {
                    Some(target_val) => {
                        // Object children always have memoized nodes.
                        if let (Some(bn), Some(tn)) = (base_node.child(key), target_node.child(key))
                        {
                            walk(base_val, target_val, bn, tn, path, entries);
                        }
                    }
                    None => entries.push(DiffEntry {
                        path: path.clone(),
                        change_type: ChangeType::Removed,
                        old_value: Some(base_val.clone()),
                        new_value: None,
                    }),
                }
                path.pop();
            }
            for (key, target_val) in target_map {
                if !base_map.contains_key(key) {
                    path.push(key.clone());
                    entries.push(DiffEntry {
                        path: path.clone(),
                        change_type: ChangeType::Added,
                        old_value: None,
                        new_value: Some(target_val.clone()),
                    });
                    path.pop();
                }
            }
        }
        _ => entries.push(DiffEntry {
            path: path.clone(),
            change_type: ChangeType::Changed,
            old_value: Some(base.clone()),
            new_value: Some(target.clone()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry_at<'a>(entries: &'a [DiffEntry], path: &[&str]) -> Option<&'a DiffEntry> {
        entries.iter().find(|e| e.path == path)
    }

    #[test]
    fn test_identical_values_empty_diff() {
        let v = json!({"memory": {"a": 1}, "world_state": {"b": [1, 2]}});
        assert!(diff_values(&v, &v).is_empty());
    }

    #[test]
    fn test_added_key() {
        let base = json!({"memory": {"a": 1}});
        let target = json!({"memory": {"a": 1, "b": 2}});
        let entries = diff_values(&base, &target);
        assert_eq!(entries.len(), 1);
        let e = entry_at(&entries, &["memory", "b"]).unwrap();
        assert_eq!(e.change_type, ChangeType::Added);
        assert_eq!(e.new_value, Some(json!(2)));
        assert_eq!(e.old_value, None);
    }

    #[test]
    fn test_removed_key() {
        let base = json!({"memory": {"a": 1, "b": 2}});
        let target = json!({"memory": {"a": 1}});
        let entries = diff_values(&base, &target);
        assert_eq!(entries.len(), 1);
        let e = entry_at(&entries, &["memory", "b"]).unwrap();
        assert_eq!(e.change_type, ChangeType::Removed);
        assert_eq!(e.old_value, Some(json!(2)));
    }

    #[test]
    fn test_changed_leaf() {
        let base = json!({"memory": {"counter": 1}});
        let target = json!({"memory": {"counter": 2}});
        let entries = diff_values(&base, &target);
        assert_eq!(entries.len(), 1);
        let e = entry_at(&entries, &["memory", "counter"]).unwrap();
        assert_eq!(e.change_type, ChangeType::Changed);
        assert_eq!(e.old_value, Some(json!(1)));
        assert_eq!(e.new_value, Some(json!(2)));
    }

    #[test]
    fn test_unchanged_sibling_not_reported() {
        let base = json!({"memory": {"a": 1, "b": 2}});
        let target = json!({"memory": {"a": 1, "b": 3, "c": 4}});
        let entries = diff_values(&base, &target);
        assert_eq!(entries.len(), 2);
        assert!(entry_at(&entries, &["memory", "a"]).is_none());
        assert_eq!(
            entry_at(&entries, &["memory", "b"]).unwrap().change_type,
            ChangeType::Changed
        );
        assert_eq!(
            entry_at(&entries, &["memory", "c"]).unwrap().change_type,
            ChangeType::Added
        );
    }

    #[test]
    fn test_array_mismatch_is_single_change_at_array_path() {
        let base = json!({"memory": {"items": [1, 2, 3]}});
        let target = json!({"memory": {"items": [1, 9, 3]}});
        let entries = diff_values(&base, &target);
        assert_eq!(entries.len(), 1);
        let e = entry_at(&entries, &["memory", "items"]).unwrap();
        assert_eq!(e.change_type, ChangeType::Changed);
        assert_eq!(e.old_value, Some(json!([1, 2, 3])));
        assert_eq!(e.new_value, Some(json!([1, 9, 3])));
    }

    #[test]
    fn test_type_change_is_changed() {
        let base = json!({"memory": {"x": {"nested": 1}}});
        let target = json!({"memory": {"x": [1]}});
        let entries = diff_values(&base, &target);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entry_at(&entries, &["memory", "x"]).unwrap().change_type,
            ChangeType::Changed
        );
    }

    #[test]
    fn test_classification_symmetry() {
        let a = json!({"m": {"kept": 1, "gone": 2, "edited": 3}});
        let b = json!({"m": {"kept": 1, "new": 4, "edited": 5}});
        let forward = diff_values(&a, &b);
        let backward = diff_values(&b, &a);

        for e in &forward {
            let mirror = backward.iter().find(|m| m.path == e.path).unwrap();
            match e.change_type {
                ChangeType::Added => {
                    assert_eq!(mirror.change_type, ChangeType::Removed);
                    assert_eq!(mirror.old_value, e.new_value);
                }
                ChangeType::Removed => {
                    assert_eq!(mirror.change_type, ChangeType::Added);
                    assert_eq!(mirror.new_value, e.old_value);
                }
                ChangeType::Changed => {
                    assert_eq!(mirror.change_type, ChangeType::Changed);
                    assert_eq!(mirror.old_value, e.new_value);
                    assert_eq!(mirror.new_value, e.old_value);
                }
            }
        }
        assert_eq!(forward.len(), backward.len());
    }

    #[test]
    fn test_deep_nesting_reports_leaf_path() {
        let base = json!({"a": {"b": {"c": {"d": 1}}}});
        let target = json!({"a": {"b": {"c": {"d": 2}}}});
        let entries = diff_values(&base, &target);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, vec!["a", "b", "c", "d"]);
    }
}
