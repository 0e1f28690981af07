//! Merkle trees over JSON values
//!
//! A `MerkleNode` memoizes the canonical-form hash of every object subtree
//! so that diff and merge can prune equal subtrees with a single hash
//! comparison instead of re-serializing them at every level. Only objects
//! get child nodes; arrays and scalars are compared as whole values.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hash tree node mirroring the shape of a JSON value.
#[derive(Debug, Clone)]
pub struct MerkleNode {
    /// SHA-256 of this subtree's canonical bytes, lowercase hex.
    pub hash: String,
    children: Option<BTreeMap<String, MerkleNode>>,
}

impl MerkleNode {
    /// Build the hash tree for a value in one bottom-up pass.
    pub fn build(value: &Value) -> MerkleNode {
        let (node, _bytes) = build_inner(value);
        node
    }

    /// Child node for an object key; `None` for non-objects or absent keys.
    pub fn child(&self, key: &str) -> Option<&MerkleNode> {
        self.children.as_ref().and_then(|c| c.get(key))
    }

    /// Whether two subtrees are canonically equal.
    pub fn same(&self, other: &MerkleNode) -> bool {
        self.hash == other.hash
    }
}

fn build_inner(value: &Value) -> (MerkleNode, Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            let mut children = BTreeMap::new();
            let mut bytes = Vec::new();
            bytes.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    bytes.push(b',');
                }
                let (child, child_bytes) = build_inner(&map[*key]);
                bytes.extend_from_slice(
                    serde_json::to_string(key.as_str())
                        .unwrap_or_else(|_| String::from("\"\""))
                        .as_bytes(),
                );
                bytes.push(b':');
                bytes.extend_from_slice(&child_bytes);
                children.insert((*key).clone(), child);
            }
            bytes.push(b'}');

            let node = MerkleNode {
                hash: hash_bytes(&bytes),
                children: Some(children),
            };
            (node, bytes)
        }
        _ => {
            let bytes = crate::canonical::canonical_json(value);
            let node = MerkleNode {
                hash: hash_bytes(&bytes),
                children: None,
            };
            (node, bytes)
        }
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
