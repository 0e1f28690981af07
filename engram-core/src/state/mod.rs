//! Agent state values and the structural comparison algorithms
//!
//! Diff entries and merge outcomes are plain data (tagged values with a
//! path, old and new), never callbacks threaded through the recursion.

pub mod diff;
pub mod merge;
pub mod merkle;

pub use diff::diff_values;
pub use merge::{three_way_merge, MergeResolution};
pub use merkle::MerkleNode;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngramError, Result};
use crate::types::{ChangeType, Hash};

/// Full agent state at a point in time.
///
/// `memory` and `world_state` are arbitrary JSON values; states are values
/// created by callers and never mutated after being committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub memory: Value,
    pub world_state: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl AgentState {
    pub fn new(memory: Value, world_state: Value) -> Self {
        AgentState {
            memory,
            world_state,
            timestamp: Utc::now(),
            cost: 0.0,
            metadata: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Flatten to a JSON value for hashing and storage.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Rebuild a state from its stored JSON form.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| EngramError::Serialization(e.to_string()))
    }
}

/// A single entry in a structural diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Path segments from the state root; array indices are decimal strings.
    pub path: Vec<String>,
    pub change_type: ChangeType,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// The structural diff between two committed states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDiff {
    pub base_hash: Hash,
    pub target_hash: Hash,
    pub entries: Vec<DiffEntry>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_roundtrip() {
        let state = AgentState::new(json!({"step": 1}), json!({"door": "open"})).with_cost(0.25);
        let value = state.to_value();
        let back = AgentState::from_value(value).unwrap();
        assert_eq!(back.memory, state.memory);
        assert_eq!(back.world_state, state.world_state);
        assert_eq!(back.cost, state.cost);
        assert_eq!(back.metadata, None);
    }

    #[test]
    fn test_state_metadata_optional() {
        let plain = AgentState::new(json!({}), json!({}));
        let value = plain.to_value();
        assert!(value.get("metadata").is_none());

        let tagged = AgentState::new(json!({}), json!({})).with_metadata(json!({"run": 7}));
        let value = tagged.to_value();
        assert_eq!(value["metadata"], json!({"run": 7}));
    }
}
