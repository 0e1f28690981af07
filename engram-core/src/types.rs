//! Core identifier and enumeration types

use serde::{Deserialize, Serialize};
use std::fmt;

/// A SHA-256 digest represented as a 64-character lowercase hex string.
///
/// Equality is byte equality; a hash uniquely identifies one immutable
/// object within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub String);

impl Hash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex characters, for display.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Hash {
    fn from(s: String) -> Self {
        Hash(s)
    }
}

impl From<&str> for Hash {
    fn from(s: &str) -> Self {
        Hash(s.to_string())
    }
}

/// Kind of content-addressed object held by a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Blob,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Commit => "commit",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of agent action that produced a commit.
///
/// A closed enumeration; the wire form is the snake_case string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ToolCall,
    LlmResponse,
    UserInput,
    SystemEvent,
    Retry,
    Rollback,
    Merge,
    Checkpoint,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ToolCall => "tool_call",
            ActionType::LlmResponse => "llm_response",
            ActionType::UserInput => "user_input",
            ActionType::SystemEvent => "system_event",
            ActionType::Retry => "retry",
            ActionType::Rollback => "rollback",
            ActionType::Merge => "merge",
            ActionType::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy for merging one branch into another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep the current branch state verbatim.
    Ours,
    /// Take the incoming branch state verbatim.
    Theirs,
    /// Recursive structural merge against the common ancestor.
    ThreeWay,
}

/// Classification of a single diff entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Removed,
    Changed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_short() {
        let h = Hash::from("abcdef0123456789");
        assert_eq!(h.short(), "abcdef01");
    }

    #[test]
    fn test_hash_equality_is_byte_equality() {
        assert_eq!(Hash::from("abc"), Hash::from("abc".to_string()));
        assert_ne!(Hash::from("abc"), Hash::from("abd"));
    }

    #[test]
    fn test_action_type_wire_form() {
        let json = serde_json::to_string(&ActionType::ToolCall).unwrap();
        assert_eq!(json, "\"tool_call\"");
        let parsed: ActionType = serde_json::from_str("\"rollback\"").unwrap();
        assert_eq!(parsed, ActionType::Rollback);
    }

    #[test]
    fn test_object_kind_display() {
        assert_eq!(ObjectKind::Blob.to_string(), "blob");
        assert_eq!(ObjectKind::Commit.to_string(), "commit");
    }
}
