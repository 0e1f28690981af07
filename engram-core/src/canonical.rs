//! Canonical JSON serialization and content-address digests
//!
//! Identical logical payloads must hash identically across runs, platforms
//! and language bindings, so the byte encoding is pinned here:
//!
//! - UTF-8, no insignificant whitespace
//! - object keys sorted lexicographically by Unicode code point
//! - arrays preserve order
//! - strings carry only the mandatory escapes
//! - `-0` normalizes to `0`; floats use shortest-round-trip form
//!
//! An object's digest is SHA-256 over its canonical bytes, nothing more;
//! this is the bit-exact contract shared with every language binding.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::Hash;

/// Serialize a JSON value to its canonical byte form.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    write_value(value, &mut buf);
    buf
}

fn write_value(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.extend_from_slice(b"null"),
        Value::Bool(true) => buf.extend_from_slice(b"true"),
        Value::Bool(false) => buf.extend_from_slice(b"false"),
        Value::Number(n) => write_number(n, buf),
        Value::String(s) => write_string(s, buf),
        Value::Array(arr) => {
            buf.push(b'[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_value(item, buf);
            }
            buf.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            buf.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_string(key, buf);
                buf.push(b':');
                write_value(&map[*key], buf);
            }
            buf.push(b'}');
        }
    }
}

fn write_number(n: &serde_json::Number, buf: &mut Vec<u8>) {
    if n.is_i64() || n.is_u64() {
        buf.extend_from_slice(n.to_string().as_bytes());
        return;
    }
    match n.as_f64() {
        // Negative zero is indistinguishable from zero at the logical level.
        Some(f) if f == 0.0 && f.is_sign_negative() => buf.push(b'0'),
        _ => buf.extend_from_slice(n.to_string().as_bytes()),
    }
}

fn write_string(s: &str, buf: &mut Vec<u8>) {
    // serde_json emits exactly the mandatory escape set.
    buf.extend_from_slice(
        serde_json::to_string(s)
            .unwrap_or_else(|_| String::from("\"\""))
            .as_bytes(),
    );
}

/// SHA-256 over raw bytes, as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the content address of an object payload.
pub fn object_digest(content: &[u8]) -> Hash {
    Hash(sha256_hex(content))
}

/// Canonical-serialize a value and compute its content address.
pub fn value_digest(value: &Value) -> Hash {
    object_digest(&canonical_json(value))
}
