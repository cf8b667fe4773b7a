// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON serialization and SHA-256 hashing.
//!
//! The canonical form of a value is its `serde_json` string with object keys
//! sorted lexicographically and no insignificant whitespace. `serde_json`'s
//! `Value::Object` is backed by a `BTreeMap`, so round-tripping any
//! serializable value through [`serde_json::Value`] yields sorted keys and a
//! deterministic byte sequence. Array order is preserved.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Errors produced while canonicalizing or hashing contract values.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// The value could not be serialized to JSON.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce the canonical JSON string of any serializable value.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
///
/// # Examples
///
/// ```
/// use ger_core::stable_json;
/// use serde_json::json;
///
/// let a = stable_json(&json!({"b": 1, "a": 2})).unwrap();
/// let b = stable_json(&json!({"a": 2, "b": 1})).unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a, r#"{"a":2,"b":1}"#);
/// ```
pub fn stable_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Hex-encoded SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of the canonical JSON form of a value.
///
/// This is the content-addressable identity used for command fingerprints,
/// plan hashes, and prestate fingerprints.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn fingerprint_value<T: Serialize>(value: &T) -> Result<String, ContractError> {
    Ok(sha256_hex(stable_json(value)?.as_bytes()))
}

/// Derive the idempotency key for a step.
///
/// The key is the SHA-256 of `action|plan_hash|step_id|thread_id`. Two
/// executions of the same step in the same plan share a key, so retries
/// deduplicate at the adapter layer.
#[must_use]
pub fn derived_idempotency_key(
    action: &str,
    plan_hash: &str,
    step_id: &str,
    thread_id: &str,
) -> String {
    sha256_hex(format!("{action}|{plan_hash}|{step_id}|{thread_id}").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn stable_json_sorts_keys() {
        let s = stable_json(&json!({"zeta": 1, "alpha": {"y": 0, "x": 9}})).unwrap();
        assert_eq!(s, r#"{"alpha":{"x":9,"y":0},"zeta":1}"#);
    }

    #[test]
    fn stable_json_preserves_array_order() {
        let s = stable_json(&json!([3, 1, 2])).unwrap();
        assert_eq!(s, "[3,1,2]");
    }

    #[test]
    fn stable_json_no_trailing_zeros() {
        let s = stable_json(&json!({"n": 1.5, "m": 2.0})).unwrap();
        // serde_json prints floats minimally.
        assert_eq!(s, r#"{"m":2.0,"n":1.5}"#);
    }

    #[test]
    fn sha256_hex_known_vector() {
        // Empty-input SHA-256 is a fixed constant.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn fingerprint_is_key_order_independent() {
        let a = fingerprint_value(&json!({"a": 1, "b": 2})).unwrap();
        let b = fingerprint_value(&json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn derived_key_is_deterministic_and_distinct() {
        let k1 = derived_idempotency_key("notion.live.write", "h", "s1", "t");
        let k2 = derived_idempotency_key("notion.live.write", "h", "s1", "t");
        let k3 = derived_idempotency_key("notion.live.write", "h", "s2", "t");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.len(), 64);
    }

    proptest! {
        #[test]
        fn canonical_form_is_idempotent(keys in proptest::collection::btree_map("[a-z]{1,8}", 0i64..1000, 0..8)) {
            let v = serde_json::to_value(&keys).unwrap();
            let once = stable_json(&v).unwrap();
            let reparsed: serde_json::Value = serde_json::from_str(&once).unwrap();
            let twice = stable_json(&reparsed).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn fingerprint_is_stable_across_runs(s in "[ -~]{0,64}") {
            let v = serde_json::json!({ "command": s });
            prop_assert_eq!(fingerprint_value(&v).unwrap(), fingerprint_value(&v).unwrap());
        }
    }
}
