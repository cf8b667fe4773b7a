// SPDX-License-Identifier: MIT OR Apache-2.0
//! Field-level redaction of prestate snapshots.

use serde_json::Value;

/// Key substrings (lowercase) whose values are masked at any depth.
const DENY_KEYS: &[&str] = &[
    "token",
    "secret",
    "password",
    "api_key",
    "authorization",
    "ssn",
];

const MASK: &str = "[REDACTED]";

/// Return a copy of `value` with every sensitive field masked.
///
/// A field is sensitive when its key, lowercased, contains any deny-list
/// substring. Masking replaces the whole value, object or scalar alike.
#[must_use]
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, inner) in map {
                let lowered = key.to_lowercase();
                if DENY_KEYS.iter().any(|deny| lowered.contains(deny)) {
                    out.insert(key.clone(), Value::String(MASK.to_string()));
                } else {
                    out.insert(key.clone(), redact(inner));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_top_level_keys() {
        let v = redact(&json!({"password": "hunter2", "title": "ok"}));
        assert_eq!(v, json!({"password": MASK, "title": "ok"}));
    }

    #[test]
    fn masks_nested_keys() {
        let v = redact(&json!({"auth": {"api_key": "sk-1", "user": "a"}}));
        assert_eq!(v["auth"]["api_key"], MASK);
        assert_eq!(v["auth"]["user"], "a");
    }

    #[test]
    fn masks_inside_arrays() {
        let v = redact(&json!([{"client_ssn": "123-45-6789"}, {"name": "x"}]));
        assert_eq!(v[0]["client_ssn"], MASK);
        assert_eq!(v[1]["name"], "x");
    }

    #[test]
    fn key_match_is_case_insensitive_substring() {
        let v = redact(&json!({"AccessToken": "t", "AUTHORIZATION": "Bearer x"}));
        assert_eq!(v["AccessToken"], MASK);
        assert_eq!(v["AUTHORIZATION"], MASK);
    }

    #[test]
    fn masks_structured_values_entirely() {
        let v = redact(&json!({"secrets": {"a": 1, "b": 2}}));
        assert_eq!(v["secrets"], MASK);
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(redact(&json!(42)), json!(42));
        assert_eq!(redact(&json!("plain")), json!("plain"));
        assert_eq!(redact(&json!(null)), json!(null));
    }
}
