// SPDX-License-Identifier: MIT OR Apache-2.0
//! Declarative guard predicates over prestate snapshots.

use ger_core::{Guard, GuardOp};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One failed predicate, reported back to the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GuardFailure {
    /// Dotted path of the failed guard.
    pub path: String,
    /// Operator of the failed guard.
    pub op: GuardOp,
    /// Expected value, if the op carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    /// Actual value found at the path (`null` when absent).
    pub actual: Value,
}

/// Walk a dotted path (`status.phase`, `items.0.id`) into a JSON value.
#[must_use]
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluate every guard against the snapshot; returns the failures.
///
/// An empty result means the write may proceed.
#[must_use]
pub fn evaluate_guards(guards: &[Guard], snapshot: &Value) -> Vec<GuardFailure> {
    guards
        .iter()
        .filter(|guard| !holds(guard, snapshot))
        .map(|guard| GuardFailure {
            path: guard.path.clone(),
            op: guard.op,
            expected: guard.value.clone(),
            actual: lookup_path(snapshot, &guard.path)
                .cloned()
                .unwrap_or(Value::Null),
        })
        .collect()
}

fn holds(guard: &Guard, snapshot: &Value) -> bool {
    let found = lookup_path(snapshot, &guard.path);
    match guard.op {
        GuardOp::Exists => found.is_some(),
        GuardOp::Absent => found.is_none(),
        GuardOp::Eq => found.is_some_and(|v| Some(v) == guard.value.as_ref()),
        GuardOp::Ne => found.is_some_and(|v| Some(v) != guard.value.as_ref()),
        GuardOp::In => found.is_some_and(|v| {
            guard
                .value
                .as_ref()
                .and_then(Value::as_array)
                .is_some_and(|arr| arr.contains(v))
        }),
        GuardOp::Lt | GuardOp::Le | GuardOp::Gt | GuardOp::Ge => {
            let (Some(actual), Some(expected)) = (
                found.and_then(Value::as_f64),
                guard.value.as_ref().and_then(Value::as_f64),
            ) else {
                // Numeric comparison against a non-number never holds.
                return false;
            };
            match guard.op {
                GuardOp::Lt => actual < expected,
                GuardOp::Le => actual <= expected,
                GuardOp::Gt => actual > expected,
                GuardOp::Ge => actual >= expected,
                _ => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard(path: &str, op: GuardOp, value: Option<Value>) -> Guard {
        Guard {
            path: path.into(),
            op,
            value,
        }
    }

    fn snapshot() -> Value {
        json!({
            "status": {"phase": "review", "revision": 7},
            "items": [{"id": "a"}, {"id": "b"}],
            "locked": false
        })
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let s = snapshot();
        assert_eq!(lookup_path(&s, "status.phase"), Some(&json!("review")));
        assert_eq!(lookup_path(&s, "items.1.id"), Some(&json!("b")));
        assert_eq!(lookup_path(&s, "status.missing"), None);
        assert_eq!(lookup_path(&s, "items.9.id"), None);
        assert_eq!(lookup_path(&s, "locked.deep"), None);
    }

    #[test]
    fn eq_and_ne() {
        let s = snapshot();
        assert!(
            evaluate_guards(
                &[guard("status.phase", GuardOp::Eq, Some(json!("review")))],
                &s
            )
            .is_empty()
        );
        let failures = evaluate_guards(
            &[guard("status.phase", GuardOp::Eq, Some(json!("final")))],
            &s,
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].actual, json!("review"));
        assert!(
            evaluate_guards(
                &[guard("status.phase", GuardOp::Ne, Some(json!("final")))],
                &s
            )
            .is_empty()
        );
    }

    #[test]
    fn numeric_comparisons() {
        let s = snapshot();
        assert!(
            evaluate_guards(&[guard("status.revision", GuardOp::Lt, Some(json!(10)))], &s)
                .is_empty()
        );
        assert!(
            evaluate_guards(&[guard("status.revision", GuardOp::Ge, Some(json!(7)))], &s)
                .is_empty()
        );
        assert_eq!(
            evaluate_guards(&[guard("status.revision", GuardOp::Gt, Some(json!(7)))], &s).len(),
            1
        );
    }

    #[test]
    fn numeric_op_on_non_number_fails() {
        let s = snapshot();
        let failures =
            evaluate_guards(&[guard("status.phase", GuardOp::Lt, Some(json!(1)))], &s);
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn exists_and_absent() {
        let s = snapshot();
        assert!(evaluate_guards(&[guard("locked", GuardOp::Exists, None)], &s).is_empty());
        assert!(evaluate_guards(&[guard("deleted", GuardOp::Absent, None)], &s).is_empty());
        assert_eq!(
            evaluate_guards(&[guard("deleted", GuardOp::Exists, None)], &s).len(),
            1
        );
    }

    #[test]
    fn in_membership() {
        let s = snapshot();
        assert!(
            evaluate_guards(
                &[guard(
                    "status.phase",
                    GuardOp::In,
                    Some(json!(["draft", "review"]))
                )],
                &s
            )
            .is_empty()
        );
        assert_eq!(
            evaluate_guards(
                &[guard("status.phase", GuardOp::In, Some(json!(["final"])))],
                &s
            )
            .len(),
            1
        );
        // Non-array expectation never holds.
        assert_eq!(
            evaluate_guards(
                &[guard("status.phase", GuardOp::In, Some(json!("review")))],
                &s
            )
            .len(),
            1
        );
    }

    #[test]
    fn multiple_guards_report_all_failures() {
        let s = snapshot();
        let failures = evaluate_guards(
            &[
                guard("status.phase", GuardOp::Eq, Some(json!("final"))),
                guard("locked", GuardOp::Eq, Some(json!(false))),
                guard("missing", GuardOp::Exists, None),
            ],
            &s,
        );
        assert_eq!(failures.len(), 2);
        let paths: Vec<_> = failures.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["status.phase", "missing"]);
    }
}
