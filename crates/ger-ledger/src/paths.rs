// SPDX-License-Identifier: MIT OR Apache-2.0
//! Filename safety for ledger path components.

const MAX_COMPONENT_LEN: usize = 120;

/// Restrict a path component to `[A-Za-z0-9._-]`, collapsing every
/// offending character to `_` and truncating to 120 bytes.
///
/// Deterministic: the same input always maps to the same component, so
/// fingerprints and execution ids remain stable file keys.
#[must_use]
pub fn safe_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(MAX_COMPONENT_LEN);
    if out.is_empty() {
        out.push('_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_safe_characters_through() {
        assert_eq!(safe_component("abc-DEF_0.9"), "abc-DEF_0.9");
    }

    #[test]
    fn collapses_unsafe_characters() {
        assert_eq!(safe_component("a/b\\c:d e"), "a_b_c_d_e");
        assert_eq!(safe_component("exec#1@ops"), "exec_1_ops");
    }

    #[test]
    fn truncates_to_limit() {
        let long = "x".repeat(200);
        assert_eq!(safe_component(&long).len(), 120);
    }

    #[test]
    fn empty_input_yields_placeholder() {
        assert_eq!(safe_component(""), "_");
    }

    #[test]
    fn deterministic() {
        assert_eq!(safe_component("π/2"), safe_component("π/2"));
    }
}
