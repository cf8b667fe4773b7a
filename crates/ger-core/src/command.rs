// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operator command parsing, normalization, and fingerprinting.
//!
//! A command is raw operator text, optionally prefixed with `@domain:`. The
//! fingerprint, the governance key, is the SHA-256 of the canonical JSON
//! of `{command, domain_id}` where `command` is the normalized body, so
//! re-normalizing never changes identity.

use crate::canonical::{ContractError, fingerprint_value};
use serde_json::json;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    raw: String,
    /// Domain extracted from an `@domain:` prefix, if present.
    pub domain_id: Option<String>,
    /// Command body after prefix extraction (trimmed, not yet normalized).
    pub body: String,
}

impl Command {
    /// Parse raw operator text.
    ///
    /// A leading `@domain:` prefix (domain restricted to
    /// `[A-Za-z0-9_-]`, non-empty) is split off; everything after the colon
    /// is the body.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(rest) = trimmed.strip_prefix('@')
            && let Some((domain, body)) = rest.split_once(':')
            && !domain.is_empty()
            && domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Self {
                raw: trimmed.to_string(),
                domain_id: Some(domain.to_string()),
                body: body.trim().to_string(),
            };
        }
        Self {
            raw: trimmed.to_string(),
            domain_id: None,
            body: trimmed.to_string(),
        }
    }

    /// The raw (trimmed) text as typed by the operator.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Canonical form of the body: whitespace runs collapsed to one space,
    /// one pair of matching outer quotes stripped.
    ///
    /// Normalization is idempotent.
    #[must_use]
    pub fn normalized(&self) -> String {
        normalize(&self.body)
    }

    /// Stable SHA-256 fingerprint over `{command, domain_id}`.
    ///
    /// Uses the normalized body, so `fingerprint(c) ==
    /// fingerprint(normalize(c))` for every command.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Json`] if serialization fails (it cannot for
    /// plain strings; the signature matches the rest of the hashing API).
    pub fn fingerprint(&self) -> Result<String, ContractError> {
        fingerprint_value(&json!({
            "command": self.normalized(),
            "domain_id": self.domain_id,
        }))
    }

    /// True when the body is a `/`-prefixed control command rather than a
    /// DSL command.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.body.starts_with('/')
    }
}

/// Collapse whitespace runs and strip one pair of matching outer quotes.
#[must_use]
pub fn normalize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let bytes = collapsed.as_bytes();
    if collapsed.len() >= 2 {
        let first = bytes[0];
        let last = bytes[collapsed.len() - 1];
        if first == last && (first == b'"' || first == b'\'') {
            return collapsed[1..collapsed.len() - 1].to_string();
        }
    }
    collapsed
}
