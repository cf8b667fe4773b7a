// SPDX-License-Identifier: MIT OR Apache-2.0
//! Prestate capture and guard evaluation.
//!
//! Before a write-scoped step is eligible for policy evaluation, the
//! runtime reads the declared resource through a GET-only fetcher, redacts
//! sensitive fields, and fingerprints the canonical snapshot. Guards are
//! declarative predicates over that snapshot; a non-empty failure list is
//! terminal.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod guards;
mod redact;

pub use guards::{GuardFailure, evaluate_guards, lookup_path};
pub use redact::redact;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ger_core::{Step, fingerprint_value};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors from prestate capture.
#[derive(Debug, thiserror::Error)]
pub enum PrestateError {
    /// The step declares no path to snapshot.
    #[error("step '{step_id}' has no prestate path")]
    MissingPath {
        /// Offending step.
        step_id: String,
    },
    /// The fetch failed.
    #[error("prestate fetch for '{path}' failed: {reason}")]
    Fetch {
        /// Path that was requested.
        path: String,
        /// Failure detail.
        reason: String,
    },
    /// The snapshot could not be fingerprinted.
    #[error(transparent)]
    Contract(#[from] ger_core::ContractError),
}

/// GET-only read against the remote resource store.
#[async_trait]
pub trait PrestateFetcher: Send + Sync {
    /// Fetch the current state of the resource at `path`.
    async fn fetch(&self, path: &str) -> Result<serde_json::Value, PrestateError>;
}

/// Production fetcher: HTTP GET against a base URL.
#[derive(Debug, Clone)]
pub struct HttpPrestateFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPrestateFetcher {
    /// Fetcher rooted at `base_url`; `path` is appended verbatim.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PrestateFetcher for HttpPrestateFetcher {
    async fn fetch(&self, path: &str) -> Result<serde_json::Value, PrestateError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PrestateError::Fetch {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(PrestateError::Fetch {
                path: path.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }
        response.json().await.map_err(|e| PrestateError::Fetch {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

/// A captured, redacted prestate snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CapturedPrestate {
    /// Step the snapshot belongs to.
    pub step_id: String,
    /// Resource path that was read.
    pub path: String,
    /// Capture instant.
    pub captured_at: DateTime<Utc>,
    /// Redacted snapshot.
    pub snapshot: serde_json::Value,
    /// Fingerprint of the canonical snapshot.
    pub fingerprint: String,
}

/// Capture the prestate for one write-scoped step: fetch, redact,
/// fingerprint.
///
/// # Errors
///
/// Fails when the step has no path, the fetch fails, or the snapshot
/// cannot be fingerprinted.
pub async fn capture(
    fetcher: &dyn PrestateFetcher,
    step: &Step,
    now: DateTime<Utc>,
) -> Result<CapturedPrestate, PrestateError> {
    let path = step
        .prestate_path()
        .ok_or_else(|| PrestateError::MissingPath {
            step_id: step.step_id.clone(),
        })?;
    let raw = fetcher.fetch(path).await?;
    let snapshot = redact(&raw);
    let fingerprint = fingerprint_value(&snapshot)?;
    debug!(step_id = %step.step_id, path, fingerprint = %fingerprint, "prestate captured");
    Ok(CapturedPrestate {
        step_id: step.step_id.clone(),
        path: path.to_string(),
        captured_at: now,
        snapshot,
        fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticFetcher(serde_json::Value);

    #[async_trait]
    impl PrestateFetcher for StaticFetcher {
        async fn fetch(&self, _path: &str) -> Result<serde_json::Value, PrestateError> {
            Ok(self.0.clone())
        }
    }

    fn write_step(path: &str) -> Step {
        let mut s = Step::new("s1", "notion.live.write");
        s.approval_scoped = true;
        s.notion_path = Some(path.to_string());
        s
    }

    #[tokio::test]
    async fn capture_redacts_and_fingerprints() {
        let fetcher = StaticFetcher(json!({"title": "Docket", "api_key": "sk-live-123"}));
        let step = write_step("/docs/1");
        let now = Utc::now();
        let captured = capture(&fetcher, &step, now).await.unwrap();
        assert_eq!(captured.snapshot["title"], "Docket");
        assert_eq!(captured.snapshot["api_key"], "[REDACTED]");
        assert_eq!(captured.fingerprint.len(), 64);
        // Fingerprint covers the redacted form, so it is stable across
        // secret rotation.
        let rotated = StaticFetcher(json!({"title": "Docket", "api_key": "sk-live-456"}));
        let again = capture(&rotated, &step, now).await.unwrap();
        assert_eq!(captured.fingerprint, again.fingerprint);
    }

    #[tokio::test]
    async fn capture_prefers_prestate_path() {
        let fetcher = StaticFetcher(json!({}));
        let mut step = write_step("/docs/1");
        step.notion_path_prestate = Some("/docs/1/meta".into());
        let captured = capture(&fetcher, &step, Utc::now()).await.unwrap();
        assert_eq!(captured.path, "/docs/1/meta");
    }

    #[tokio::test]
    async fn capture_without_path_fails() {
        let fetcher = StaticFetcher(json!({}));
        let step = Step::new("s1", "notion.live.write");
        let err = capture(&fetcher, &step, Utc::now()).await.unwrap_err();
        assert!(matches!(err, PrestateError::MissingPath { .. }));
    }
}
