// SPDX-License-Identifier: MIT OR Apache-2.0
//! The adapter seam: pluggable effectors for step actions.

use async_trait::async_trait;
use ger_core::Step;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Errors surfaced by adapters.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The step is missing a field this adapter requires.
    #[error("step '{step_id}' missing required field '{field}'")]
    MissingField {
        /// Offending step.
        step_id: String,
        /// Missing field name.
        field: String,
    },
    /// Transport or process failure.
    #[error("adapter transport failed: {0}")]
    Transport(String),
    /// No adapter is registered for the action.
    #[error("no adapter registered for action '{action}'")]
    Unregistered {
        /// The unhandled action.
        action: String,
    },
}

/// Normalized adapter result.
#[derive(Debug, Clone, Default)]
pub struct AdapterResponse {
    /// HTTP status for HTTP-backed adapters.
    pub http_status: Option<u16>,
    /// Exit code for process-backed adapters.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: Option<String>,
    /// Captured stderr.
    pub stderr: Option<String>,
    /// Structured response body.
    pub response: Option<serde_json::Value>,
}

impl AdapterResponse {
    /// Success means a 2xx status, a zero exit code, or, when neither is
    /// reported, any response at all.
    #[must_use]
    pub fn is_success(&self) -> bool {
        if let Some(status) = self.http_status {
            return (200..300).contains(&status);
        }
        if let Some(code) = self.exit_code {
            return code == 0;
        }
        self.response.is_some()
    }

    /// Stable digest input: the structured response if present, else
    /// stdout, else the status markers.
    #[must_use]
    pub fn digest_payload(&self) -> serde_json::Value {
        if let Some(response) = &self.response {
            return response.clone();
        }
        if let Some(stdout) = &self.stdout {
            return serde_json::Value::String(stdout.clone());
        }
        serde_json::json!({
            "http_status": self.http_status,
            "exit_code": self.exit_code,
        })
    }
}

/// An effector for one or more step actions.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Adapter name for logs and artifacts.
    fn name(&self) -> &'static str;

    /// Step fields this adapter requires to be present.
    fn required_fields(&self) -> &'static [&'static str];

    /// Perform the step's effect.
    async fn execute(&self, step: &Step) -> Result<AdapterResponse, AdapterError>;
}

/// Action-string → adapter dispatch table.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for an action string, replacing any previous
    /// registration.
    pub fn register(&mut self, action: impl Into<String>, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(action.into(), adapter);
    }

    /// Look up the adapter for an action.
    #[must_use]
    pub fn get(&self, action: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(action).cloned()
    }

    /// Registered action strings, sorted.
    #[must_use]
    pub fn actions(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}
