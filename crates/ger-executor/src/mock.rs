// SPDX-License-Identifier: MIT OR Apache-2.0
//! A scriptable in-memory adapter.
//!
//! Responses queue up front-to-back; an exhausted queue answers with a
//! generic success. Every dispatched step id is recorded so tests can
//! assert exactly which effects ran.

use crate::adapter::{Adapter, AdapterError, AdapterResponse};
use async_trait::async_trait;
use ger_core::Step;
use std::collections::VecDeque;
use std::sync::Mutex;

enum ScriptEntry {
    Respond(AdapterResponse),
    Fail(String),
}

/// Scriptable adapter for tests.
#[derive(Default)]
pub struct MockAdapter {
    script: Mutex<VecDeque<ScriptEntry>>,
    calls: Mutex<Vec<String>>,
}

impl MockAdapter {
    /// Adapter that answers every call with a generic success.
    #[must_use]
    pub fn always_succeeding() -> Self {
        Self::default()
    }

    /// Queue an explicit response.
    pub fn push_response(&self, response: AdapterResponse) {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .push_back(ScriptEntry::Respond(response));
    }

    /// Queue an HTTP-status response.
    pub fn push_http(&self, status: u16) {
        self.push_response(AdapterResponse {
            http_status: Some(status),
            response: Some(serde_json::json!({"status": status})),
            ..Default::default()
        });
    }

    /// Queue a transport failure.
    pub fn push_failure(&self, detail: impl Into<String>) {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .push_back(ScriptEntry::Fail(detail.into()));
    }

    /// Step ids dispatched so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    /// Number of dispatches so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls mutex poisoned").len()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &[]
    }

    async fn execute(&self, step: &Step) -> Result<AdapterResponse, AdapterError> {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .push(step.step_id.clone());
        let entry = self
            .script
            .lock()
            .expect("script mutex poisoned")
            .pop_front();
        match entry {
            Some(ScriptEntry::Respond(response)) => Ok(response),
            Some(ScriptEntry::Fail(detail)) => Err(AdapterError::Transport(detail)),
            None => Ok(AdapterResponse {
                response: Some(serde_json::json!({"ok": true})),
                ..Default::default()
            }),
        }
    }
}
