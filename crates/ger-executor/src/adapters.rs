// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in adapters: live document store, shell, webhook.

use crate::adapter::{Adapter, AdapterError, AdapterResponse};
use async_trait::async_trait;
use ger_core::Step;
use tracing::debug;

/// HTTP adapter for `notion.live.write` / `notion.live.read`.
///
/// The target URL is the step's `url`, or the adapter base joined with the
/// step's `notion_path`. Reads always GET; writes use the step's `method`
/// (default `POST`).
#[derive(Debug, Clone)]
pub struct NotionLiveAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl NotionLiveAdapter {
    /// Adapter rooted at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn target_url(&self, step: &Step) -> Result<String, AdapterError> {
        if let Some(url) = &step.url {
            return Ok(url.clone());
        }
        if let Some(path) = &step.notion_path {
            return Ok(format!("{}{path}", self.base_url));
        }
        Err(AdapterError::MissingField {
            step_id: step.step_id.clone(),
            field: "url|notion_path".into(),
        })
    }
}

#[async_trait]
impl Adapter for NotionLiveAdapter {
    fn name(&self) -> &'static str {
        "notion.live"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["url|notion_path"]
    }

    async fn execute(&self, step: &Step) -> Result<AdapterResponse, AdapterError> {
        let url = self.target_url(step)?;
        let request = if step.read_only || step.action == "notion.live.read" {
            self.client.get(&url)
        } else {
            let method = step.method.as_deref().unwrap_or("POST");
            let method: reqwest::Method = method
                .parse()
                .map_err(|_| AdapterError::Transport(format!("bad method '{method}'")))?;
            let mut req = self.client.request(method, &url);
            if let Some(payload) = &step.payload {
                req = req.json(payload);
            }
            req
        };
        debug!(step_id = %step.step_id, url, "dispatching live request");
        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))?;
        let http_status = response.status().as_u16();
        let body: Option<serde_json::Value> = response.json().await.ok();
        Ok(AdapterResponse {
            http_status: Some(http_status),
            response: body,
            ..Default::default()
        })
    }
}

/// Shell adapter for `shell.run`: the payload string runs under `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunAdapter;

#[async_trait]
impl Adapter for ShellRunAdapter {
    fn name(&self) -> &'static str {
        "shell.run"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["payload"]
    }

    async fn execute(&self, step: &Step) -> Result<AdapterResponse, AdapterError> {
        let command = step
            .payload
            .as_ref()
            .and_then(|p| p.as_str())
            .ok_or_else(|| AdapterError::MissingField {
                step_id: step.step_id.clone(),
                field: "payload".into(),
            })?;
        debug!(step_id = %step.step_id, command, "running shell step");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))?;
        Ok(AdapterResponse {
            exit_code: output.status.code(),
            stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
            ..Default::default()
        })
    }
}

/// Webhook adapter for `webhook.emit`: POST the payload to the step URL.
#[derive(Debug, Clone)]
pub struct WebhookEmitAdapter {
    client: reqwest::Client,
}

impl WebhookEmitAdapter {
    /// Adapter with a fresh HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookEmitAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for WebhookEmitAdapter {
    fn name(&self) -> &'static str {
        "webhook.emit"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["url"]
    }

    async fn execute(&self, step: &Step) -> Result<AdapterResponse, AdapterError> {
        let url = step.url.as_ref().ok_or_else(|| AdapterError::MissingField {
            step_id: step.step_id.clone(),
            field: "url".into(),
        })?;
        let mut request = self.client.post(url);
        if let Some(payload) = &step.payload {
            request = request.json(payload);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))?;
        Ok(AdapterResponse {
            http_status: Some(response.status().as_u16()),
            ..Default::default()
        })
    }
}
