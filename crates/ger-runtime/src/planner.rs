// SPDX-License-Identifier: MIT OR Apache-2.0
//! The planner seam and the template-backed production planner.
//!
//! The planner is a pluggable collaborator: it turns operator text into a
//! structured output: a request for more input, a validated command, or a
//! full execution plan. The production implementation materializes
//! pre-authored templates; anything smarter plugs in behind the same
//! trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ger_core::{Command, ExecutionPlan};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

/// Planner failure.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    /// Output did not match the expected schema. One retry is permitted
    /// in lenient mode.
    #[error("planner output invalid: {0}")]
    Parse(String),
    /// The planner itself could not run.
    #[error("planner unavailable: {0}")]
    Unavailable(String),
}

/// Structured planner output.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// The planner needs more operator input.
    NeedInput {
        /// What the operator should provide.
        question: String,
    },
    /// The planner normalized the command; plan again with this text.
    ValidatedCommand {
        /// The validated command text.
        command: String,
    },
    /// A full plan, ready for governance.
    Plan(Box<ExecutionPlan>),
}

/// Turns a command into a structured output.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce a plan (or a request for input) for the command.
    async fn plan(
        &self,
        command: &Command,
        now: DateTime<Utc>,
    ) -> Result<PlannerOutput, PlannerError>;
}

/// Template-backed planner.
///
/// The command body selects a template by its first word; the remainder is
/// a JSON object whose entries replace `${key}` placeholders in the
/// template text. A command that is raw JSON is accepted as a verbatim
/// plan when the operator enabled the planner override.
#[derive(Debug, Clone)]
pub struct TemplatePlanner {
    templates: TemplateRegistry,
    allow_plan_override: bool,
}

impl TemplatePlanner {
    /// Planner over the given template directory.
    #[must_use]
    pub fn new(templates: TemplateRegistry, allow_plan_override: bool) -> Self {
        Self {
            templates,
            allow_plan_override,
        }
    }
}

#[async_trait]
impl Planner for TemplatePlanner {
    async fn plan(
        &self,
        command: &Command,
        now: DateTime<Utc>,
    ) -> Result<PlannerOutput, PlannerError> {
        let body = command.normalized();
        if body.is_empty() {
            return Ok(PlannerOutput::NeedInput {
                question: "empty command; name a template and its parameters".into(),
            });
        }

        // Operator-supplied verbatim plan.
        if body.starts_with('{') {
            if !self.allow_plan_override {
                return Ok(PlannerOutput::NeedInput {
                    question: "raw plans are disabled; set ALLOW_PLANNER_OVERRIDE=1".into(),
                });
            }
            let plan: ExecutionPlan =
                serde_json::from_str(&body).map_err(|e| PlannerError::Parse(e.to_string()))?;
            return Ok(PlannerOutput::Plan(Box::new(plan)));
        }

        let (name, rest) = match body.split_once(' ') {
            Some((name, rest)) => (name, Some(rest)),
            None => (body.as_str(), None),
        };
        match self.templates.materialize(name, rest, now)? {
            Some(plan) => Ok(PlannerOutput::Plan(Box::new(plan))),
            None => Ok(PlannerOutput::NeedInput {
                question: format!("no template named '{name}'"),
            }),
        }
    }
}

/// Directory of pre-authored plan templates (`<name>.json`).
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    dir: PathBuf,
}

impl TemplateRegistry {
    /// Registry rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Template names, sorted.
    ///
    /// # Errors
    ///
    /// Propagates directory read failures (a missing directory is empty).
    pub fn list(&self) -> Result<Vec<String>, PlannerError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PlannerError::Unavailable(e.to_string())),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PlannerError::Unavailable(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Raw template text, or `None` when absent.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    pub fn show(&self, name: &str) -> Result<Option<String>, PlannerError> {
        let path = self.dir.join(format!("{name}.json"));
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PlannerError::Unavailable(e.to_string())),
        }
    }

    /// Materialize a template: substitute `${key}` placeholders from the
    /// JSON params, parse, and assign a fresh execution id when the
    /// template leaves it empty.
    ///
    /// # Errors
    ///
    /// [`PlannerError::Parse`] on malformed params or template.
    pub fn materialize(
        &self,
        name: &str,
        params_json: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionPlan>, PlannerError> {
        let Some(mut text) = self.show(name)? else {
            return Ok(None);
        };
        let params: BTreeMap<String, serde_json::Value> = match params_json {
            Some(raw) => {
                serde_json::from_str(raw).map_err(|e| PlannerError::Parse(e.to_string()))?
            }
            None => BTreeMap::new(),
        };
        for (key, value) in &params {
            let replacement = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text = text.replace(&format!("${{{key}}}"), &replacement);
        }
        let mut plan: ExecutionPlan =
            serde_json::from_str(&text).map_err(|e| PlannerError::Parse(e.to_string()))?;
        if plan.execution_id.is_empty() {
            plan.execution_id = format!("exec-{}", now.timestamp_millis());
        }
        if plan.thread_id.is_empty() {
            plan.thread_id = format!("thread-{name}");
        }
        debug!(template = name, execution_id = %plan.execution_id, "template materialized");
        Ok(Some(plan))
    }
}
