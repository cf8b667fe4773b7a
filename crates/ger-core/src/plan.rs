// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution plans, phases, steps, and guard predicates.
//!
//! A plan is either a flat ordered sequence of steps (legacy) or an ordered
//! sequence of phases, each with its own steps. The plan hash (SHA-256 of
//! the canonical JSON) is the key that approval resume and idempotency
//! derivation are anchored to.

use crate::canonical::{ContractError, fingerprint_value};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A structured execution plan produced by the planner or a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionPlan {
    /// Operator-scoped unique identifier for this execution.
    pub execution_id: String,
    /// Conversation/workflow thread the execution belongs to.
    pub thread_id: String,
    /// Human-readable goal statement.
    pub goal: String,
    /// When set, adapters record what they would do without side effects.
    #[serde(default)]
    pub dry_run: bool,
    /// Pinned agent versions (agent name → version).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agent_versions: BTreeMap<String, String>,
    /// Capabilities the plan requires the registry to resolve.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_capabilities: BTreeSet<String>,
    /// Flat step sequence (legacy mode). Mutually exclusive with `phases`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    /// Phased step sequence. Mutually exclusive with `steps`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<Phase>,
}

impl ExecutionPlan {
    /// True when the plan uses phases rather than a flat step list.
    #[must_use]
    pub fn is_phased(&self) -> bool {
        !self.phases.is_empty()
    }

    /// All steps in execution order, regardless of mode.
    pub fn all_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .chain(self.phases.iter().flat_map(|p| p.steps.iter()))
    }

    /// Mutable access to all steps in execution order.
    pub fn all_steps_mut(&mut self) -> impl Iterator<Item = &mut Step> {
        self.steps
            .iter_mut()
            .chain(self.phases.iter_mut().flat_map(|p| p.steps.iter_mut()))
    }

    /// Steps that mutate remote state and are approval-scoped.
    pub fn write_scoped_steps(&self) -> impl Iterator<Item = &Step> {
        self.all_steps().filter(|s| s.is_write_scoped())
    }

    /// Total number of steps across all phases.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.all_steps().count()
    }

    /// SHA-256 of the canonical plan JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Json`] if the plan cannot be serialized.
    pub fn plan_hash(&self) -> Result<String, ContractError> {
        fingerprint_value(self)
    }
}

/// One phase of a phased plan. A failed step halts its phase and every
/// later phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Phase {
    /// Phase identifier, unique within the plan.
    pub phase_id: String,
    /// Ordered steps in this phase.
    pub steps: Vec<Step>,
}

/// Adapter dispatch family for a step, derived from its `action` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Mutating write against the live document store.
    NotionLiveWrite,
    /// Read against the live document store.
    NotionLiveRead,
    /// Local shell invocation.
    ShellRun,
    /// Outbound webhook emission.
    WebhookEmit,
    /// Anything else; dispatched by the open adapter registry.
    Other,
}

/// Retry budget for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RetrySpec {
    /// Total attempts including the first (1 = no retry).
    pub max_attempts: u32,
    /// Sleep between attempts, milliseconds.
    pub backoff_ms: u64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }
}

/// One unit of work inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    /// Step identifier, unique within the plan.
    pub step_id: String,
    /// Adapter action, e.g. `notion.live.write` or `shell.run`.
    pub action: String,
    /// Adapter override; defaults to the action's family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    /// HTTP method for HTTP-backed adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Target URL for HTTP-backed adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Request payload for HTTP-backed adapters, command line for shell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// True when the step cannot mutate remote state.
    #[serde(default)]
    pub read_only: bool,
    /// True when the step falls under the approval gate.
    #[serde(default)]
    pub approval_scoped: bool,
    /// Declarative predicates evaluated against the prestate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<Guard>,
    /// Logical resource the step touches (for audit grouping).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Document path the step writes to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notion_path: Option<String>,
    /// Document path read for the prestate snapshot; falls back to
    /// `notion_path` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notion_path_prestate: Option<String>,
    /// Explicit idempotency key; the derived key is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Redacted snapshot captured before the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prestate_snapshot: Option<serde_json::Value>,
    /// Fingerprint of the canonical snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prestate_fingerprint: Option<String>,
    /// Expected response shape (advisory; recorded, not enforced).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expects: Option<serde_json::Value>,
    /// Role the operator must hold in the command's domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
    /// UTC hours (0–23) during which the step may run; absent = always.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours_allowed: Option<Vec<u8>>,
    /// Budget cost of the step, in plan-budget units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Retry budget; one attempt when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    /// Per-step timeout override, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Stamped by the approval manager when the step is approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    /// Open attribute bag for adapter-specific fields.
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Step {
    /// Minimal step with the given id and action; everything else default.
    #[must_use]
    pub fn new(step_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            action: action.into(),
            adapter: None,
            method: None,
            url: None,
            payload: None,
            read_only: false,
            approval_scoped: false,
            guards: Vec::new(),
            resource: None,
            notion_path: None,
            notion_path_prestate: None,
            idempotency_key: None,
            prestate_snapshot: None,
            prestate_fingerprint: None,
            expects: None,
            required_role: None,
            hours_allowed: None,
            cost: None,
            retry: None,
            timeout_ms: None,
            approved_at: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Dispatch family derived from the action string.
    #[must_use]
    pub fn kind(&self) -> StepKind {
        match self.action.as_str() {
            "notion.live.write" => StepKind::NotionLiveWrite,
            "notion.live.read" => StepKind::NotionLiveRead,
            "shell.run" => StepKind::ShellRun,
            "webhook.emit" => StepKind::WebhookEmit,
            _ => StepKind::Other,
        }
    }

    /// Write-scoped: mutates remote state and falls under the approval
    /// gate. These steps require prestate, idempotency key, and policy
    /// ALLOW before executing.
    #[must_use]
    pub fn is_write_scoped(&self) -> bool {
        !self.read_only && self.approval_scoped
    }

    /// Path used for prestate capture.
    #[must_use]
    pub fn prestate_path(&self) -> Option<&str> {
        self.notion_path_prestate
            .as_deref()
            .or(self.notion_path.as_deref())
    }

    /// Retry budget, defaulting to a single attempt.
    #[must_use]
    pub fn retry_spec(&self) -> RetrySpec {
        self.retry.unwrap_or_default()
    }
}

/// Comparison operator for a guard predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GuardOp {
    /// Value at path equals the expected value.
    Eq,
    /// Value at path differs from the expected value.
    Ne,
    /// Numeric less-than.
    Lt,
    /// Numeric less-or-equal.
    Le,
    /// Numeric greater-than.
    Gt,
    /// Numeric greater-or-equal.
    Ge,
    /// Path resolves to a value.
    Exists,
    /// Path resolves to nothing.
    Absent,
    /// Value at path is a member of the expected array.
    In,
}

/// Declarative predicate over the prestate snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Guard {
    /// Dotted path into the snapshot, e.g. `status.phase`.
    pub path: String,
    /// Comparison operator.
    pub op: GuardOp,
    /// Expected value; required by every op except `exists`/`absent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_step(id: &str) -> Step {
        let mut s = Step::new(id, "notion.live.write");
        s.approval_scoped = true;
        s.notion_path = Some(format!("/docs/{id}"));
        s
    }

    fn sample_plan() -> ExecutionPlan {
        ExecutionPlan {
            execution_id: "exec-1".into(),
            thread_id: "thread-1".into(),
            goal: "update docket".into(),
            dry_run: false,
            agent_versions: BTreeMap::from([("core-agent".into(), "1.2.0".into())]),
            required_capabilities: BTreeSet::from(["notion.write".to_string()]),
            steps: vec![write_step("s1"), {
                let mut s = Step::new("s2", "notion.live.read");
                s.read_only = true;
                s
            }],
            phases: vec![],
        }
    }

    #[test]
    fn plan_hash_is_deterministic() {
        let plan = sample_plan();
        assert_eq!(plan.plan_hash().unwrap(), plan.plan_hash().unwrap());
    }

    #[test]
    fn plan_hash_changes_with_content() {
        let a = sample_plan();
        let mut b = sample_plan();
        b.goal = "different goal".into();
        assert_ne!(a.plan_hash().unwrap(), b.plan_hash().unwrap());
    }

    #[test]
    fn write_scoped_requires_both_flags() {
        let mut s = Step::new("s", "notion.live.write");
        assert!(!s.is_write_scoped());
        s.approval_scoped = true;
        assert!(s.is_write_scoped());
        s.read_only = true;
        assert!(!s.is_write_scoped());
    }

    #[test]
    fn step_kind_dispatch() {
        assert_eq!(
            Step::new("s", "notion.live.write").kind(),
            StepKind::NotionLiveWrite
        );
        assert_eq!(Step::new("s", "shell.run").kind(), StepKind::ShellRun);
        assert_eq!(Step::new("s", "webhook.emit").kind(), StepKind::WebhookEmit);
        assert_eq!(Step::new("s", "custom.thing").kind(), StepKind::Other);
    }

    #[test]
    fn prestate_path_prefers_dedicated_field() {
        let mut s = write_step("s1");
        assert_eq!(s.prestate_path(), Some("/docs/s1"));
        s.notion_path_prestate = Some("/docs/s1/meta".into());
        assert_eq!(s.prestate_path(), Some("/docs/s1/meta"));
    }

    #[test]
    fn phased_plan_iterates_in_order() {
        let plan = ExecutionPlan {
            execution_id: "e".into(),
            thread_id: "t".into(),
            goal: "g".into(),
            dry_run: false,
            agent_versions: BTreeMap::new(),
            required_capabilities: BTreeSet::new(),
            steps: vec![],
            phases: vec![
                Phase {
                    phase_id: "p1".into(),
                    steps: vec![Step::new("a", "shell.run")],
                },
                Phase {
                    phase_id: "p2".into(),
                    steps: vec![Step::new("b", "shell.run"), Step::new("c", "shell.run")],
                },
            ],
        };
        assert!(plan.is_phased());
        let ids: Vec<_> = plan.all_steps().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(plan.total_steps(), 3);
    }

    #[test]
    fn unknown_fields_land_in_attributes() {
        let v = json!({
            "step_id": "s1",
            "action": "notion.live.write",
            "vendor_hint": {"retries": 2}
        });
        let step: Step = serde_json::from_value(v).unwrap();
        assert_eq!(step.attributes["vendor_hint"], json!({"retries": 2}));
        // And they survive re-serialization (part of the plan hash).
        let back = serde_json::to_value(&step).unwrap();
        assert_eq!(back["vendor_hint"], json!({"retries": 2}));
    }

    #[test]
    fn serde_roundtrip_preserves_plan() {
        let plan = sample_plan();
        let json = serde_json::to_string(&plan).unwrap();
        let back: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.plan_hash().unwrap(), plan.plan_hash().unwrap());
    }

    #[test]
    fn retry_defaults_to_single_attempt() {
        let s = Step::new("s", "shell.run");
        assert_eq!(s.retry_spec(), RetrySpec::default());
        assert_eq!(s.retry_spec().max_attempts, 1);
    }
}
