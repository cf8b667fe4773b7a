// SPDX-License-Identifier: MIT OR Apache-2.0
//! Policy evaluation.
//!
//! One ordered pass over the plan: engine freeze, daily budget, plan
//! budget, the autonomy-mode matrix, per-step role and hour gates, and the
//! requalification block. The first terminal denial wins; approval
//! requirements are aggregated across steps and emitted only when every
//! denial check passed.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Timelike, Utc};
use ger_core::{AutonomyMode, ExecutionPlan, RuntimeConfig, Step};
use ger_error::ReasonCode;
use ger_state::RequalState;
use tracing::debug;

/// Per-invocation inputs the engine cannot derive from the plan itself.
#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    /// Execution under evaluation.
    pub execution_id: &'a str,
    /// Normalized command text (for deny messages).
    pub command: &'a str,
    /// Domain extracted from the command, if any.
    pub domain_id: Option<&'a str>,
    /// Approved execution id presented at resume, if any.
    pub approved_execution_id: Option<&'a str>,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
    /// Execution receipts already emitted today (UTC) for this operator.
    pub runs_today: u32,
    /// Requalification state of the fingerprint.
    pub requal_state: RequalState,
    /// Autonomy mode after confidence downgrades.
    pub autonomy_effective: AutonomyMode,
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    /// Every check passed.
    Allow,
    /// Terminal denial.
    Deny {
        /// Stable denial code.
        code: ReasonCode,
        /// Human-readable explanation.
        reason: String,
        /// Step that triggered the denial, when step-scoped.
        step_id: Option<String>,
    },
    /// Execution must pause for operator approval.
    RequireApproval {
        /// `step` for a single step, `batch` otherwise.
        kind: String,
        /// Human-readable explanation.
        reason: String,
        /// Step ids that demand approval.
        scope: Vec<String>,
    },
}

/// The policy engine: plan-wide and per-step checks in a fixed order.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: RuntimeConfig,
}

impl PolicyEngine {
    /// Engine over the given runtime configuration.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Evaluate a plan. Checks run in the documented order; the first
    /// terminal denial short-circuits.
    #[must_use]
    pub fn evaluate(&self, plan: &ExecutionPlan, ctx: &PolicyContext<'_>) -> PolicyDecision {
        // 1. Engine freeze.
        if self.config.engine_frozen {
            return PolicyDecision::Deny {
                code: ReasonCode::PolicyEngineFrozen,
                reason: "engine is frozen; all execution denied".into(),
                step_id: None,
            };
        }

        // 2. Daily run budget (only meaningful when autonomy is on).
        if ctx.autonomy_effective != AutonomyMode::Off
            && ctx.runs_today >= self.config.max_runs_per_day
        {
            return PolicyDecision::Deny {
                code: ReasonCode::PolicyDailyBudget,
                reason: format!(
                    "daily budget exhausted: {} runs today, cap {}",
                    ctx.runs_today, self.config.max_runs_per_day
                ),
                step_id: None,
            };
        }

        // 3. Plan budget: summed step costs.
        let total_cost: f64 = plan.all_steps().filter_map(|s| s.cost).sum();
        if total_cost > self.config.plan_budget_units {
            return PolicyDecision::Deny {
                code: ReasonCode::PolicyPlanBudget,
                reason: format!(
                    "plan cost {total_cost} exceeds budget {}",
                    self.config.plan_budget_units
                ),
                step_id: None,
            };
        }

        // 4. Autonomy matrix: may deny outright or mark steps for approval.
        let mut approval_scope: Vec<String> = Vec::new();
        for step in plan.all_steps() {
            match self.matrix_outcome(step, ctx.autonomy_effective) {
                MatrixOutcome::Allowed => {}
                MatrixOutcome::NeedsApproval => approval_scope.push(step.step_id.clone()),
                MatrixOutcome::Denied(reason) => {
                    return PolicyDecision::Deny {
                        code: ReasonCode::PolicyAutonomyDeny,
                        reason,
                        step_id: Some(step.step_id.clone()),
                    };
                }
            }
        }

        // 5. Role gate.
        for step in plan.all_steps() {
            if let Some(role) = &step.required_role {
                let domain = ctx.domain_id.unwrap_or("*");
                if !self.config.operator_has_role(domain, role) {
                    return PolicyDecision::Deny {
                        code: ReasonCode::WorkflowPolicyRoleDeny,
                        reason: format!(
                            "step '{}' requires role '{role}' in domain '{domain}'",
                            step.step_id
                        ),
                        step_id: Some(step.step_id.clone()),
                    };
                }
            }
        }

        // 6. Hour gate.
        let hour = ctx.now.hour() as u8;
        for step in plan.all_steps() {
            if let Some(hours) = &step.hours_allowed
                && !hours.contains(&hour)
            {
                return PolicyDecision::Deny {
                    code: ReasonCode::WorkflowPolicyHourDeny,
                    reason: format!(
                        "step '{}' not allowed at hour {hour} UTC",
                        step.step_id
                    ),
                    step_id: Some(step.step_id.clone()),
                };
            }
        }

        // 7. Requalification block.
        if ctx.requal_state == RequalState::Suspended {
            return PolicyDecision::Deny {
                code: ReasonCode::RequalificationBlocked,
                reason: format!("fingerprint suspended; command '{}' blocked", ctx.command),
                step_id: None,
            };
        }

        // Approval gate: write-scoped steps always demand approval unless
        // the resume presented this execution's id.
        if !approval_scope.is_empty() && ctx.approved_execution_id != Some(ctx.execution_id) {
            approval_scope.sort();
            approval_scope.dedup();
            let kind = if approval_scope.len() > 1 {
                "batch"
            } else {
                "step"
            };
            debug!(
                execution_id = ctx.execution_id,
                steps = approval_scope.len(),
                "approval required"
            );
            return PolicyDecision::RequireApproval {
                kind: kind.into(),
                reason: format!(
                    "{} write-scoped step(s) require operator approval",
                    approval_scope.len()
                ),
                scope: approval_scope,
            };
        }

        PolicyDecision::Allow
    }

    fn matrix_outcome(&self, step: &Step, mode: AutonomyMode) -> MatrixOutcome {
        match mode {
            AutonomyMode::Off => MatrixOutcome::Denied(format!(
                "autonomy is OFF; step '{}' cannot run",
                step.step_id
            )),
            AutonomyMode::ReadOnly => {
                if step.read_only {
                    MatrixOutcome::Allowed
                } else {
                    MatrixOutcome::Denied(format!(
                        "read-only autonomy forbids mutating step '{}'",
                        step.step_id
                    ))
                }
            }
            AutonomyMode::ProposeOnly => {
                if step.read_only {
                    MatrixOutcome::Allowed
                } else {
                    // Proposing is exactly an approval envelope.
                    MatrixOutcome::NeedsApproval
                }
            }
            AutonomyMode::ApprovalGated | AutonomyMode::Full => {
                if step.is_write_scoped() {
                    MatrixOutcome::NeedsApproval
                } else {
                    MatrixOutcome::Allowed
                }
            }
        }
    }
}

enum MatrixOutcome {
    Allowed,
    NeedsApproval,
    Denied(String),
}
