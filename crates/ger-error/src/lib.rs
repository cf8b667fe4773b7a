// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable reason codes for the governed execution runtime.
//!
//! Every terminal governance outcome carries a [`ReasonCode`], a
//! machine-readable, stable string tag that tests and downstream audit
//! tooling can match on. Codes never change across patch releases.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ReasonCategory
// ---------------------------------------------------------------------------

/// Broad family that a [`ReasonCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    /// Policy evaluation denials.
    Policy,
    /// Governor throttling (rate limit / circuit breaker).
    Throttle,
    /// Approval gating and resume-time drift.
    Approval,
    /// Step execution failures.
    Execution,
    /// Planner output problems.
    Planner,
    /// Idempotency short-circuits (success semantics).
    Idempotency,
    /// Requalification lifecycle transitions.
    Requalification,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ReasonCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Policy => "policy",
            Self::Throttle => "throttle",
            Self::Approval => "approval",
            Self::Execution => "execution",
            Self::Planner => "planner",
            Self::Idempotency => "idempotency",
            Self::Requalification => "requalification",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ReasonCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable reason code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string. The string
/// forms are part of the on-disk receipt contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    // -- Policy --
    /// The engine-wide freeze flag is set; nothing executes.
    PolicyEngineFrozen,
    /// The daily run budget for the operator is exhausted.
    PolicyDailyBudget,
    /// The summed per-step costs exceed the plan budget.
    PolicyPlanBudget,
    /// A required capability has no provider in the registry.
    PolicyCapabilityUnresolved,
    /// A required capability has two or more providers.
    PolicyCapabilityAmbiguous,
    /// Pinned agent versions disagree with the registry.
    PolicyAgentVersionMismatch,
    /// The effective autonomy mode forbids the step outright.
    PolicyAutonomyDeny,
    /// A step declared a required role the operator does not hold.
    WorkflowPolicyRoleDeny,
    /// The current hour is outside the step's allowed window.
    WorkflowPolicyHourDeny,
    /// The fingerprint is suspended; execution is blocked.
    RequalificationBlocked,

    // -- Throttle --
    /// Token bucket for the fingerprint is empty.
    RateLimited,
    /// Circuit breaker for the fingerprint is open.
    CircuitOpen,

    // -- Approval --
    /// The plan needs operator approval before executing.
    ApprovalRequired,
    /// A batch of write-scoped steps needs operator approval.
    ApprovalRequiredBatch,
    /// A guard predicate failed while capturing prestates.
    GuardFailedAtApproval,
    /// A guard predicate failed on the fresh snapshot at resume.
    GuardFailedPreExec,
    /// The stored plan hash or prestate fingerprint no longer matches.
    PrestateMismatch,

    // -- Execution --
    /// A step exhausted its retry budget.
    StepFailed,
    /// The run was interrupted (SIGTERM) mid-step.
    Interrupted,
    /// A step exceeded its timeout budget.
    StepTimeout,

    // -- Planner --
    /// The planner asked for more operator input.
    NeedInput,
    /// Planner output failed schema validation.
    PlannerOutputInvalid,

    // -- Idempotency --
    /// The step's effect was previously committed; skipped.
    IdempotencyHit,
    /// Every pending write was previously committed; nothing to do.
    AlreadyExecuted,

    // -- Requalification --
    /// The breaker opened during a governor check.
    GovernorCircuitOpen,
    /// The suspension cooldown elapsed.
    CooldownElapsed,
    /// Too few successes inside the rolling horizon.
    ConfidenceDecay,
    /// Probation completed its required success count.
    ProbationComplete,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ReasonCode {
    /// Returns the broad [`ReasonCategory`] this code belongs to.
    pub fn category(&self) -> ReasonCategory {
        match self {
            Self::PolicyEngineFrozen
            | Self::PolicyDailyBudget
            | Self::PolicyPlanBudget
            | Self::PolicyCapabilityUnresolved
            | Self::PolicyCapabilityAmbiguous
            | Self::PolicyAgentVersionMismatch
            | Self::PolicyAutonomyDeny
            | Self::WorkflowPolicyRoleDeny
            | Self::WorkflowPolicyHourDeny
            | Self::RequalificationBlocked => ReasonCategory::Policy,

            Self::RateLimited | Self::CircuitOpen => ReasonCategory::Throttle,

            Self::ApprovalRequired
            | Self::ApprovalRequiredBatch
            | Self::GuardFailedAtApproval
            | Self::GuardFailedPreExec
            | Self::PrestateMismatch => ReasonCategory::Approval,

            Self::StepFailed | Self::Interrupted | Self::StepTimeout => ReasonCategory::Execution,

            Self::NeedInput | Self::PlannerOutputInvalid => ReasonCategory::Planner,

            Self::IdempotencyHit | Self::AlreadyExecuted => ReasonCategory::Idempotency,

            Self::GovernorCircuitOpen
            | Self::CooldownElapsed
            | Self::ConfidenceDecay
            | Self::ProbationComplete => ReasonCategory::Requalification,

            Self::Internal => ReasonCategory::Internal,
        }
    }

    /// Stable `&'static str` representation (e.g. `"POLICY_DAILY_BUDGET"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyEngineFrozen => "POLICY_ENGINE_FROZEN",
            Self::PolicyDailyBudget => "POLICY_DAILY_BUDGET",
            Self::PolicyPlanBudget => "POLICY_PLAN_BUDGET",
            Self::PolicyCapabilityUnresolved => "POLICY_CAPABILITY_UNRESOLVED",
            Self::PolicyCapabilityAmbiguous => "POLICY_CAPABILITY_AMBIGUOUS",
            Self::PolicyAgentVersionMismatch => "POLICY_AGENT_VERSION_MISMATCH",
            Self::PolicyAutonomyDeny => "POLICY_AUTONOMY_DENY",
            Self::WorkflowPolicyRoleDeny => "WORKFLOW_POLICY_ROLE_DENY",
            Self::WorkflowPolicyHourDeny => "WORKFLOW_POLICY_HOUR_DENY",
            Self::RequalificationBlocked => "REQUALIFICATION_BLOCKED",
            Self::RateLimited => "RATE_LIMITED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
            Self::ApprovalRequiredBatch => "APPROVAL_REQUIRED_BATCH",
            Self::GuardFailedAtApproval => "GUARD_FAILED_AT_APPROVAL",
            Self::GuardFailedPreExec => "GUARD_FAILED_PRE_EXEC",
            Self::PrestateMismatch => "PRESTATE_MISMATCH",
            Self::StepFailed => "STEP_FAILED",
            Self::Interrupted => "INTERRUPTED",
            Self::StepTimeout => "STEP_TIMEOUT",
            Self::NeedInput => "NEED_INPUT",
            Self::PlannerOutputInvalid => "PLANNER_OUTPUT_INVALID",
            Self::IdempotencyHit => "IDEMPOTENCY_HIT",
            Self::AlreadyExecuted => "ALREADY_EXECUTED",
            Self::GovernorCircuitOpen => "GOVERNOR_CIRCUIT_OPEN",
            Self::CooldownElapsed => "COOLDOWN_ELAPSED",
            Self::ConfidenceDecay => "CONFIDENCE_DECAY",
            Self::ProbationComplete => "PROBATION_COMPLETE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// GerError
// ---------------------------------------------------------------------------

/// Unified runtime error: a stable code, a human-readable message, an
/// optional cause, and arbitrary structured context.
///
/// ```
/// use ger_error::{GerError, ReasonCode};
///
/// let err = GerError::new(ReasonCode::RateLimited, "bucket empty")
///     .with_context("retry_after_secs", 4.2);
/// assert_eq!(err.code.as_str(), "RATE_LIMITED");
/// ```
pub struct GerError {
    /// Machine-readable reason code.
    pub code: ReasonCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl GerError {
    /// Create a new error with the given code and message.
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; entries that
    /// fail to serialise are skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ReasonCategory {
        self.code.category()
    }
}

impl fmt::Debug for GerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("GerError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for GerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for GerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_CODES: &[ReasonCode] = &[
        ReasonCode::PolicyEngineFrozen,
        ReasonCode::PolicyDailyBudget,
        ReasonCode::PolicyPlanBudget,
        ReasonCode::PolicyCapabilityUnresolved,
        ReasonCode::PolicyCapabilityAmbiguous,
        ReasonCode::PolicyAgentVersionMismatch,
        ReasonCode::PolicyAutonomyDeny,
        ReasonCode::WorkflowPolicyRoleDeny,
        ReasonCode::WorkflowPolicyHourDeny,
        ReasonCode::RequalificationBlocked,
        ReasonCode::RateLimited,
        ReasonCode::CircuitOpen,
        ReasonCode::ApprovalRequired,
        ReasonCode::ApprovalRequiredBatch,
        ReasonCode::GuardFailedAtApproval,
        ReasonCode::GuardFailedPreExec,
        ReasonCode::PrestateMismatch,
        ReasonCode::StepFailed,
        ReasonCode::Interrupted,
        ReasonCode::StepTimeout,
        ReasonCode::NeedInput,
        ReasonCode::PlannerOutputInvalid,
        ReasonCode::IdempotencyHit,
        ReasonCode::AlreadyExecuted,
        ReasonCode::GovernorCircuitOpen,
        ReasonCode::CooldownElapsed,
        ReasonCode::ConfidenceDecay,
        ReasonCode::ProbationComplete,
        ReasonCode::Internal,
    ];

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            let s = code.as_str();
            assert!(seen.insert(s), "duplicate as_str value: {s}");
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_serialize_to_as_str() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let expected = format!(r#""{}""#, code.as_str());
            assert_eq!(json, expected, "mismatch for {code:?}");
        }
    }

    #[test]
    fn code_count_guard() {
        // Ensure we don't silently drop a variant from ALL_CODES.
        assert_eq!(ALL_CODES.len(), 29);
    }

    #[test]
    fn serde_roundtrip() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let back: ReasonCode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, *code);
        }
    }

    #[test]
    fn display_matches_as_str() {
        for code in ALL_CODES {
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn categories_cover_spec_taxonomy() {
        assert_eq!(
            ReasonCode::PolicyDailyBudget.category(),
            ReasonCategory::Policy
        );
        assert_eq!(ReasonCode::RateLimited.category(), ReasonCategory::Throttle);
        assert_eq!(ReasonCode::CircuitOpen.category(), ReasonCategory::Throttle);
        assert_eq!(
            ReasonCode::PrestateMismatch.category(),
            ReasonCategory::Approval
        );
        assert_eq!(
            ReasonCode::Interrupted.category(),
            ReasonCategory::Execution
        );
        assert_eq!(ReasonCode::NeedInput.category(), ReasonCategory::Planner);
        assert_eq!(
            ReasonCode::AlreadyExecuted.category(),
            ReasonCategory::Idempotency
        );
        assert_eq!(
            ReasonCode::GovernorCircuitOpen.category(),
            ReasonCategory::Requalification
        );
    }

    #[test]
    fn error_display_with_context() {
        let err = GerError::new(ReasonCode::RateLimited, "bucket empty")
            .with_context("retry_after_secs", 4.5);
        let s = err.to_string();
        assert!(s.starts_with("[RATE_LIMITED] bucket empty"));
        assert!(s.contains("retry_after_secs"));
    }

    #[test]
    fn error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err = GerError::new(ReasonCode::Internal, "boom").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "missing");
    }
}
