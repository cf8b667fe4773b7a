// SPDX-License-Identifier: MIT OR Apache-2.0
//! Receipts: immutable outcome records with a stable content hash.
//!
//! `receipt_hash` is the SHA-256 of the canonical receipt with the hash
//! field forced to `null`, so the hash covers every other field and is
//! independent of any previously stored value.

use crate::autonomy::AutonomyMode;
use crate::canonical::{ContractError, sha256_hex, stable_json};
use chrono::{DateTime, Utc};
use ger_error::ReasonCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Terminal status of a governed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Every step completed (or the effect was already committed).
    Success,
    /// A step failed after exhausting its retry budget.
    Failed,
    /// Policy denied the plan.
    Denied,
    /// The plan is parked awaiting operator approval.
    AwaitingApproval,
    /// The governor refused the run (rate limit or open breaker).
    Throttled,
}

/// Per-step outcome inside a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Adapter reported success.
    Success,
    /// Adapter failed after all attempts.
    Failed,
    /// Effect was previously committed; adapter not called.
    IdempotentHit,
    /// Not reached (earlier failure or denied phase).
    Skipped,
}

/// Outcome record for a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepReceipt {
    /// Step identifier from the plan.
    pub step_id: String,
    /// Adapter action that was dispatched.
    pub action: String,
    /// Outcome of this step.
    pub status: StepStatus,
    /// Attempts consumed (0 when never dispatched).
    pub attempts: u32,
    /// Wall-clock duration, milliseconds.
    pub duration_ms: u64,
    /// HTTP status for HTTP-backed adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Exit code for shell adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// SHA-256 digest of the adapter response body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_digest: Option<String>,
    /// Idempotency key used for write dedup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Failure detail when status is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Denial detail attached to `denied` / `throttled` receipts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyDenied {
    /// Stable reason code.
    pub code: ReasonCode,
    /// Human-readable explanation.
    pub reason: String,
    /// Throttle hint: seconds until a retry can succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<f64>,
}

/// Approval demand attached to `awaiting_approval` receipts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalRequired {
    /// Kind of approval demanded (`step` or `batch`).
    pub kind: String,
    /// Human-readable explanation.
    pub reason: String,
    /// Step ids covered by the demand.
    pub scope: Vec<String>,
    /// Execution the approval belongs to.
    pub execution_id: String,
    /// Plan hash the approval is pinned to.
    pub plan_hash: String,
}

/// Immutable outcome record of one governed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Receipt {
    /// Receipt kind: `execution`, `rollback`, `autonomy_transition`, …
    pub kind: String,
    /// Execution this receipt belongs to.
    pub execution_id: String,
    /// Thread the execution belongs to.
    pub thread_id: String,
    /// Goal statement from the plan.
    pub goal: String,
    /// Whether the run was a dry run.
    pub dry_run: bool,
    /// Run start time.
    pub started_at: DateTime<Utc>,
    /// Run finish time.
    pub finished_at: DateTime<Utc>,
    /// Terminal status.
    pub status: ReceiptStatus,
    /// Hash of the plan that was (or would have been) executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_hash: Option<String>,
    /// Governance fingerprint of the originating command.
    pub fingerprint: String,
    /// Operator-chosen autonomy mode.
    pub autonomy_mode: AutonomyMode,
    /// Mode after confidence downgrades.
    pub autonomy_mode_effective: AutonomyMode,
    /// Per-step outcomes.
    #[serde(default)]
    pub steps: Vec<StepReceipt>,
    /// Denial detail for `denied` / `throttled` receipts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_denied: Option<PolicyDenied>,
    /// Approval demand for `awaiting_approval` receipts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_required: Option<ApprovalRequired>,
    /// Paths of artifacts written during the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Number of phases in the plan (phased mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases_planned: Option<u32>,
    /// Number of phases that ran to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases_executed: Option<u32>,
    /// Phase at which policy killed the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_phase: Option<String>,
    /// SHA-256 over the canonical receipt with this field nulled.
    pub receipt_hash: Option<String>,
}

/// Canonical JSON of a receipt with `receipt_hash` forced to `null`.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the receipt cannot be serialized.
pub fn canonicalize_receipt(receipt: &Receipt) -> Result<String, ContractError> {
    let mut v = serde_json::to_value(receipt)?;
    if let serde_json::Value::Object(map) = &mut v {
        map.insert("receipt_hash".to_string(), serde_json::Value::Null);
    }
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex SHA-256 hash of the canonical receipt form.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the receipt cannot be serialized.
pub fn receipt_hash(receipt: &Receipt) -> Result<String, ContractError> {
    Ok(sha256_hex(canonicalize_receipt(receipt)?.as_bytes()))
}

/// Verify that a receipt's stored hash matches the recomputed hash.
///
/// A receipt without a stored hash verifies trivially; serialization
/// failure verifies as `false`.
#[must_use]
pub fn verify_receipt_hash(receipt: &Receipt) -> bool {
    match &receipt.receipt_hash {
        None => true,
        Some(stored) => match receipt_hash(receipt) {
            Ok(recomputed) => *stored == recomputed,
            Err(_) => false,
        },
    }
}

/// Fluent builder for receipts.
///
/// ```
/// use ger_core::{AutonomyMode, ReceiptBuilder, ReceiptStatus};
/// use chrono::Utc;
///
/// let receipt = ReceiptBuilder::new("execution", "exec-1", "fp")
///     .status(ReceiptStatus::Success)
///     .autonomy(AutonomyMode::Full, AutonomyMode::Full)
///     .window(Utc::now(), Utc::now())
///     .build();
/// assert!(receipt.receipt_hash.is_some());
/// ```
#[derive(Debug, Clone)]
pub struct ReceiptBuilder {
    receipt: Receipt,
}

impl ReceiptBuilder {
    /// Start a receipt of the given kind for an execution and fingerprint.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        execution_id: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            receipt: Receipt {
                kind: kind.into(),
                execution_id: execution_id.into(),
                thread_id: String::new(),
                goal: String::new(),
                dry_run: false,
                started_at: epoch,
                finished_at: epoch,
                status: ReceiptStatus::Failed,
                plan_hash: None,
                fingerprint: fingerprint.into(),
                autonomy_mode: AutonomyMode::Off,
                autonomy_mode_effective: AutonomyMode::Off,
                steps: Vec::new(),
                policy_denied: None,
                approval_required: None,
                artifacts: Vec::new(),
                phases_planned: None,
                phases_executed: None,
                denied_phase: None,
                receipt_hash: None,
            },
        }
    }

    /// Set thread id and goal.
    #[must_use]
    pub fn thread(mut self, thread_id: impl Into<String>, goal: impl Into<String>) -> Self {
        self.receipt.thread_id = thread_id.into();
        self.receipt.goal = goal.into();
        self
    }

    /// Set the dry-run flag.
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.receipt.dry_run = dry_run;
        self
    }

    /// Set the terminal status.
    #[must_use]
    pub fn status(mut self, status: ReceiptStatus) -> Self {
        self.receipt.status = status;
        self
    }

    /// Set the plan hash.
    #[must_use]
    pub fn plan_hash(mut self, hash: impl Into<String>) -> Self {
        self.receipt.plan_hash = Some(hash.into());
        self
    }

    /// Set requested and effective autonomy modes.
    #[must_use]
    pub fn autonomy(mut self, requested: AutonomyMode, effective: AutonomyMode) -> Self {
        self.receipt.autonomy_mode = requested;
        self.receipt.autonomy_mode_effective = effective;
        self
    }

    /// Set the start/finish window.
    #[must_use]
    pub fn window(mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        self.receipt.started_at = started_at;
        self.receipt.finished_at = finished_at;
        self
    }

    /// Append a step outcome.
    #[must_use]
    pub fn step(mut self, step: StepReceipt) -> Self {
        self.receipt.steps.push(step);
        self
    }

    /// Replace the step outcomes wholesale.
    #[must_use]
    pub fn steps(mut self, steps: Vec<StepReceipt>) -> Self {
        self.receipt.steps = steps;
        self
    }

    /// Attach a denial detail.
    #[must_use]
    pub fn policy_denied(mut self, denied: PolicyDenied) -> Self {
        self.receipt.policy_denied = Some(denied);
        self
    }

    /// Attach an approval demand.
    #[must_use]
    pub fn approval_required(mut self, approval: ApprovalRequired) -> Self {
        self.receipt.approval_required = Some(approval);
        self
    }

    /// Record an artifact path.
    #[must_use]
    pub fn artifact(mut self, path: impl Into<String>) -> Self {
        self.receipt.artifacts.push(path.into());
        self
    }

    /// Record phase accounting.
    #[must_use]
    pub fn phases(mut self, planned: u32, executed: u32, denied: Option<String>) -> Self {
        self.receipt.phases_planned = Some(planned);
        self.receipt.phases_executed = Some(executed);
        self.receipt.denied_phase = denied;
        self
    }

    /// Finalize: compute and stamp the receipt hash.
    ///
    /// # Panics
    ///
    /// Never panics in practice: receipts serialize by construction; the
    /// fallible path is exposed as [`ReceiptBuilder::try_build`].
    #[must_use]
    pub fn build(self) -> Receipt {
        self.try_build()
            .unwrap_or_else(|e| unreachable!("receipt must serialize: {e}"))
    }

    /// Finalize, surfacing serialization failure.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Json`] if hashing fails.
    pub fn try_build(mut self) -> Result<Receipt, ContractError> {
        let hash = receipt_hash(&self.receipt)?;
        self.receipt.receipt_hash = Some(hash);
        Ok(self.receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Receipt {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        ReceiptBuilder::new("execution", "exec-1", "fp-1")
            .thread("thread-1", "sync docket")
            .status(ReceiptStatus::Success)
            .autonomy(AutonomyMode::ApprovalGated, AutonomyMode::ApprovalGated)
            .window(t0, t0 + chrono::Duration::seconds(3))
            .plan_hash("abc123")
            .step(StepReceipt {
                step_id: "s1".into(),
                action: "notion.live.write".into(),
                status: StepStatus::Success,
                attempts: 1,
                duration_ms: 120,
                http_status: Some(200),
                exit_code: None,
                response_digest: Some("d".repeat(64)),
                idempotency_key: Some("k".repeat(64)),
                error: None,
            })
            .build()
    }

    #[test]
    fn hash_covers_all_non_hash_fields() {
        let r = sample();
        assert!(verify_receipt_hash(&r));

        let mut tampered = r.clone();
        tampered.goal = "something else".into();
        assert!(!verify_receipt_hash(&tampered));
    }

    #[test]
    fn hash_is_independent_of_stored_hash() {
        let mut r = sample();
        let h1 = receipt_hash(&r).unwrap();
        r.receipt_hash = Some("garbage".into());
        let h2 = receipt_hash(&r).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn missing_hash_verifies_trivially() {
        let mut r = sample();
        r.receipt_hash = None;
        assert!(verify_receipt_hash(&r));
    }

    #[test]
    fn canonical_form_is_stable() {
        let r = sample();
        assert_eq!(
            canonicalize_receipt(&r).unwrap(),
            canonicalize_receipt(&r).unwrap()
        );
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ReceiptStatus::AwaitingApproval).unwrap(),
            r#""awaiting_approval""#
        );
        assert_eq!(
            serde_json::to_string(&StepStatus::IdempotentHit).unwrap(),
            r#""idempotent_hit""#
        );
    }

    #[test]
    fn serde_roundtrip_preserves_hash_validity() {
        let r = sample();
        let json = serde_json::to_string(&r).unwrap();
        let back: Receipt = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        assert!(verify_receipt_hash(&back));
    }

    #[test]
    fn throttled_receipt_carries_denial() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let r = ReceiptBuilder::new("execution", "exec-2", "fp-2")
            .status(ReceiptStatus::Throttled)
            .window(t0, t0)
            .policy_denied(PolicyDenied {
                code: ReasonCode::RateLimited,
                reason: "bucket empty".into(),
                retry_after_secs: Some(5.0),
            })
            .build();
        assert_eq!(r.status, ReceiptStatus::Throttled);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["policy_denied"]["code"], "RATE_LIMITED");
        assert!(verify_receipt_hash(&r));
    }
}
