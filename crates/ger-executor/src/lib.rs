// SPDX-License-Identifier: MIT OR Apache-2.0
//! Step execution.
//!
//! The executor walks a plan sequentially, dispatching each step to the
//! adapter registered for its action. Write effects are deduplicated by
//! idempotency key before dispatch, retried per the step's budget, and
//! recorded as artifacts plus idempotency records on success. A failed
//! step halts its phase; later phases never run.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod adapters;
/// Scriptable in-memory adapter for tests and dry wiring.
pub mod mock;

pub use adapter::{Adapter, AdapterError, AdapterRegistry, AdapterResponse};
pub use adapters::{NotionLiveAdapter, ShellRunAdapter, WebhookEmitAdapter};

use ger_core::{
    Clock, ExecutionPlan, Step, StepKind, StepReceipt, StepStatus, derived_idempotency_key,
    fingerprint_value,
};
use ger_ledger::Ledger;
use ger_state::{IdempotencyRecord, IdempotencyStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Errors that abort execution outright (not step failures).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// State persistence failed; the run must fail loudly.
    #[error(transparent)]
    State(#[from] ger_state::StateError),
    /// Artifact persistence failed; the run must fail loudly.
    #[error(transparent)]
    Ledger(#[from] ger_ledger::LedgerError),
    /// A snapshot could not be hashed.
    #[error(transparent)]
    Contract(#[from] ger_core::ContractError),
}

/// Outcome of executing a plan.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Per-step outcomes in plan order.
    pub steps: Vec<StepReceipt>,
    /// True when no step failed.
    pub success: bool,
    /// Step that failed, if any.
    pub failed_step: Option<String>,
    /// True when the failure was an operator interrupt.
    pub interrupted: bool,
    /// Phase accounting (phased plans only).
    pub phases_planned: Option<u32>,
    /// Phases that ran to completion.
    pub phases_executed: Option<u32>,
    /// Artifact paths written during execution.
    pub artifacts: Vec<String>,
}

/// Sequential plan executor.
pub struct Executor {
    adapters: AdapterRegistry,
    idempotency: IdempotencyStore,
    ledger: Ledger,
    clock: Arc<dyn Clock>,
    default_timeout: Duration,
    interrupt: Arc<AtomicBool>,
}

impl Executor {
    /// Build an executor over the given stores and adapter registry.
    #[must_use]
    pub fn new(
        adapters: AdapterRegistry,
        idempotency: IdempotencyStore,
        ledger: Ledger,
        clock: Arc<dyn Clock>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            adapters,
            idempotency,
            ledger,
            clock,
            default_timeout,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between attempts; setting it marks the in-flight step
    /// `failed` with an interrupt error and halts the run.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Execute the plan. Step failures are reported, not returned as
    /// errors; only persistence failures abort.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError`] when ledger or state writes fail.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        plan_hash: &str,
    ) -> Result<ExecutionReport, ExecutorError> {
        let mut report = ExecutionReport {
            steps: Vec::new(),
            success: true,
            failed_step: None,
            interrupted: false,
            phases_planned: None,
            phases_executed: None,
            artifacts: Vec::new(),
        };

        if plan.is_phased() {
            report.phases_planned = Some(plan.phases.len() as u32);
            let mut executed = 0u32;
            let mut halted = false;
            for phase in &plan.phases {
                if halted {
                    for step in &phase.steps {
                        report.steps.push(skipped(step));
                    }
                    continue;
                }
                let mut phase_ok = true;
                let mut steps = phase.steps.iter();
                for step in steps.by_ref() {
                    let outcome = self.run_step(plan, plan_hash, step, &mut report).await?;
                    let failed = outcome.status == StepStatus::Failed;
                    report.steps.push(outcome);
                    if failed {
                        phase_ok = false;
                        break;
                    }
                }
                if phase_ok {
                    executed += 1;
                } else {
                    // Remaining steps of the failed phase are skipped.
                    for step in steps {
                        report.steps.push(skipped(step));
                    }
                    halted = true;
                }
            }
            report.phases_executed = Some(executed);
        } else {
            let mut steps = plan.steps.iter();
            let mut halted = false;
            for step in steps.by_ref() {
                let outcome = self.run_step(plan, plan_hash, step, &mut report).await?;
                let failed = outcome.status == StepStatus::Failed;
                report.steps.push(outcome);
                if failed {
                    halted = true;
                    break;
                }
            }
            if halted {
                for rest in steps {
                    report.steps.push(skipped(rest));
                }
            }
        }

        if let Some(failed) = report
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
        {
            report.success = false;
            report.failed_step = Some(failed.step_id.clone());
            report.interrupted = failed.error.as_deref() == Some("INTERRUPTED");
        }
        Ok(report)
    }

    async fn run_step(
        &self,
        plan: &ExecutionPlan,
        plan_hash: &str,
        step: &Step,
        report: &mut ExecutionReport,
    ) -> Result<StepReceipt, ExecutorError> {
        let now = self.clock.now();
        let key = idempotency_key(step, plan_hash, &plan.thread_id);

        // Previously committed writes never re-dispatch.
        if step.kind() == StepKind::NotionLiveWrite
            && let Some(record) = self.idempotency.get(&key, now)?
        {
            info!(step_id = %step.step_id, key = %key, "idempotency hit, skipping dispatch");
            return Ok(StepReceipt {
                step_id: step.step_id.clone(),
                action: step.action.clone(),
                status: StepStatus::IdempotentHit,
                attempts: 0,
                duration_ms: 0,
                http_status: None,
                exit_code: None,
                response_digest: Some(record.response_digest),
                idempotency_key: Some(key),
                error: None,
            });
        }

        if plan.dry_run {
            return Ok(StepReceipt {
                step_id: step.step_id.clone(),
                action: step.action.clone(),
                status: StepStatus::Success,
                attempts: 0,
                duration_ms: 0,
                http_status: None,
                exit_code: None,
                response_digest: None,
                idempotency_key: (!step.read_only).then_some(key),
                error: None,
            });
        }

        let started = std::time::Instant::now();
        let (status, attempts, response, error) = self.dispatch_with_retry(step).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut receipt = StepReceipt {
            step_id: step.step_id.clone(),
            action: step.action.clone(),
            status,
            attempts,
            duration_ms,
            http_status: response.as_ref().and_then(|r| r.http_status),
            exit_code: response.as_ref().and_then(|r| r.exit_code),
            response_digest: None,
            idempotency_key: (!step.read_only).then(|| key.clone()),
            error,
        };

        if status == StepStatus::Success {
            let digest = response
                .as_ref()
                .map(|r| fingerprint_value(&r.digest_payload()))
                .transpose()?;
            receipt.response_digest = digest.clone();

            if !step.read_only {
                let completed_at = self.clock.now();
                self.idempotency.put(&IdempotencyRecord {
                    key: key.clone(),
                    execution_id: plan.execution_id.clone(),
                    plan_hash: plan_hash.to_string(),
                    step_id: step.step_id.clone(),
                    completed_at,
                    response_digest: digest.clone().unwrap_or_default(),
                })?;
                let artifact = self.ledger.write_artifact(
                    &artifact_kind(step),
                    &plan.execution_id,
                    &step.step_id,
                    &serde_json::json!({
                        "step_id": step.step_id,
                        "action": step.action,
                        "payload": step.payload,
                        "response": response.as_ref().map(AdapterResponse::digest_payload),
                        "completed_at": completed_at,
                    }),
                )?;
                report.artifacts.push(artifact.display().to_string());
            }
        }
        Ok(receipt)
    }

    /// Dispatch one step with its retry budget. Returns
    /// `(status, attempts, last_response, error)`.
    async fn dispatch_with_retry(
        &self,
        step: &Step,
    ) -> (StepStatus, u32, Option<AdapterResponse>, Option<String>) {
        let retry = step.retry_spec();
        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let mut attempts = 0u32;
        let mut last_response = None;
        let mut last_error = None;

        while attempts < retry.max_attempts.max(1) {
            if self.interrupt.load(Ordering::SeqCst) {
                return (StepStatus::Failed, attempts, last_response, Some("INTERRUPTED".into()));
            }
            attempts += 1;

            let Some(adapter) = self.adapters.get(&step.action) else {
                return (
                    StepStatus::Failed,
                    attempts,
                    None,
                    Some(format!("no adapter registered for '{}'", step.action)),
                );
            };

            match tokio::time::timeout(timeout, adapter.execute(step)).await {
                Ok(Ok(response)) if response.is_success() => {
                    return (StepStatus::Success, attempts, Some(response), None);
                }
                Ok(Ok(response)) => {
                    warn!(step_id = %step.step_id, attempts, "adapter reported non-success");
                    last_error = Some(non_success_detail(&response));
                    last_response = Some(response);
                }
                Ok(Err(err @ (AdapterError::MissingField { .. } | AdapterError::Unregistered { .. }))) => {
                    // Misconfiguration does not improve with retries.
                    return (StepStatus::Failed, attempts, None, Some(err.to_string()));
                }
                Ok(Err(err)) => {
                    warn!(step_id = %step.step_id, attempts, error = %err, "adapter failed");
                    last_error = Some(err.to_string());
                }
                Err(_) => {
                    warn!(step_id = %step.step_id, attempts, "step timed out");
                    last_error = Some(format!("timeout after {}ms", timeout.as_millis()));
                }
            }

            if attempts < retry.max_attempts {
                tokio::time::sleep(Duration::from_millis(retry.backoff_ms)).await;
            }
        }
        (StepStatus::Failed, attempts, last_response, last_error)
    }
}

/// Effective idempotency key: explicit when declared, derived otherwise.
#[must_use]
pub fn idempotency_key(step: &Step, plan_hash: &str, thread_id: &str) -> String {
    step.idempotency_key.clone().unwrap_or_else(|| {
        derived_idempotency_key(&step.action, plan_hash, &step.step_id, thread_id)
    })
}

fn artifact_kind(step: &Step) -> String {
    match step.kind() {
        StepKind::NotionLiveWrite => "notion.write".to_string(),
        _ => step.action.clone(),
    }
}

fn non_success_detail(response: &AdapterResponse) -> String {
    if let Some(status) = response.http_status {
        return format!("HTTP {status}");
    }
    if let Some(code) = response.exit_code {
        return format!("exit code {code}");
    }
    "adapter returned no result".to_string()
}

fn skipped(step: &Step) -> StepReceipt {
    StepReceipt {
        step_id: step.step_id.clone(),
        action: step.action.clone(),
        status: StepStatus::Skipped,
        attempts: 0,
        duration_ms: 0,
        http_status: None,
        exit_code: None,
        response_digest: None,
        idempotency_key: None,
        error: None,
    }
}

#[cfg(test)]
mod tests;
