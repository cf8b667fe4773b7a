// SPDX-License-Identifier: MIT OR Apache-2.0
//! The orchestrator: the full governance pipeline for one command.
//!
//! Pipeline order is fixed: normalize → fingerprint → cooldown watcher →
//! governor → decay check → suspension block → plan → capability
//! resolution → prestate capture → policy → execute. The first terminal
//! condition wins, and every terminal condition flushes exactly one
//! receipt before the process exits.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Operator report operations: rollback, rankings, promotion, audit.
pub mod ops;
/// The planner seam and template planner.
pub mod planner;
/// Raw-text command routing.
pub mod router;

pub use planner::{Planner, PlannerError, PlannerOutput, TemplatePlanner, TemplateRegistry};
pub use router::{Route, route};

use chrono::{DateTime, Utc};
use ger_approval::{ApprovalEnvelope, ApprovalError, ApprovalMode, ApprovalStore};
use ger_core::{
    ApprovalRequired, AutonomyMode, Clock, Command, ExecutionPlan, PolicyDenied, Receipt,
    ReceiptBuilder, ReceiptStatus, RuntimeConfig,
};
use ger_error::ReasonCode;
use ger_executor::{AdapterRegistry, ExecutionReport, Executor};
use ger_governor::{Governor, GovernorDecision};
use ger_ledger::Ledger;
use ger_policy::{PolicyContext, PolicyDecision, PolicyEngine};
use ger_prestate::{CapturedPrestate, GuardFailure, PrestateFetcher, evaluate_guards};
use ger_registry::Registry;
use ger_requalify::Requalifier;
use ger_state::{ConfidenceSignal, ConfidenceStore, IdempotencyStore, RequalState, RequalStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Terminal outcome of one runtime invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum RunOutcome {
    /// Execution completed; exit 0.
    Success {
        /// The success receipt.
        receipt: Receipt,
    },
    /// Every pending effect was previously committed; exit 0.
    AlreadyExecuted {
        /// Always `IDEMPOTENCY_HIT`.
        code: ReasonCode,
        /// Execution whose effects were found committed.
        execution_id: String,
        /// Plan hash the effects were committed under.
        plan_hash: String,
        /// The pending steps that were found committed.
        steps: Vec<String>,
    },
    /// A step failed; exit 1.
    Failure {
        /// The failure receipt.
        receipt: Receipt,
    },
    /// The planner needs more operator input; exit 2.
    NeedInput {
        /// What the operator should provide.
        question: String,
    },
    /// Policy denied the run; exit 3.
    Denied {
        /// The denial receipt.
        receipt: Receipt,
    },
    /// The governor refused the run; exit 3.
    Throttled {
        /// The throttle receipt.
        receipt: Receipt,
    },
    /// The plan is parked for approval; exit 4.
    AwaitingApproval {
        /// The awaiting-approval receipt.
        receipt: Receipt,
        /// Path of the persisted envelope.
        envelope_path: String,
    },
    /// Resume rejected; the plan needs approval again; exit 4.
    NeedApprovalAgain {
        /// `PRESTATE_MISMATCH`.
        code: ReasonCode,
        /// Mismatch detail for the operator.
        details: serde_json::Value,
    },
    /// Guard predicates failed; exit 4.
    GuardFailed {
        /// `GUARD_FAILED_AT_APPROVAL` or `GUARD_FAILED_PRE_EXEC`.
        code: ReasonCode,
        /// The failed predicates.
        failures: Vec<GuardFailure>,
    },
    /// The fingerprint decayed into probation; exit 4.
    ConfidenceDecayed {
        /// The decayed fingerprint.
        fingerprint: String,
    },
    /// A read-only report (scan, rankings, promotion, audit, templates);
    /// exit 0.
    Report {
        /// Report payload.
        report: serde_json::Value,
    },
}

impl RunOutcome {
    /// Deterministic process exit code for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success { .. } | Self::AlreadyExecuted { .. } | Self::Report { .. } => 0,
            Self::Failure { .. } => 1,
            Self::NeedInput { .. } => 2,
            Self::Denied { .. } | Self::Throttled { .. } => 3,
            Self::AwaitingApproval { .. }
            | Self::NeedApprovalAgain { .. }
            | Self::GuardFailed { .. }
            | Self::ConfidenceDecayed { .. } => 4,
        }
    }
}

/// The assembled pipeline. All stores are explicit; no module state.
pub struct Orchestrator {
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    ledger: Ledger,
    confidence: ConfidenceStore,
    requal: RequalStore,
    governor: Governor,
    policy: PolicyEngine,
    registry: Registry,
    requalifier: Requalifier,
    executor: Executor,
    approvals: ApprovalStore,
    planner: Arc<dyn Planner>,
    fetcher: Arc<dyn PrestateFetcher>,
    templates: TemplateRegistry,
}

impl Orchestrator {
    /// Assemble the pipeline from configuration and pluggable seams.
    ///
    /// # Errors
    ///
    /// Fails when the agent registry cannot be loaded.
    pub fn new(
        config: RuntimeConfig,
        clock: Arc<dyn Clock>,
        planner: Arc<dyn Planner>,
        fetcher: Arc<dyn PrestateFetcher>,
        adapters: AdapterRegistry,
    ) -> anyhow::Result<Self> {
        let ledger = Ledger::new(&config.runs_dir);
        let registry = Registry::load_or_builtin(&config.runs_dir.join("registry.json"))?;
        let confidence = ConfidenceStore::new(ledger.clone());
        let requal = RequalStore::new(ledger.clone());
        let idempotency = IdempotencyStore::new(ledger.clone(), config.idempotency_ttl_days);
        let governor = Governor::new(
            ledger.clone(),
            config.bucket_capacity,
            config.refill_rate_per_sec,
            config.breaker_failure_threshold,
            config.breaker_cooldown_secs,
        );
        let requalifier = Requalifier::new(
            requal.clone(),
            ledger.clone(),
            config.required_probation_successes,
            config.confidence_decay_horizon_hours,
            config.required_successes_in_horizon,
            config.autonomy_mode,
        );
        let executor = Executor::new(
            adapters,
            idempotency,
            ledger.clone(),
            clock.clone(),
            Duration::from_secs(config.step_timeout_secs),
        );
        let policy = PolicyEngine::new(config.clone());
        let approvals = ApprovalStore::new(ledger.clone());
        let templates = TemplateRegistry::new(config.runs_dir.join("templates"));
        Ok(Self {
            config,
            clock,
            ledger,
            confidence,
            requal,
            governor,
            policy,
            registry,
            requalifier,
            executor,
            approvals,
            planner,
            fetcher,
            templates,
        })
    }

    /// The ledger this orchestrator writes to.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The idempotency store (TTL from configuration).
    #[must_use]
    fn idempotency(&self) -> IdempotencyStore {
        IdempotencyStore::new(self.ledger.clone(), self.config.idempotency_ttl_days)
    }

    /// Flag that interrupts the in-flight step when set (SIGTERM path).
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<std::sync::atomic::AtomicBool> {
        self.executor.interrupt_flag()
    }

    /// Route raw operator text and perform the operation.
    ///
    /// # Errors
    ///
    /// Internal failures (disk, corrupt state) surface as errors; they
    /// must fail the process rather than silently succeed.
    pub async fn handle(&self, text: &str) -> anyhow::Result<RunOutcome> {
        match route(text) {
            Route::Dsl(command) => self.run_command(&command).await,
            Route::Approve { execution_id } => self.approve(&execution_id).await,
            Route::Rollback { execution_id } => self.rollback(&execution_id),
            Route::RequalifyScan => self.requalify_scan(),
            Route::RequalifyActivate { fingerprint } => self.requalify_activate(&fingerprint),
            Route::PromoteRecommend { .. } => self.promote_recommend(),
            Route::RankingsCompute { days } => self.rankings_compute(days),
            Route::AuditExport { selector } => self.audit_export(&selector),
            Route::TemplateList => {
                let names = self.templates.list()?;
                Ok(RunOutcome::Report {
                    report: serde_json::json!({"templates": names}),
                })
            }
            Route::TemplateShow { name } => match self.templates.show(&name)? {
                Some(text) => Ok(RunOutcome::Report {
                    report: serde_json::from_str(&text)
                        .unwrap_or(serde_json::Value::String(text)),
                }),
                None => Ok(RunOutcome::NeedInput {
                    question: format!("no template named '{name}'"),
                }),
            },
            Route::TemplateRun { name, params } => {
                let now = self.clock.now();
                match self
                    .templates
                    .materialize(&name, params.as_deref(), now)?
                {
                    Some(plan) => self.run_planned(Command::parse(&name), plan).await,
                    None => Ok(RunOutcome::NeedInput {
                        question: format!("no template named '{name}'"),
                    }),
                }
            }
            Route::Unknown(text) => Ok(RunOutcome::NeedInput {
                question: format!("unrecognized command: {text}"),
            }),
        }
    }

    /// Run a DSL command through the full pipeline.
    ///
    /// # Errors
    ///
    /// Internal failures only; governance outcomes are [`RunOutcome`]s.
    pub async fn run_command(&self, text: &str) -> anyhow::Result<RunOutcome> {
        let command = Command::parse(text);
        let now = self.clock.now();
        let fingerprint = command.fingerprint()?;
        info!(fingerprint = %fingerprint, "command received");

        if let Some(outcome) = self.pre_plan_gates(&command, &fingerprint, now)? {
            return Ok(outcome);
        }

        // Plan, with one retry on malformed output in lenient mode.
        let plan = match self.plan_with_retry(&command, now).await? {
            PlanOrOutcome::Plan(plan) => plan,
            PlanOrOutcome::Outcome(outcome) => return Ok(outcome),
        };
        self.govern_and_execute(command, plan, fingerprint).await
    }

    /// Run an already-materialized plan (template path) through the same
    /// governance gates as a planned command.
    async fn run_planned(
        &self,
        command: Command,
        plan: ExecutionPlan,
    ) -> anyhow::Result<RunOutcome> {
        let now = self.clock.now();
        let fingerprint = command.fingerprint()?;
        if let Some(outcome) = self.pre_plan_gates(&command, &fingerprint, now)? {
            return Ok(outcome);
        }
        self.govern_and_execute(command, plan, fingerprint).await
    }

    /// Gates that run before planning: cooldown watcher, governor, decay
    /// check, suspension block. Returns a terminal outcome when one fires.
    fn pre_plan_gates(
        &self,
        command: &Command,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<RunOutcome>> {
        if self.config.requalification_enabled {
            self.requalifier.cooldown_scan(now)?;
        }

        // Governor: rate limit and breaker.
        if let GovernorDecision::Deny {
            code,
            retry_after_secs,
        } = self.governor.check(fingerprint, now)?
        {
            let record = self
                .confidence
                .apply(fingerprint, ConfidenceSignal::Throttle, now)?;
            if self.config.requalification_enabled {
                self.requalifier.record_regression(fingerprint, now)?;
            }
            self.confidence_guardrails(&record, now)?;
            let receipt = self
                .receipt_builder(
                    "execution",
                    format!("throttled-{}", now.timestamp_millis()),
                    fingerprint,
                    now,
                )
                .status(ReceiptStatus::Throttled)
                .policy_denied(PolicyDenied {
                    code,
                    reason: format!("governor denied command '{}'", command.normalized()),
                    retry_after_secs: Some(retry_after_secs),
                })
                .build();
            self.ledger.append_receipt(&receipt)?;
            warn!(fingerprint, code = %code, retry_after_secs, "run throttled");
            return Ok(Some(RunOutcome::Throttled { receipt }));
        }

        // Confidence decay.
        let confidence = self.confidence.load(fingerprint, now)?;
        if self.config.requalification_enabled
            && self.requalifier.decay_check(&confidence, now)?.is_some()
        {
            return Ok(Some(RunOutcome::ConfidenceDecayed {
                fingerprint: fingerprint.to_string(),
            }));
        }

        // Suspension blocks before any planning happens.
        let requal_record = self.requal.load(fingerprint, now)?;
        if requal_record.state == RequalState::Suspended {
            let outcome = self.deny(
                fingerprint,
                now,
                None,
                ReasonCode::RequalificationBlocked,
                format!("fingerprint suspended since {}", requal_record.since),
            )?;
            return Ok(Some(outcome));
        }
        Ok(None)
    }

    async fn plan_with_retry(
        &self,
        command: &Command,
        now: DateTime<Utc>,
    ) -> anyhow::Result<PlanOrOutcome> {
        let mut attempts = 0;
        let max_attempts = if self.config.strict_agent_output { 1 } else { 2 };
        loop {
            attempts += 1;
            match self.planner.plan(command, now).await {
                Ok(PlannerOutput::Plan(plan)) => return Ok(PlanOrOutcome::Plan(*plan)),
                Ok(PlannerOutput::NeedInput { question }) => {
                    return Ok(PlanOrOutcome::Outcome(RunOutcome::NeedInput { question }));
                }
                Ok(PlannerOutput::ValidatedCommand { command: validated }) => {
                    // One re-plan with the validated text.
                    let validated = Command::parse(&validated);
                    return match self.planner.plan(&validated, now).await? {
                        PlannerOutput::Plan(plan) => Ok(PlanOrOutcome::Plan(*plan)),
                        PlannerOutput::NeedInput { question } => {
                            Ok(PlanOrOutcome::Outcome(RunOutcome::NeedInput { question }))
                        }
                        PlannerOutput::ValidatedCommand { .. } => {
                            Ok(PlanOrOutcome::Outcome(RunOutcome::NeedInput {
                                question: "planner kept validating without planning".into(),
                            }))
                        }
                    };
                }
                Err(PlannerError::Parse(detail)) if attempts < max_attempts => {
                    warn!(attempts, detail, "planner output invalid, retrying once");
                }
                Err(e) => {
                    return Ok(PlanOrOutcome::Outcome(RunOutcome::NeedInput {
                        question: format!("planner failed: {e}"),
                    }));
                }
            }
        }
    }

    /// Capability resolution, prestate capture, policy, and execution.
    async fn govern_and_execute(
        &self,
        command: Command,
        mut plan: ExecutionPlan,
        fingerprint: String,
    ) -> anyhow::Result<RunOutcome> {
        let now = self.clock.now();
        let confidence = self.confidence.load(&fingerprint, now)?;
        let effective = self.config.autonomy_mode.effective(confidence.value);

        // Capability resolution and version pinning.
        let resolved = match self.registry.resolve(&plan.required_capabilities) {
            Ok(resolved) => resolved,
            Err(e) => {
                let outcome =
                    self.deny(&fingerprint, now, Some(&plan), e.reason_code(), e.to_string())?;
                return Ok(outcome);
            }
        };
        if let Err(e) = self
            .registry
            .check_version_pins(&plan.agent_versions, self.config.allow_agent_version_mismatch)
        {
            let outcome =
                self.deny(&fingerprint, now, Some(&plan), e.reason_code(), e.to_string())?;
            return Ok(outcome);
        }

        // Prestate capture for every write-scoped step (skipped on dry
        // runs, which never touch the store).
        let mut captured: Vec<CapturedPrestate> = Vec::new();
        if !plan.dry_run {
            let write_ids: Vec<String> = plan
                .write_scoped_steps()
                .map(|s| s.step_id.clone())
                .collect();
            for step_id in write_ids {
                let step = plan
                    .all_steps()
                    .find(|s| s.step_id == step_id)
                    .cloned()
                    .unwrap_or_else(|| unreachable!("step vanished"));
                match ger_prestate::capture(self.fetcher.as_ref(), &step, now).await {
                    Ok(capture) => {
                        for s in plan.all_steps_mut().filter(|s| s.step_id == step_id) {
                            s.prestate_snapshot = Some(capture.snapshot.clone());
                            s.prestate_fingerprint = Some(capture.fingerprint.clone());
                        }
                        captured.push(capture);
                    }
                    Err(e) => {
                        let receipt = self
                            .plan_receipt(&plan, &fingerprint, now, effective)
                            .status(ReceiptStatus::Failed)
                            .policy_denied(PolicyDenied {
                                code: ReasonCode::StepFailed,
                                reason: format!("prestate capture failed: {e}"),
                                retry_after_secs: None,
                            })
                            .build();
                        self.ledger.append_receipt(&receipt)?;
                        return Ok(RunOutcome::Failure { receipt });
                    }
                }
            }
        }
        let plan_hash = plan.plan_hash()?;

        // Policy.
        let requal_record = self.requal.load(&fingerprint, now)?;
        let normalized = command.normalized();
        let ctx = PolicyContext {
            execution_id: &plan.execution_id,
            command: &normalized,
            domain_id: command.domain_id.as_deref(),
            approved_execution_id: None,
            now,
            runs_today: self.runs_today(now)?,
            requal_state: requal_record.state,
            autonomy_effective: effective,
        };
        match self.policy.evaluate(&plan, &ctx) {
            PolicyDecision::Allow => {}
            PolicyDecision::Deny {
                code,
                reason,
                step_id,
            } => {
                let denied_phase = step_id.as_deref().and_then(|id| phase_of(&plan, id));
                let mut builder = self
                    .plan_receipt(&plan, &fingerprint, now, effective)
                    .plan_hash(plan_hash)
                    .status(ReceiptStatus::Denied)
                    .policy_denied(PolicyDenied {
                        code,
                        reason,
                        retry_after_secs: None,
                    });
                if let Some(phase) = denied_phase {
                    builder = builder.phases(plan.phases.len() as u32, 0, Some(phase));
                }
                let receipt = builder.build();
                self.ledger.append_receipt(&receipt)?;
                let record = self
                    .confidence
                    .apply(&fingerprint, ConfidenceSignal::PolicyDenial, now)?;
                if self.config.requalification_enabled {
                    self.requalifier.record_regression(&fingerprint, now)?;
                }
                self.confidence_guardrails(&record, now)?;
                return Ok(RunOutcome::Denied { receipt });
            }
            PolicyDecision::RequireApproval {
                kind,
                reason,
                scope,
            } => {
                return self.park_for_approval(
                    &command,
                    plan,
                    plan_hash,
                    fingerprint,
                    kind,
                    reason,
                    scope,
                    captured,
                    resolved,
                    effective,
                    now,
                );
            }
        }

        // Execute.
        let report = self.executor.execute(&plan, &plan_hash).await?;
        self.finish_execution(&plan, &plan_hash, &fingerprint, effective, report)
    }

    /// Persist the envelope, the prestate files, and the
    /// awaiting-approval receipt.
    #[allow(clippy::too_many_arguments)]
    fn park_for_approval(
        &self,
        command: &Command,
        plan: ExecutionPlan,
        plan_hash: String,
        fingerprint: String,
        kind: String,
        reason: String,
        scope: Vec<String>,
        captured: Vec<CapturedPrestate>,
        resolved: Vec<ger_registry::ResolvedCapability>,
        effective: AutonomyMode,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RunOutcome> {
        // Guards are checked against the snapshots captured moments ago;
        // failing now beats parking a plan that can never pass.
        let mut failures: Vec<GuardFailure> = Vec::new();
        for capture in &captured {
            if let Some(step) = plan.all_steps().find(|s| s.step_id == capture.step_id) {
                failures.extend(evaluate_guards(&step.guards, &capture.snapshot));
            }
        }
        if !failures.is_empty() {
            let receipt = self
                .plan_receipt(&plan, &fingerprint, now, effective)
                .plan_hash(plan_hash)
                .status(ReceiptStatus::Denied)
                .policy_denied(PolicyDenied {
                    code: ReasonCode::GuardFailedAtApproval,
                    reason: format!("{} guard predicate(s) failed", failures.len()),
                    retry_after_secs: None,
                })
                .build();
            self.ledger.append_receipt(&receipt)?;
            return Ok(RunOutcome::GuardFailed {
                code: ReasonCode::GuardFailedAtApproval,
                failures,
            });
        }

        let mut prestates = BTreeMap::new();
        for capture in &captured {
            let path = self.ledger.prestate_path(&plan.execution_id, &capture.step_id);
            self.ledger.write_json_atomic(&path, capture)?;
            prestates.insert(capture.step_id.clone(), capture.fingerprint.clone());
        }

        let envelope = ApprovalEnvelope {
            execution_id: plan.execution_id.clone(),
            command: command.raw().to_string(),
            domain_id: command.domain_id.clone(),
            created_at: now,
            status: "awaiting_approval".into(),
            plan_hash: plan_hash.clone(),
            mode: if plan.is_phased() {
                ApprovalMode::Phased
            } else {
                ApprovalMode::Legacy
            },
            phases_planned: plan.is_phased().then(|| plan.phases.len() as u32),
            phases_executed: plan.is_phased().then_some(0),
            pending_step_ids: scope.clone(),
            prestates,
            resolved_capabilities: resolved,
            started_at: now,
            plan: plan.clone(),
        };
        let envelope_path = self.approvals.save(&envelope)?;

        let receipt = self
            .plan_receipt(&plan, &fingerprint, now, effective)
            .plan_hash(plan_hash.clone())
            .status(ReceiptStatus::AwaitingApproval)
            .approval_required(ApprovalRequired {
                kind,
                reason,
                scope,
                execution_id: plan.execution_id.clone(),
                plan_hash,
            })
            .build();
        self.ledger.append_receipt(&receipt)?;
        info!(execution_id = %plan.execution_id, "plan parked for approval");
        Ok(RunOutcome::AwaitingApproval {
            receipt,
            envelope_path: envelope_path.display().to_string(),
        })
    }

    /// Resume a paused plan: `/approve <execution_id>`.
    ///
    /// # Errors
    ///
    /// Internal failures only; a lingering approval requirement after
    /// re-evaluation is a programmer error and surfaces as one.
    pub async fn approve(&self, execution_id: &str) -> anyhow::Result<RunOutcome> {
        let now = self.clock.now();
        let envelope = match self.approvals.load(execution_id) {
            Ok(envelope) => envelope,
            Err(ApprovalError::NotFound { .. }) => {
                return Ok(RunOutcome::NeedInput {
                    question: format!("no approval state for '{execution_id}'"),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let command = Command::parse(&envelope.command);
        let fingerprint = command.fingerprint()?;

        // 1. The stored plan must still hash to the stored value.
        let recomputed = envelope.plan.plan_hash()?;
        if recomputed != envelope.plan_hash {
            return Ok(RunOutcome::NeedApprovalAgain {
                code: ReasonCode::PrestateMismatch,
                details: serde_json::json!({
                    "prestate_plan_hash": envelope.plan_hash,
                    "approval_plan_hash": recomputed,
                }),
            });
        }

        // 2. Domain-scoped operator authorization.
        if let Some(domain) = &envelope.domain_id
            && !self.config.operator_has_role(domain, "approver")
        {
            let outcome = self.deny(
                &fingerprint,
                now,
                Some(&envelope.plan),
                ReasonCode::WorkflowPolicyRoleDeny,
                format!("approval requires the approver role in domain '{domain}'"),
            )?;
            return Ok(outcome);
        }

        // 3. Idempotency short-circuit: everything already committed.
        let idempotency = self.idempotency();
        let pending: Vec<_> = envelope
            .plan
            .all_steps()
            .filter(|s| envelope.pending_step_ids.contains(&s.step_id))
            .collect();
        let keys: Vec<String> = pending
            .iter()
            .map(|s| ger_executor::idempotency_key(s, &envelope.plan_hash, &envelope.plan.thread_id))
            .collect();
        if !keys.is_empty() && idempotency.has_all(keys.iter().map(String::as_str), now)? {
            info!(execution_id, "all pending effects already committed");
            return Ok(RunOutcome::AlreadyExecuted {
                code: ReasonCode::IdempotencyHit,
                execution_id: execution_id.to_string(),
                plan_hash: envelope.plan_hash.clone(),
                steps: envelope.pending_step_ids.clone(),
            });
        }

        // 4. Fresh prestate capture: drift and guard re-evaluation.
        let mut fresh = BTreeMap::new();
        let mut fresh_snapshots = BTreeMap::new();
        for step in &pending {
            let capture = ger_prestate::capture(self.fetcher.as_ref(), step, now)
                .await
                .map_err(|e| anyhow::anyhow!("prestate re-capture failed: {e}"))?;
            fresh.insert(capture.step_id.clone(), capture.fingerprint.clone());
            fresh_snapshots.insert(capture.step_id.clone(), capture.snapshot.clone());
        }
        let drifted = envelope.drifted_steps(&fresh);
        if !drifted.is_empty() {
            return Ok(RunOutcome::NeedApprovalAgain {
                code: ReasonCode::PrestateMismatch,
                details: serde_json::json!({
                    "drifted_steps": drifted,
                    "prestates": envelope.prestates,
                    "fresh": fresh,
                }),
            });
        }
        let mut failures = Vec::new();
        for step in &pending {
            if let Some(snapshot) = fresh_snapshots.get(&step.step_id) {
                failures.extend(evaluate_guards(&step.guards, snapshot));
            }
        }
        if !failures.is_empty() {
            return Ok(RunOutcome::GuardFailed {
                code: ReasonCode::GuardFailedPreExec,
                failures,
            });
        }

        // 5. Stamp approvals and re-run policy with the approved id.
        let mut plan = envelope.plan.clone();
        for step in plan.all_steps_mut() {
            if step.is_write_scoped() {
                step.approved_at = Some(now);
            }
        }
        let confidence = self.confidence.load(&fingerprint, now)?;
        let effective = self.config.autonomy_mode.effective(confidence.value);
        let requal_record = self.requal.load(&fingerprint, now)?;
        let normalized = command.normalized();
        let ctx = PolicyContext {
            execution_id,
            command: &normalized,
            domain_id: command.domain_id.as_deref(),
            approved_execution_id: Some(execution_id),
            now,
            runs_today: self.runs_today(now)?,
            requal_state: requal_record.state,
            autonomy_effective: effective,
        };
        match self.policy.evaluate(&plan, &ctx) {
            PolicyDecision::Allow => {}
            PolicyDecision::Deny { code, reason, .. } => {
                let outcome = self.deny(&fingerprint, now, Some(&plan), code, reason)?;
                return Ok(outcome);
            }
            PolicyDecision::RequireApproval { .. } => {
                anyhow::bail!(
                    "approval requirement survived an approved resume for '{execution_id}'"
                );
            }
        }

        // 6. Execute under the envelope's plan hash so idempotency keys
        // line up with the pre-approval capture.
        let report = self.executor.execute(&plan, &envelope.plan_hash).await?;
        let outcome = self.finish_execution(
            &plan,
            &envelope.plan_hash,
            &fingerprint,
            effective,
            report,
        )?;
        if matches!(outcome, RunOutcome::Success { .. }) {
            self.approvals.remove(execution_id)?;
        }
        Ok(outcome)
    }

    /// Shared post-execution bookkeeping: breaker, confidence, probation,
    /// and the final receipt.
    fn finish_execution(
        &self,
        plan: &ExecutionPlan,
        plan_hash: &str,
        fingerprint: &str,
        effective: AutonomyMode,
        report: ExecutionReport,
    ) -> anyhow::Result<RunOutcome> {
        let now = self.clock.now();
        let opened = self
            .governor
            .record_outcome(fingerprint, report.success, now)?;
        if let Some(opened) = opened
            && self.config.requalification_enabled
        {
            self.requalifier.on_breaker_opened(
                fingerprint,
                opened.opened_at,
                opened.cooldown_until,
            )?;
        }

        let mut builder = self
            .plan_receipt(plan, fingerprint, now, effective)
            .plan_hash(plan_hash)
            .steps(report.steps.clone());
        for artifact in &report.artifacts {
            builder = builder.artifact(artifact.clone());
        }
        if let (Some(planned), Some(executed)) = (report.phases_planned, report.phases_executed) {
            builder = builder.phases(planned, executed, None);
        }

        if report.success {
            self.confidence
                .apply(fingerprint, ConfidenceSignal::Success, now)?;
            if self.config.requalification_enabled {
                self.requalifier.record_success(fingerprint, now)?;
            }
            let receipt = builder.status(ReceiptStatus::Success).build();
            self.ledger.append_receipt(&receipt)?;
            info!(execution_id = %plan.execution_id, "run succeeded");
            Ok(RunOutcome::Success { receipt })
        } else {
            if self.config.requalification_enabled {
                self.requalifier.record_regression(fingerprint, now)?;
            }
            let reason = if report.interrupted {
                ReasonCode::Interrupted
            } else {
                ReasonCode::StepFailed
            };
            let receipt = builder
                .status(ReceiptStatus::Failed)
                .policy_denied(PolicyDenied {
                    code: reason,
                    reason: report
                        .failed_step
                        .map(|s| format!("step '{s}' failed"))
                        .unwrap_or_else(|| "execution failed".into()),
                    retry_after_secs: None,
                })
                .build();
            self.ledger.append_receipt(&receipt)?;
            Ok(RunOutcome::Failure { receipt })
        }
    }

    /// Emit a denial receipt and apply the policy-denial confidence
    /// signal.
    fn deny(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
        plan: Option<&ExecutionPlan>,
        code: ReasonCode,
        reason: String,
    ) -> anyhow::Result<RunOutcome> {
        let builder = match plan {
            Some(plan) => {
                let effective = self
                    .config
                    .autonomy_mode
                    .effective(self.confidence.load(fingerprint, now)?.value);
                self.plan_receipt(plan, fingerprint, now, effective)
            }
            None => self.receipt_builder(
                "execution",
                format!("denied-{}", now.timestamp_millis()),
                fingerprint,
                now,
            ),
        };
        let receipt = builder
            .status(ReceiptStatus::Denied)
            .policy_denied(PolicyDenied {
                code,
                reason,
                retry_after_secs: None,
            })
            .build();
        self.ledger.append_receipt(&receipt)?;
        let record = self
            .confidence
            .apply(fingerprint, ConfidenceSignal::PolicyDenial, now)?;
        if self.config.requalification_enabled {
            self.requalifier.record_regression(fingerprint, now)?;
        }
        self.confidence_guardrails(&record, now)?;
        Ok(RunOutcome::Denied { receipt })
    }

    /// Confidence-driven state transitions: the floor suspends, the
    /// probation threshold demotes. The suspension reuses the breaker
    /// cooldown so P5 still holds.
    fn confidence_guardrails(
        &self,
        record: &ger_state::ConfidenceRecord,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if self.config.requalification_enabled {
            let cooldown_until =
                now + chrono::Duration::seconds(self.config.breaker_cooldown_secs);
            self.requalifier
                .apply_confidence_thresholds(record, cooldown_until, now)?;
        }
        Ok(())
    }

    fn receipt_builder(
        &self,
        kind: &str,
        execution_id: String,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> ReceiptBuilder {
        ReceiptBuilder::new(kind, execution_id, fingerprint)
            .autonomy(self.config.autonomy_mode, self.config.autonomy_mode)
            .window(now, now)
    }

    fn plan_receipt(
        &self,
        plan: &ExecutionPlan,
        fingerprint: &str,
        now: DateTime<Utc>,
        effective: AutonomyMode,
    ) -> ReceiptBuilder {
        ReceiptBuilder::new("execution", plan.execution_id.clone(), fingerprint)
            .thread(plan.thread_id.clone(), plan.goal.clone())
            .dry_run(plan.dry_run)
            .autonomy(self.config.autonomy_mode, effective)
            .window(now, self.clock.now())
    }

    fn runs_today(&self, now: DateTime<Utc>) -> anyhow::Result<u32> {
        let today = now.date_naive();
        Ok(self
            .ledger
            .read_receipts()?
            .iter()
            .filter(|r| r.kind == "execution" && r.started_at.date_naive() == today)
            .count() as u32)
    }
}

enum PlanOrOutcome {
    Plan(ExecutionPlan),
    Outcome(RunOutcome),
}

fn phase_of(plan: &ExecutionPlan, step_id: &str) -> Option<String> {
    plan.phases
        .iter()
        .find(|p| p.steps.iter().any(|s| s.step_id == step_id))
        .map(|p| p.phase_id.clone())
}
