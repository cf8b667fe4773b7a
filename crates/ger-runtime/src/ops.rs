// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operator operations outside the main execution pipeline: rollback,
//! requalification maintenance, promotion reports, rankings, and audit
//! export.

use crate::{Orchestrator, RunOutcome};
use chrono::{DateTime, Utc};
use ger_core::{ExecutionPlan, ReceiptStatus, Step};
use ger_prestate::{CapturedPrestate, redact};
use ger_state::ConfidenceSignal;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

impl Orchestrator {
    /// `/rollback <execution_id>`: build a compensation plan from the
    /// stored prestates, persist it as a `rollback.plan` artifact, decay
    /// confidence, and emit a rollback receipt.
    ///
    /// The compensation plan is emitted, not executed; running it is an
    /// ordinary governed command, and previously committed writes stay
    /// committed behind their idempotency keys.
    ///
    /// # Errors
    ///
    /// Internal persistence failures only.
    pub fn rollback(&self, execution_id: &str) -> anyhow::Result<RunOutcome> {
        let now = self.clock.now();
        let Some(original) = self.ledger.last_receipt_by_execution(execution_id)? else {
            return Ok(RunOutcome::NeedInput {
                question: format!("no receipts for execution '{execution_id}'"),
            });
        };

        let prestates = self.stored_prestates(execution_id)?;
        if prestates.is_empty() {
            return Ok(RunOutcome::NeedInput {
                question: format!("no prestates stored for execution '{execution_id}'"),
            });
        }

        let steps: Vec<Step> = prestates
            .iter()
            .map(|capture| {
                let mut step = Step::new(
                    format!("restore-{}", capture.step_id),
                    "notion.live.write",
                );
                step.approval_scoped = true;
                step.notion_path = Some(capture.path.clone());
                step.payload = Some(capture.snapshot.clone());
                step
            })
            .collect();
        let plan = ExecutionPlan {
            execution_id: format!("rollback-{execution_id}"),
            thread_id: original.thread_id.clone(),
            goal: format!("restore prestates of {execution_id}"),
            dry_run: false,
            agent_versions: BTreeMap::new(),
            required_capabilities: Default::default(),
            steps,
            phases: vec![],
        };
        let artifact = self.ledger.write_artifact(
            "rollback.plan",
            execution_id,
            "plan",
            &plan,
        )?;

        let record = self
            .confidence
            .apply(&original.fingerprint, ConfidenceSignal::Rollback, now)?;
        if self.config.requalification_enabled {
            self.requalifier
                .record_regression(&original.fingerprint, now)?;
        }
        self.confidence_guardrails(&record, now)?;

        let receipt = self
            .receipt_builder(
                "rollback",
                plan.execution_id.clone(),
                &original.fingerprint,
                now,
            )
            .thread(original.thread_id.clone(), plan.goal.clone())
            .plan_hash(plan.plan_hash()?)
            .status(ReceiptStatus::Success)
            .artifact(artifact.display().to_string())
            .build();
        self.ledger.append_receipt(&receipt)?;
        info!(execution_id, steps = prestates.len(), "compensation plan emitted");
        Ok(RunOutcome::Success { receipt })
    }

    /// `/autonomy requalify scan`: run the cooldown watcher over every
    /// persisted state and report the transitions.
    ///
    /// # Errors
    ///
    /// Internal persistence failures only.
    pub fn requalify_scan(&self) -> anyhow::Result<RunOutcome> {
        let now = self.clock.now();
        let transitioned = self.requalifier.cooldown_scan(now)?;
        Ok(RunOutcome::Report {
            report: json!({
                "scanned_at": now,
                "transitioned": transitioned,
            }),
        })
    }

    /// `/autonomy requalify activate <fingerprint>`: explicit operator
    /// activation. Requires a global approver grant (`*:approver`).
    ///
    /// # Errors
    ///
    /// Internal persistence failures only; refusals are reported as
    /// outcomes.
    pub fn requalify_activate(&self, fingerprint: &str) -> anyhow::Result<RunOutcome> {
        let now = self.clock.now();
        let authorized = self.config.operator_has_role("*", "approver");
        match self
            .requalifier
            .activate(fingerprint, "*", authorized, now)
        {
            Ok(record) => Ok(RunOutcome::Report {
                report: json!({"activated": record}),
            }),
            Err(e @ (ger_requalify::RequalifyError::NotEligible { .. }
            | ger_requalify::RequalifyError::NotAuthorized { .. })) => {
                Ok(RunOutcome::NeedInput {
                    question: e.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `/autonomy promote recommend`: read-only report of ELIGIBLE
    /// fingerprints with their confidence.
    ///
    /// # Errors
    ///
    /// Internal persistence failures only.
    pub fn promote_recommend(&self) -> anyhow::Result<RunOutcome> {
        let now = self.clock.now();
        let mut candidates = Vec::new();
        for record in self.requalifier.recommendations()? {
            let confidence = self.confidence.load(&record.fingerprint, now)?;
            candidates.push(json!({
                "fingerprint": record.fingerprint,
                "cause": record.cause,
                "since": record.since,
                "confidence": confidence.value,
            }));
        }
        Ok(RunOutcome::Report {
            report: json!({"candidates": candidates}),
        })
    }

    /// `/rankings compute [days]`: per-fingerprint outcome rankings over
    /// the lookback window.
    ///
    /// # Errors
    ///
    /// Internal persistence failures only.
    pub fn rankings_compute(&self, days: i64) -> anyhow::Result<RunOutcome> {
        let now = self.clock.now();
        let since = now - chrono::Duration::days(days);

        #[derive(Default)]
        struct Tally {
            runs: u64,
            successes: u64,
            failures: u64,
            denials: u64,
            throttles: u64,
        }
        let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
        for receipt in self.ledger.read_receipts()? {
            if receipt.kind != "execution" || receipt.started_at < since {
                continue;
            }
            let tally = tallies.entry(receipt.fingerprint.clone()).or_default();
            tally.runs += 1;
            match receipt.status {
                ReceiptStatus::Success => tally.successes += 1,
                ReceiptStatus::Failed => tally.failures += 1,
                ReceiptStatus::Denied => tally.denials += 1,
                ReceiptStatus::Throttled => tally.throttles += 1,
                ReceiptStatus::AwaitingApproval => {}
            }
        }

        let mut rankings: Vec<serde_json::Value> = tallies
            .iter()
            .map(|(fingerprint, t)| {
                let rate = if t.runs == 0 {
                    0.0
                } else {
                    t.successes as f64 / t.runs as f64
                };
                json!({
                    "fingerprint": fingerprint,
                    "runs": t.runs,
                    "successes": t.successes,
                    "failures": t.failures,
                    "denials": t.denials,
                    "throttles": t.throttles,
                    "success_rate": rate,
                })
            })
            .collect();
        rankings.sort_by(|a, b| {
            let ra = a["success_rate"].as_f64().unwrap_or(0.0);
            let rb = b["success_rate"].as_f64().unwrap_or(0.0);
            rb.partial_cmp(&ra)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b["runs"]
                        .as_u64()
                        .unwrap_or(0)
                        .cmp(&a["runs"].as_u64().unwrap_or(0))
                })
        });
        Ok(RunOutcome::Report {
            report: json!({"window_days": days, "rankings": rankings}),
        })
    }

    /// `/audit export <execution_id|{"since_iso":…}>`: deterministic
    /// bundle of receipts, artifacts, and prestates, redacted unless the
    /// operator allowed raw export.
    ///
    /// # Errors
    ///
    /// Internal persistence failures only.
    pub fn audit_export(&self, selector: &str) -> anyhow::Result<RunOutcome> {
        let redacted = !self.config.allow_unredacted_audit_export;

        if selector.trim_start().starts_with('{') {
            #[derive(serde::Deserialize)]
            struct Selector {
                since_iso: DateTime<Utc>,
            }
            let parsed: Selector = serde_json::from_str(selector)
                .map_err(|e| anyhow::anyhow!("bad audit selector: {e}"))?;
            let receipts: Vec<_> = self
                .ledger
                .read_receipts()?
                .into_iter()
                .filter(|r| r.started_at >= parsed.since_iso)
                .collect();
            let bundle = json!({
                "since_iso": parsed.since_iso,
                "redacted": redacted,
                "receipts": receipts,
            });
            let name = format!("since-{}", parsed.since_iso.timestamp_millis());
            let path = self.ledger.audit_path(&name);
            self.ledger.write_json_atomic(&path, &bundle)?;
            return Ok(RunOutcome::Report {
                report: json!({
                    "bundle_path": path.display().to_string(),
                    "receipts": receipts.len(),
                }),
            });
        }

        let execution_id = selector.trim();
        let receipts: Vec<_> = self
            .ledger
            .read_receipts()?
            .into_iter()
            .filter(|r| r.execution_id == execution_id)
            .collect();
        if receipts.is_empty() {
            return Ok(RunOutcome::NeedInput {
                question: format!("no receipts for execution '{execution_id}'"),
            });
        }

        let mut artifacts = Vec::new();
        for path in self.ledger.list_artifacts(execution_id)? {
            if let Some(payload) = self.ledger.read_json::<serde_json::Value>(&path)? {
                let payload = if redacted { redact(&payload) } else { payload };
                artifacts.push(json!({
                    "path": path.display().to_string(),
                    "payload": payload,
                }));
            }
        }
        let prestates: Vec<serde_json::Value> = self
            .stored_prestates(execution_id)?
            .into_iter()
            .map(|capture| {
                let snapshot = if redacted {
                    redact(&capture.snapshot)
                } else {
                    capture.snapshot.clone()
                };
                json!({
                    "step_id": capture.step_id,
                    "path": capture.path,
                    "captured_at": capture.captured_at,
                    "fingerprint": capture.fingerprint,
                    "snapshot": snapshot,
                })
            })
            .collect();

        let bundle = json!({
            "execution_id": execution_id,
            "redacted": redacted,
            "receipts": receipts,
            "artifacts": artifacts,
            "prestates": prestates,
        });
        let path = self.ledger.audit_path(execution_id);
        self.ledger.write_json_atomic(&path, &bundle)?;
        info!(execution_id, redacted, "audit bundle exported");
        Ok(RunOutcome::Report {
            report: json!({
                "bundle_path": path.display().to_string(),
                "receipts": receipts.len(),
                "artifacts": artifacts.len(),
                "prestates": prestates.len(),
            }),
        })
    }

    /// Stored prestate captures for an execution, sorted by step id.
    fn stored_prestates(&self, execution_id: &str) -> anyhow::Result<Vec<CapturedPrestate>> {
        let prefix = format!("{}.", ger_ledger::safe_component(execution_id));
        let mut captures = Vec::new();
        for path in self.ledger.list_dir("prestate")? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) {
                continue;
            }
            if let Some(capture) = self.ledger.read_json::<CapturedPrestate>(&path)? {
                captures.push(capture);
            }
        }
        captures.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(captures)
    }
}
