// SPDX-License-Identifier: MIT OR Apache-2.0
//! Approval envelopes: paused plans awaiting operator authorization.
//!
//! An envelope pins the exact plan hash and the prestate fingerprint of
//! every pending write-scoped step. Resume presents the same hash and
//! re-captures each prestate; any mismatch is drift and sends the plan
//! back for re-approval.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use ger_core::ExecutionPlan;
use ger_ledger::Ledger;
use ger_registry::ResolvedCapability;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Errors from approval persistence and validation.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// Persistence failure from the ledger layer.
    #[error(transparent)]
    Ledger(#[from] ger_ledger::LedgerError),
    /// No envelope exists for the execution.
    #[error("no approval state for execution '{execution_id}'")]
    NotFound {
        /// Requested execution.
        execution_id: String,
    },
}

/// Plan shape recorded in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// The plan carries phases.
    Phased,
    /// The plan is a flat step list.
    Legacy,
}

/// A paused plan pinned to its hash and prestates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalEnvelope {
    /// Execution awaiting approval.
    pub execution_id: String,
    /// Raw operator command that produced the plan.
    pub command: String,
    /// Domain extracted from the command, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    /// When the envelope was persisted.
    pub created_at: DateTime<Utc>,
    /// Always `awaiting_approval`; stored for ledger greppability.
    pub status: String,
    /// Hash the resume must present.
    pub plan_hash: String,
    /// Plan shape.
    pub mode: ApprovalMode,
    /// The full paused plan.
    pub plan: ExecutionPlan,
    /// Phases in the plan (phased mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases_planned: Option<u32>,
    /// Phases already executed before the pause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases_executed: Option<u32>,
    /// Write-scoped steps still pending.
    pub pending_step_ids: Vec<String>,
    /// Prestate fingerprint per pending step.
    pub prestates: BTreeMap<String, String>,
    /// Capability resolution captured at pause time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_capabilities: Vec<ResolvedCapability>,
    /// When the original run started.
    pub started_at: DateTime<Utc>,
}

impl ApprovalEnvelope {
    /// Steps whose stored prestate fingerprint differs from the fresh
    /// capture. `fresh` maps step id → recomputed fingerprint.
    #[must_use]
    pub fn drifted_steps(&self, fresh: &BTreeMap<String, String>) -> Vec<String> {
        self.pending_step_ids
            .iter()
            .filter(|step_id| {
                self.prestates.get(*step_id) != fresh.get(*step_id)
            })
            .cloned()
            .collect()
    }
}

/// File-backed envelope store under `runs/approval/`.
#[derive(Debug, Clone)]
pub struct ApprovalStore {
    ledger: Ledger,
}

impl ApprovalStore {
    /// Store backed by the given ledger root.
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Persist an envelope (atomic rename).
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn save(&self, envelope: &ApprovalEnvelope) -> Result<std::path::PathBuf, ApprovalError> {
        let path = self.ledger.approval_path(&envelope.execution_id);
        self.ledger.write_json_atomic(&path, envelope)?;
        info!(
            execution_id = %envelope.execution_id,
            plan_hash = %envelope.plan_hash,
            pending = envelope.pending_step_ids.len(),
            "approval envelope persisted"
        );
        Ok(path)
    }

    /// Load the envelope for an execution.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`] when absent; ledger failures otherwise.
    pub fn load(&self, execution_id: &str) -> Result<ApprovalEnvelope, ApprovalError> {
        let path = self.ledger.approval_path(execution_id);
        self.ledger
            .read_json(&path)?
            .ok_or_else(|| ApprovalError::NotFound {
                execution_id: execution_id.to_string(),
            })
    }

    /// Remove a consumed envelope.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn remove(&self, execution_id: &str) -> Result<(), ApprovalError> {
        let path = self.ledger.approval_path(execution_id);
        self.ledger.remove(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ger_core::Step;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn envelope() -> ApprovalEnvelope {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut step = Step::new("w1", "notion.live.write");
        step.approval_scoped = true;
        let plan = ExecutionPlan {
            execution_id: "exec-1".into(),
            thread_id: "t1".into(),
            goal: "g".into(),
            dry_run: false,
            agent_versions: BTreeMap::new(),
            required_capabilities: BTreeSet::new(),
            steps: vec![step],
            phases: vec![],
        };
        let plan_hash = plan.plan_hash().unwrap();
        ApprovalEnvelope {
            execution_id: "exec-1".into(),
            command: "@ops:update docket".into(),
            domain_id: Some("ops".into()),
            created_at: now,
            status: "awaiting_approval".into(),
            plan_hash,
            mode: ApprovalMode::Legacy,
            plan,
            phases_planned: None,
            phases_executed: None,
            pending_step_ids: vec!["w1".into()],
            prestates: BTreeMap::from([("w1".to_string(), "fp-snapshot".to_string())]),
            resolved_capabilities: vec![],
            started_at: now,
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(Ledger::new(dir.path()));
        let env = envelope();
        let path = store.save(&env).unwrap();
        assert!(path.ends_with("approval/exec-1.json"));
        assert_eq!(store.load("exec-1").unwrap(), env);
    }

    #[test]
    fn load_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(Ledger::new(dir.path()));
        let err = store.load("ghost").unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound { .. }));
    }

    #[test]
    fn remove_consumes_the_envelope() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(Ledger::new(dir.path()));
        store.save(&envelope()).unwrap();
        store.remove("exec-1").unwrap();
        assert!(store.load("exec-1").is_err());
        // Removing twice is fine.
        store.remove("exec-1").unwrap();
    }

    #[test]
    fn drift_detection_compares_fingerprints() {
        let env = envelope();
        let same = BTreeMap::from([("w1".to_string(), "fp-snapshot".to_string())]);
        assert!(env.drifted_steps(&same).is_empty());

        let changed = BTreeMap::from([("w1".to_string(), "fp-other".to_string())]);
        assert_eq!(env.drifted_steps(&changed), vec!["w1"]);

        // A missing fresh capture also counts as drift.
        let missing = BTreeMap::new();
        assert_eq!(env.drifted_steps(&missing), vec!["w1"]);
    }
}
