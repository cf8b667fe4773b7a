// SPDX-License-Identifier: MIT OR Apache-2.0
//! Requalification lifecycle.
//!
//! The lifecycle is `ACTIVE → PROBATION → SUSPENDED → ELIGIBLE → ACTIVE`.
//! Suspensions end only through the cooldown watcher; probation completes
//! only through counted successes; and reactivation is never automatic:
//! an operator with the approver role must activate an ELIGIBLE
//! fingerprint explicitly.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use ger_core::{AutonomyMode, ReceiptBuilder, ReceiptStatus};
use ger_ledger::Ledger;
use ger_state::{
    ConfidenceRecord, RequalEvent, RequalRecord, RequalState, RequalStore, StateError,
};
use tracing::info;

/// Errors from lifecycle transitions.
#[derive(Debug, thiserror::Error)]
pub enum RequalifyError {
    /// State persistence failed.
    #[error(transparent)]
    State(#[from] StateError),
    /// Ledger persistence failed.
    #[error(transparent)]
    Ledger(#[from] ger_ledger::LedgerError),
    /// Activation attempted from a state other than ELIGIBLE.
    #[error("fingerprint '{fingerprint}' is {state:?}, not ELIGIBLE")]
    NotEligible {
        /// Fingerprint that was targeted.
        fingerprint: String,
        /// Its actual state.
        state: RequalState,
    },
    /// Activation attempted without the approver role.
    #[error("operator lacks the approver role for domain '{domain}'")]
    NotAuthorized {
        /// Domain whose role check failed.
        domain: String,
    },
}

/// Drives the requalification lifecycle against the stores.
#[derive(Debug, Clone)]
pub struct Requalifier {
    requal: RequalStore,
    ledger: Ledger,
    required_probation_successes: u32,
    decay_horizon_hours: i64,
    required_successes_in_horizon: u32,
    autonomy_mode: AutonomyMode,
}

impl Requalifier {
    /// Build a requalifier with explicit tunables.
    #[must_use]
    pub fn new(
        requal: RequalStore,
        ledger: Ledger,
        required_probation_successes: u32,
        decay_horizon_hours: i64,
        required_successes_in_horizon: u32,
        autonomy_mode: AutonomyMode,
    ) -> Self {
        Self {
            requal,
            ledger,
            required_probation_successes,
            decay_horizon_hours,
            required_successes_in_horizon,
            autonomy_mode,
        }
    }

    /// Cooldown watcher: every SUSPENDED fingerprint whose cooldown has
    /// elapsed re-enters PROBATION. Runs once at invocation start and on
    /// `requalify scan`.
    ///
    /// Each transition appends an `autonomy_transition` receipt and an
    /// `AutonomyStateTransition` event.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn cooldown_scan(&self, now: DateTime<Utc>) -> Result<Vec<RequalRecord>, RequalifyError> {
        let mut transitioned = Vec::new();
        for record in self.requal.list()? {
            if record.state == RequalState::Suspended
                && record.cooldown_until.is_some_and(|until| now >= until)
            {
                let updated = self.enter_probation(record, "COOLDOWN_ELAPSED", now)?;
                transitioned.push(updated);
            }
        }
        Ok(transitioned)
    }

    fn enter_probation(
        &self,
        mut record: RequalRecord,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Result<RequalRecord, RequalifyError> {
        let from = record.state;
        record.state = RequalState::Probation;
        record.cause = cause.to_string();
        record.since = now;
        record.cooldown_until = None;
        record.successes = 0;
        record.required_successes = self.required_probation_successes;
        self.requal.save(&record)?;
        self.requal.write_event(&RequalEvent {
            kind: "AutonomyStateTransition".into(),
            fingerprint: record.fingerprint.clone(),
            at: now,
            from_state: Some(from),
            to_state: Some(RequalState::Probation),
            cause: Some(cause.to_string()),
            details: None,
        })?;
        let receipt = ReceiptBuilder::new(
            "autonomy_transition",
            format!("autonomy-{}", now.timestamp_millis()),
            record.fingerprint.clone(),
        )
        .status(ReceiptStatus::Success)
        .autonomy(self.autonomy_mode, self.autonomy_mode)
        .window(now, now)
        .thread("requalification", format!("{from:?} -> PROBATION ({cause})"))
        .build();
        self.ledger.append_receipt(&receipt)?;
        info!(fingerprint = %record.fingerprint, cause, "fingerprint entered probation");
        Ok(record)
    }

    /// Suspend a fingerprint after the breaker opened; writes the
    /// `GOVERNOR_CIRCUIT_OPEN` event.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn on_breaker_opened(
        &self,
        fingerprint: &str,
        opened_at: DateTime<Utc>,
        cooldown_until: DateTime<Utc>,
    ) -> Result<RequalRecord, RequalifyError> {
        let mut record = self.requal.load(fingerprint, opened_at)?;
        let from = record.state;
        record.state = RequalState::Suspended;
        record.cause = "GOVERNOR_CIRCUIT_OPEN".into();
        record.since = opened_at;
        record.cooldown_until = Some(cooldown_until);
        record.successes = 0;
        self.requal.save(&record)?;
        self.requal.write_event(&RequalEvent {
            kind: "GOVERNOR_CIRCUIT_OPEN".into(),
            fingerprint: fingerprint.to_string(),
            at: opened_at,
            from_state: Some(from),
            to_state: Some(RequalState::Suspended),
            cause: Some("GOVERNOR_CIRCUIT_OPEN".into()),
            details: Some(serde_json::json!({
                "cooldown_until": cooldown_until,
            })),
        })?;
        Ok(record)
    }

    /// Record a successful run. In PROBATION the success counter
    /// increments; completing the count promotes to ELIGIBLE and emits
    /// `RequalificationRecommended`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn record_success(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<RequalRecord, RequalifyError> {
        let mut record = self.requal.load(fingerprint, now)?;
        if record.state != RequalState::Probation {
            return Ok(record);
        }
        record.successes += 1;
        let required = if record.required_successes == 0 {
            self.required_probation_successes
        } else {
            record.required_successes
        };
        if record.successes >= required {
            record.state = RequalState::Eligible;
            record.cause = format!("PROBATION_SUCCESS_{}_OF_{required}", record.successes);
            record.since = now;
            self.requal.save(&record)?;
            self.requal.write_event(&RequalEvent {
                kind: "RequalificationRecommended".into(),
                fingerprint: fingerprint.to_string(),
                at: now,
                from_state: Some(RequalState::Probation),
                to_state: Some(RequalState::Eligible),
                cause: Some(record.cause.clone()),
                details: None,
            })?;
            info!(fingerprint, "probation complete, recommended for reactivation");
        } else {
            self.requal.save(&record)?;
        }
        Ok(record)
    }

    /// A regression (failure, policy denial, throttle) resets probation
    /// progress to zero.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn record_regression(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<RequalRecord, RequalifyError> {
        let mut record = self.requal.load(fingerprint, now)?;
        if record.state == RequalState::Probation && record.successes > 0 {
            record.successes = 0;
            self.requal.save(&record)?;
        }
        Ok(record)
    }

    /// Confidence floor and probation thresholds: confidence at or below
    /// 0.20 suspends the fingerprint (cooldown supplied by the caller);
    /// at or below 0.40 an ACTIVE fingerprint drops to probation.
    ///
    /// Returns the updated record when a transition happened.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn apply_confidence_thresholds(
        &self,
        confidence: &ConfidenceRecord,
        cooldown_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<RequalRecord>, RequalifyError> {
        let mut record = self.requal.load(&confidence.fingerprint, now)?;
        if confidence.value <= 0.20 && record.state != RequalState::Suspended {
            let from = record.state;
            record.state = RequalState::Suspended;
            record.cause = "CONFIDENCE_FLOOR".into();
            record.since = now;
            record.cooldown_until = Some(cooldown_until);
            record.successes = 0;
            self.requal.save(&record)?;
            self.requal.write_event(&RequalEvent {
                kind: "AutonomyStateTransition".into(),
                fingerprint: confidence.fingerprint.clone(),
                at: now,
                from_state: Some(from),
                to_state: Some(RequalState::Suspended),
                cause: Some("CONFIDENCE_FLOOR".into()),
                details: Some(serde_json::json!({
                    "confidence": confidence.value,
                    "cooldown_until": cooldown_until,
                })),
            })?;
            return Ok(Some(record));
        }
        if confidence.value <= 0.40 && record.state == RequalState::Active {
            let updated = self.enter_probation(record, "CONFIDENCE_THRESHOLD", now)?;
            return Ok(Some(updated));
        }
        Ok(None)
    }

    /// Confidence decay: an ACTIVE fingerprint past its first horizon with
    /// too few recent successes drops to PROBATION with cause
    /// `CONFIDENCE_DECAY` and emits `ConfidenceDecayed`.
    ///
    /// Returns the updated record when a decay happened.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn decay_check(
        &self,
        confidence: &ConfidenceRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<RequalRecord>, RequalifyError> {
        let record = self.requal.load(&confidence.fingerprint, now)?;
        if record.state != RequalState::Active {
            return Ok(None);
        }
        let horizon = Duration::hours(self.decay_horizon_hours);
        // Grace period: a fingerprint younger than one horizon cannot decay.
        if now - confidence.first_seen_at < horizon {
            return Ok(None);
        }
        let successes = confidence.successes_since(now - horizon);
        if successes >= self.required_successes_in_horizon as usize {
            return Ok(None);
        }
        let mut updated = self.enter_probation(record, "CONFIDENCE_DECAY", now)?;
        updated.decayed_at = Some(now);
        self.requal.save(&updated)?;
        self.requal.write_event(&RequalEvent {
            kind: "ConfidenceDecayed".into(),
            fingerprint: confidence.fingerprint.clone(),
            at: now,
            from_state: Some(RequalState::Active),
            to_state: Some(RequalState::Probation),
            cause: Some("CONFIDENCE_DECAY".into()),
            details: Some(serde_json::json!({
                "successes_in_horizon": successes,
                "required": self.required_successes_in_horizon,
                "horizon_hours": self.decay_horizon_hours,
            })),
        })?;
        Ok(Some(updated))
    }

    /// Explicit operator activation of an ELIGIBLE fingerprint.
    ///
    /// `authorized` is the caller's approver-role check for the
    /// fingerprint's domain; activation is refused without it.
    ///
    /// # Errors
    ///
    /// [`RequalifyError::NotEligible`] / [`RequalifyError::NotAuthorized`]
    /// on refusal, persistence failures otherwise.
    pub fn activate(
        &self,
        fingerprint: &str,
        domain: &str,
        authorized: bool,
        now: DateTime<Utc>,
    ) -> Result<RequalRecord, RequalifyError> {
        if !authorized {
            return Err(RequalifyError::NotAuthorized {
                domain: domain.to_string(),
            });
        }
        let mut record = self.requal.load(fingerprint, now)?;
        if record.state != RequalState::Eligible {
            return Err(RequalifyError::NotEligible {
                fingerprint: fingerprint.to_string(),
                state: record.state,
            });
        }
        let from = record.state;
        record.state = RequalState::Active;
        record.cause = "OPERATOR_ACTIVATED".into();
        record.since = now;
        record.activated_at = Some(now);
        record.successes = 0;
        record.required_successes = 0;
        self.requal.save(&record)?;
        self.requal.write_event(&RequalEvent {
            kind: "AutonomyStateTransition".into(),
            fingerprint: fingerprint.to_string(),
            at: now,
            from_state: Some(from),
            to_state: Some(RequalState::Active),
            cause: Some("OPERATOR_ACTIVATED".into()),
            details: None,
        })?;
        info!(fingerprint, "fingerprint reactivated by operator");
        Ok(record)
    }

    /// ELIGIBLE fingerprints, for the promotion report.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn recommendations(&self) -> Result<Vec<RequalRecord>, RequalifyError> {
        Ok(self
            .requal
            .list()?
            .into_iter()
            .filter(|r| r.state == RequalState::Eligible)
            .collect())
    }
}
