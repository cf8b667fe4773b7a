// SPDX-License-Identifier: MIT OR Apache-2.0
//! Confidence: a per-fingerprint scalar in [0,1].
//!
//! Moved only by the four named signals; never auto-recovers. The record
//! also keeps recent success timestamps so the decay check can count
//! successes inside its rolling horizon.

use crate::StateError;
use chrono::{DateTime, Duration, Utc};
use ger_ledger::Ledger;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Success history is pruned beyond this window; comfortably larger than
/// any configurable decay horizon.
const SUCCESS_HISTORY_DAYS: i64 = 30;

/// The only inputs that move confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceSignal {
    /// Run completed successfully.
    Success,
    /// Policy denied the run.
    PolicyDenial,
    /// Governor throttled the run.
    Throttle,
    /// Operator rolled the execution back.
    Rollback,
}

impl ConfidenceSignal {
    /// Signed delta applied to the confidence scalar.
    #[must_use]
    pub fn delta(&self) -> f64 {
        match self {
            Self::Success => 0.02,
            Self::Throttle => -0.05,
            Self::PolicyDenial => -0.10,
            Self::Rollback => -0.20,
        }
    }
}

/// Persisted confidence state for one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfidenceRecord {
    /// Governance fingerprint.
    pub fingerprint: String,
    /// Confidence scalar in [0,1].
    pub value: f64,
    /// When the fingerprint was first governed.
    #[serde(default = "epoch")]
    pub first_seen_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Signal that produced the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_signal: Option<ConfidenceSignal>,
    /// Timestamps of recent successes, pruned to a bounded window.
    #[serde(default)]
    pub recent_successes: Vec<DateTime<Utc>>,
}

impl ConfidenceRecord {
    /// Fresh record at full confidence.
    #[must_use]
    pub fn fresh(fingerprint: &str, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            value: 1.0,
            first_seen_at: now,
            updated_at: now,
            last_signal: None,
            recent_successes: Vec::new(),
        }
    }

    /// Count successes at or after `since`.
    #[must_use]
    pub fn successes_since(&self, since: DateTime<Utc>) -> usize {
        self.recent_successes.iter().filter(|t| **t >= since).count()
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// File-backed confidence store.
#[derive(Debug, Clone)]
pub struct ConfidenceStore {
    ledger: Ledger,
}

impl ConfidenceStore {
    /// Store backed by the given ledger root.
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Load the record for a fingerprint; a fingerprint never seen before
    /// starts at full confidence.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn load(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<ConfidenceRecord, StateError> {
        let path = self.ledger.confidence_path(fingerprint);
        Ok(self
            .ledger
            .read_json(&path)?
            .unwrap_or_else(|| ConfidenceRecord::fresh(fingerprint, now)))
    }

    /// Apply a signal and persist: clamp to [0,1], record success
    /// timestamps, prune history.
    ///
    /// Returns the updated record.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn apply(
        &self,
        fingerprint: &str,
        signal: ConfidenceSignal,
        now: DateTime<Utc>,
    ) -> Result<ConfidenceRecord, StateError> {
        let mut record = self.load(fingerprint, now)?;
        // Deltas are hundredths; rounding keeps the trajectory exact so
        // threshold comparisons never miss by accumulated float error.
        let next = (record.value + signal.delta()).clamp(0.0, 1.0);
        record.value = (next * 100.0).round() / 100.0;
        record.updated_at = now;
        record.last_signal = Some(signal);
        if signal == ConfidenceSignal::Success {
            record.recent_successes.push(now);
        }
        let horizon = now - Duration::days(SUCCESS_HISTORY_DAYS);
        record.recent_successes.retain(|t| *t >= horizon);
        self.save(&record)?;
        debug!(fingerprint, value = record.value, ?signal, "confidence updated");
        Ok(record)
    }

    /// Persist a record as-is.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn save(&self, record: &ConfidenceRecord) -> Result<(), StateError> {
        let path = self.ledger.confidence_path(&record.fingerprint);
        self.ledger.write_json_atomic(&path, record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ConfidenceStore, DateTime<Utc>) {
        let dir = TempDir::new().unwrap();
        let store = ConfidenceStore::new(Ledger::new(dir.path()));
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        (dir, store, now)
    }

    #[test]
    fn unseen_fingerprint_starts_at_full_confidence() {
        let (_dir, store, now) = setup();
        let record = store.load("fp", now).unwrap();
        assert_eq!(record.value, 1.0);
        assert!(record.last_signal.is_none());
    }

    #[test]
    fn signals_apply_documented_deltas() {
        let (_dir, store, now) = setup();
        let r = store.apply("fp", ConfidenceSignal::PolicyDenial, now).unwrap();
        assert!((r.value - 0.90).abs() < 1e-9);
        let r = store.apply("fp", ConfidenceSignal::Throttle, now).unwrap();
        assert!((r.value - 0.85).abs() < 1e-9);
        let r = store.apply("fp", ConfidenceSignal::Rollback, now).unwrap();
        assert!((r.value - 0.65).abs() < 1e-9);
        let r = store.apply("fp", ConfidenceSignal::Success, now).unwrap();
        assert!((r.value - 0.67).abs() < 1e-9);
    }

    #[test]
    fn confidence_clamps_at_bounds() {
        let (_dir, store, now) = setup();
        let r = store.apply("fp", ConfidenceSignal::Success, now).unwrap();
        assert_eq!(r.value, 1.0);
        for _ in 0..10 {
            store.apply("fp", ConfidenceSignal::Rollback, now).unwrap();
        }
        let r = store.load("fp", now).unwrap();
        assert_eq!(r.value, 0.0);
    }

    #[test]
    fn success_history_counts_within_horizon() {
        let (_dir, store, now) = setup();
        store.apply("fp", ConfidenceSignal::Success, now).unwrap();
        store
            .apply("fp", ConfidenceSignal::Success, now + Duration::hours(1))
            .unwrap();
        let record = store.load("fp", now).unwrap();
        assert_eq!(record.successes_since(now), 2);
        assert_eq!(record.successes_since(now + Duration::minutes(30)), 1);
    }

    #[test]
    fn history_prunes_past_bounded_window() {
        let (_dir, store, now) = setup();
        store.apply("fp", ConfidenceSignal::Success, now).unwrap();
        let later = now + Duration::days(SUCCESS_HISTORY_DAYS + 1);
        let record = store.apply("fp", ConfidenceSignal::Success, later).unwrap();
        assert_eq!(record.recent_successes.len(), 1);
    }

    #[test]
    fn state_persists_across_store_instances() {
        let (dir, store, now) = setup();
        store.apply("fp", ConfidenceSignal::PolicyDenial, now).unwrap();
        drop(store);
        let store2 = ConfidenceStore::new(Ledger::new(dir.path()));
        let r = store2.load("fp", now).unwrap();
        assert!((r.value - 0.90).abs() < 1e-9);
    }
}
