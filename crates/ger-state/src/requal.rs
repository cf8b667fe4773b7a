// SPDX-License-Identifier: MIT OR Apache-2.0
//! Requalification lifecycle state and events.
//!
//! State files are last-writer-wins; events are append-only files with a
//! millisecond-epoch suffix so filename order replays history.

use crate::StateError;
use chrono::{DateTime, Utc};
use ger_ledger::Ledger;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Lifecycle state of a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequalState {
    /// Normal operation.
    Active,
    /// Collecting successes after a suspension or decay.
    Probation,
    /// Blocked; only the cooldown watcher can move it forward.
    Suspended,
    /// Probation complete; awaiting explicit operator activation.
    Eligible,
}

/// Persisted requalification record for one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequalRecord {
    /// Governance fingerprint.
    pub fingerprint: String,
    /// Current lifecycle state.
    pub state: RequalState,
    /// Why the fingerprint entered this state.
    pub cause: String,
    /// When the state was entered.
    pub since: DateTime<Utc>,
    /// Suspension end; only meaningful while `Suspended`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Last explicit operator activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    /// Last confidence-decay transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decayed_at: Option<DateTime<Utc>>,
    /// Probation successes so far; resets on any regression.
    #[serde(default)]
    pub successes: u32,
    /// Successes required to complete probation.
    #[serde(default)]
    pub required_successes: u32,
}

impl RequalRecord {
    /// Fresh ACTIVE record.
    #[must_use]
    pub fn active(fingerprint: &str, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            state: RequalState::Active,
            cause: "INITIAL".into(),
            since: now,
            cooldown_until: None,
            activated_at: None,
            decayed_at: None,
            successes: 0,
            required_successes: 0,
        }
    }
}

/// Append-only requalification event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequalEvent {
    /// Event kind, e.g. `GOVERNOR_CIRCUIT_OPEN`, `AutonomyStateTransition`,
    /// `RequalificationRecommended`, `ConfidenceDecayed`.
    pub kind: String,
    /// Fingerprint the event concerns.
    pub fingerprint: String,
    /// When the event occurred.
    pub at: DateTime<Utc>,
    /// State before the transition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<RequalState>,
    /// State after the transition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<RequalState>,
    /// Transition cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Free-form detail payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// File-backed requalification store.
#[derive(Debug, Clone)]
pub struct RequalStore {
    ledger: Ledger,
}

impl RequalStore {
    /// Store backed by the given ledger root.
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Load the record for a fingerprint; unseen fingerprints are ACTIVE.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn load(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<RequalRecord, StateError> {
        let path = self.ledger.requalification_state_path(fingerprint);
        Ok(self
            .ledger
            .read_json(&path)?
            .unwrap_or_else(|| RequalRecord::active(fingerprint, now)))
    }

    /// Persist a record (atomic rename).
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn save(&self, record: &RequalRecord) -> Result<(), StateError> {
        let path = self.ledger.requalification_state_path(&record.fingerprint);
        self.ledger.write_json_atomic(&path, record)?;
        info!(
            fingerprint = %record.fingerprint,
            state = ?record.state,
            cause = %record.cause,
            "requalification state saved"
        );
        Ok(())
    }

    /// Load every persisted record, sorted by fingerprint.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures; corrupt files fail loudly.
    pub fn list(&self) -> Result<Vec<RequalRecord>, StateError> {
        let mut records = Vec::new();
        for path in self.ledger.list_dir("requalification/state")? {
            if let Some(record) = self.ledger.read_json::<RequalRecord>(&path)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(records)
    }

    /// Append an event file named `<fingerprint>.<epoch_millis>.json`.
    ///
    /// Two events for one fingerprint in the same millisecond probe
    /// forward until a free timestamp slot is found, so no event is ever
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn write_event(&self, event: &RequalEvent) -> Result<std::path::PathBuf, StateError> {
        let mut millis = event.at.timestamp_millis();
        let mut path = self
            .ledger
            .requalification_event_path(&event.fingerprint, millis);
        while path.exists() {
            millis += 1;
            path = self
                .ledger
                .requalification_event_path(&event.fingerprint, millis);
        }
        self.ledger.write_json_atomic(&path, event)?;
        Ok(path)
    }

    /// Read all events in filename (time) order.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn read_events(&self) -> Result<Vec<RequalEvent>, StateError> {
        let mut events = Vec::new();
        for path in self.ledger.list_dir("requalification/events")? {
            if let Some(event) = self.ledger.read_json::<RequalEvent>(&path)? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RequalStore, DateTime<Utc>) {
        let dir = TempDir::new().unwrap();
        let store = RequalStore::new(Ledger::new(dir.path()));
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        (dir, store, now)
    }

    #[test]
    fn unseen_fingerprint_is_active() {
        let (_dir, store, now) = setup();
        let record = store.load("fp", now).unwrap();
        assert_eq!(record.state, RequalState::Active);
        assert_eq!(record.cause, "INITIAL");
    }

    #[test]
    fn save_and_reload() {
        let (_dir, store, now) = setup();
        let mut record = RequalRecord::active("fp", now);
        record.state = RequalState::Suspended;
        record.cause = "GOVERNOR_CIRCUIT_OPEN".into();
        record.cooldown_until = Some(now + chrono::Duration::seconds(60));
        store.save(&record).unwrap();

        let loaded = store.load("fp", now).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn list_returns_sorted_records() {
        let (_dir, store, now) = setup();
        store.save(&RequalRecord::active("zz", now)).unwrap();
        store.save(&RequalRecord::active("aa", now)).unwrap();
        let records = store.list().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fingerprint, "aa");
        assert_eq!(records[1].fingerprint, "zz");
    }

    #[test]
    fn events_replay_in_time_order() {
        let (_dir, store, now) = setup();
        for (i, kind) in ["GOVERNOR_CIRCUIT_OPEN", "AutonomyStateTransition"]
            .iter()
            .enumerate()
        {
            store
                .write_event(&RequalEvent {
                    kind: (*kind).into(),
                    fingerprint: "fp".into(),
                    at: now + chrono::Duration::milliseconds(i as i64),
                    from_state: None,
                    to_state: None,
                    cause: None,
                    details: None,
                })
                .unwrap();
        }
        let events = store.read_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "GOVERNOR_CIRCUIT_OPEN");
        assert_eq!(events[1].kind, "AutonomyStateTransition");
    }

    #[test]
    fn state_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&RequalState::Suspended).unwrap(),
            r#""SUSPENDED""#
        );
        assert_eq!(
            serde_json::to_string(&RequalState::Eligible).unwrap(),
            r#""ELIGIBLE""#
        );
    }
}
