// SPDX-License-Identifier: MIT OR Apache-2.0
//! Idempotency records: TTL-bounded write dedup.

use crate::StateError;
use chrono::{DateTime, Duration, Utc};
use ger_ledger::Ledger;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Proof that a write-scoped step's effect was committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IdempotencyRecord {
    /// Derived or explicit idempotency key.
    pub key: String,
    /// Execution that committed the effect.
    pub execution_id: String,
    /// Plan hash the key was derived under.
    pub plan_hash: String,
    /// Step that committed the effect.
    pub step_id: String,
    /// Commit time.
    pub completed_at: DateTime<Utc>,
    /// SHA-256 digest of the adapter response.
    pub response_digest: String,
}

/// File-backed idempotency store with a configurable TTL.
#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    ledger: Ledger,
    ttl_days: i64,
}

impl IdempotencyStore {
    /// Store backed by the given ledger root; records older than
    /// `ttl_days` are treated as absent.
    #[must_use]
    pub fn new(ledger: Ledger, ttl_days: i64) -> Self {
        Self { ledger, ttl_days }
    }

    /// Look up a record by key, honoring the TTL.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StateError> {
        let path = self.ledger.idempotency_path(key);
        let record: Option<IdempotencyRecord> = self.ledger.read_json(&path)?;
        Ok(record.filter(|r| now - r.completed_at <= Duration::days(self.ttl_days)))
    }

    /// Persist a record.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn put(&self, record: &IdempotencyRecord) -> Result<(), StateError> {
        let path = self.ledger.idempotency_path(&record.key);
        self.ledger.write_json_atomic(&path, record)?;
        Ok(())
    }

    /// True when every key has a live record.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn has_all<'a, I>(&self, keys: I, now: DateTime<Utc>) -> Result<bool, StateError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for key in keys {
            if self.get(key, now)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
