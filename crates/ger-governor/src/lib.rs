// SPDX-License-Identifier: MIT OR Apache-2.0
//! Governor: token bucket plus circuit breaker, keyed by fingerprint.
//!
//! State persists under `runs/governor/<fingerprint>.json` so throttling
//! survives the process: each invocation is a fresh process and the
//! bucket must carry over. The breaker counts consecutive non-success
//! outcomes; at the threshold it opens, and the caller suspends the
//! fingerprint and records a `GOVERNOR_CIRCUIT_OPEN` event.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use ger_error::ReasonCode;
use ger_ledger::Ledger;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Errors from governor persistence.
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    /// Persistence failure from the ledger layer.
    #[error(transparent)]
    Ledger(#[from] ger_ledger::LedgerError),
}

/// Circuit breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Tripped; denies until the cooldown elapses.
    Open,
    /// Cooldown elapsed; one trial run decides.
    HalfOpen,
}

/// Persisted governor state for one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GovernorRecord {
    /// Governance fingerprint.
    pub fingerprint: String,
    /// Tokens currently in the bucket.
    pub tokens: f64,
    /// Last refill instant.
    pub last_refill_at: DateTime<Utc>,
    /// Breaker phase.
    pub breaker: BreakerState,
    /// Consecutive non-success outcomes.
    pub failure_count: u32,
    /// When the breaker last opened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

impl GovernorRecord {
    fn fresh(fingerprint: &str, capacity: f64, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            tokens: capacity,
            last_refill_at: now,
            breaker: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
        }
    }
}

/// Outcome of one governor evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum GovernorDecision {
    /// One token consumed; the run may proceed.
    Allow,
    /// The run must not proceed.
    Deny {
        /// `RATE_LIMITED` or `CIRCUIT_OPEN`.
        code: ReasonCode,
        /// Seconds until a retry can succeed.
        retry_after_secs: f64,
    },
}

/// Emitted when recording an outcome trips the breaker; the caller
/// suspends the fingerprint and persists the requalification event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerOpened {
    /// When the breaker opened.
    pub opened_at: DateTime<Utc>,
    /// End of the mandatory cooldown.
    pub cooldown_until: DateTime<Utc>,
}

/// Token-bucket and circuit-breaker gate.
#[derive(Debug, Clone)]
pub struct Governor {
    ledger: Ledger,
    capacity: f64,
    refill_rate_per_sec: f64,
    failure_threshold: u32,
    cooldown_secs: i64,
}

impl Governor {
    /// Governor over the given ledger with explicit tunables.
    #[must_use]
    pub fn new(
        ledger: Ledger,
        capacity: f64,
        refill_rate_per_sec: f64,
        failure_threshold: u32,
        cooldown_secs: i64,
    ) -> Self {
        Self {
            ledger,
            capacity,
            refill_rate_per_sec,
            failure_threshold,
            cooldown_secs,
        }
    }

    /// Load the record for a fingerprint; unseen fingerprints start with a
    /// full bucket and a closed breaker.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn load(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<GovernorRecord, GovernorError> {
        let path = self.ledger.governor_path(fingerprint);
        Ok(self
            .ledger
            .read_json(&path)?
            .unwrap_or_else(|| GovernorRecord::fresh(fingerprint, self.capacity, now)))
    }

    fn save(&self, record: &GovernorRecord) -> Result<(), GovernorError> {
        let path = self.ledger.governor_path(&record.fingerprint);
        self.ledger.write_json_atomic(&path, record)?;
        Ok(())
    }

    /// Evaluate the gate for one run attempt.
    ///
    /// Order: refill, breaker, bucket. An `Allow` consumes one token and
    /// persists the updated record; a `Deny` persists the refill (and any
    /// open→half-open transition) but consumes nothing.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn check(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<GovernorDecision, GovernorError> {
        let mut record = self.load(fingerprint, now)?;

        // 1. Refill.
        let elapsed = (now - record.last_refill_at).num_milliseconds() as f64 / 1000.0;
        if elapsed > 0.0 {
            record.tokens =
                (record.tokens + elapsed * self.refill_rate_per_sec).min(self.capacity);
            record.last_refill_at = now;
        }

        // 2. Breaker.
        if record.breaker == BreakerState::Open {
            let cooldown_end = record
                .opened_at
                .map(|t| t + Duration::seconds(self.cooldown_secs))
                .unwrap_or(now);
            if now < cooldown_end {
                let retry_after_secs =
                    (cooldown_end - now).num_milliseconds() as f64 / 1000.0;
                self.save(&record)?;
                debug!(fingerprint, retry_after_secs, "circuit open, denying");
                return Ok(GovernorDecision::Deny {
                    code: ReasonCode::CircuitOpen,
                    retry_after_secs,
                });
            }
            record.breaker = BreakerState::HalfOpen;
            debug!(fingerprint, "cooldown elapsed, breaker half-open");
        }

        // 3. Bucket.
        if record.tokens < 1.0 {
            let retry_after_secs = (1.0 - record.tokens) / self.refill_rate_per_sec;
            self.save(&record)?;
            debug!(fingerprint, tokens = record.tokens, "rate limited");
            return Ok(GovernorDecision::Deny {
                code: ReasonCode::RateLimited,
                retry_after_secs,
            });
        }
        record.tokens -= 1.0;
        self.save(&record)?;
        Ok(GovernorDecision::Allow)
    }

    /// Record a run outcome against the breaker.
    ///
    /// Success resets the failure count and closes a half-open breaker.
    /// Failure increments the count; at the threshold (or on any half-open
    /// failure) the breaker opens and [`BreakerOpened`] is returned.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn record_outcome(
        &self,
        fingerprint: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<BreakerOpened>, GovernorError> {
        let mut record = self.load(fingerprint, now)?;
        let mut opened = None;

        if success {
            record.failure_count = 0;
            if record.breaker != BreakerState::Closed {
                debug!(fingerprint, "trial success, breaker closed");
            }
            record.breaker = BreakerState::Closed;
            record.opened_at = None;
        } else {
            record.failure_count += 1;
            let trips = record.breaker == BreakerState::HalfOpen
                || (record.breaker == BreakerState::Closed
                    && record.failure_count >= self.failure_threshold);
            if trips {
                record.breaker = BreakerState::Open;
                record.opened_at = Some(now);
                let cooldown_until = now + Duration::seconds(self.cooldown_secs);
                warn!(
                    fingerprint,
                    failure_count = record.failure_count,
                    %cooldown_until,
                    "circuit breaker opened"
                );
                opened = Some(BreakerOpened {
                    opened_at: now,
                    cooldown_until,
                });
            }
        }
        self.save(&record)?;
        Ok(opened)
    }
}
