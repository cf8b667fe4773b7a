// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-fingerprint governance state.
//!
//! Three file-backed stores keyed by fingerprint: confidence (a scalar in
//! [0,1] moved only by named signals), requalification state (the
//! ACTIVE / PROBATION / SUSPENDED / ELIGIBLE lifecycle), and idempotency
//! records (TTL-bounded write dedup). All persistence goes through the
//! ledger's atomic-rename writes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod confidence;
mod idempotency;
mod requal;

pub use confidence::{ConfidenceRecord, ConfidenceSignal, ConfidenceStore};
pub use idempotency::{IdempotencyRecord, IdempotencyStore};
pub use requal::{RequalEvent, RequalRecord, RequalState, RequalStore};

/// Errors from the state stores.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Persistence failure from the ledger layer.
    #[error(transparent)]
    Ledger(#[from] ger_ledger::LedgerError),
}
