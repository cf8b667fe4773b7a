// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core contract types for the governed execution runtime.
//!
//! Everything that crosses a component boundary lives here: the execution
//! plan and its steps, the receipt, autonomy modes, the command fingerprint,
//! canonical JSON hashing, the clock seam, and the environment-driven
//! runtime configuration.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Autonomy modes and confidence-driven downgrades.
pub mod autonomy;
/// Canonical JSON serialization and SHA-256 hashing.
pub mod canonical;
/// Clock seam: system and fixed clocks.
pub mod clock;
/// Operator command parsing, normalization, and fingerprinting.
pub mod command;
/// Environment-driven runtime configuration.
pub mod config;
/// Execution plans, phases, steps, and guards.
pub mod plan;
/// Receipts: the append-only outcome records.
pub mod receipt;

pub use autonomy::AutonomyMode;
pub use canonical::{
    ContractError, derived_idempotency_key, fingerprint_value, sha256_hex, stable_json,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use command::Command;
pub use config::RuntimeConfig;
pub use plan::{ExecutionPlan, Guard, GuardOp, Phase, RetrySpec, Step, StepKind};
pub use receipt::{
    ApprovalRequired, PolicyDenied, Receipt, ReceiptBuilder, ReceiptStatus, StepReceipt,
    StepStatus, canonicalize_receipt, receipt_hash, verify_receipt_hash,
};
