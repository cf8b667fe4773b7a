// SPDX-License-Identifier: MIT OR Apache-2.0
//! Autonomy modes and confidence-driven downgrades.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operator-chosen permissiveness envelope.
///
/// Ordered from least to most permissive. Confidence only ever downgrades
/// the effective mode; it never upgrades it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum AutonomyMode {
    /// Nothing executes.
    #[serde(rename = "OFF")]
    Off,
    /// Only read-only steps may run.
    #[serde(rename = "READ_ONLY_AUTONOMY")]
    ReadOnly,
    /// Plans are produced but never executed.
    #[serde(rename = "PROPOSE_ONLY_AUTONOMY")]
    ProposeOnly,
    /// Write-scoped steps require explicit approval.
    #[serde(rename = "APPROVAL_GATED_AUTONOMY")]
    ApprovalGated,
    /// Everything runs without approval gating.
    #[serde(rename = "FULL_AUTONOMY")]
    Full,
}

impl AutonomyMode {
    /// Stable string form, identical to the env-var token.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::ReadOnly => "READ_ONLY_AUTONOMY",
            Self::ProposeOnly => "PROPOSE_ONLY_AUTONOMY",
            Self::ApprovalGated => "APPROVAL_GATED_AUTONOMY",
            Self::Full => "FULL_AUTONOMY",
        }
    }

    /// Effective mode once the fingerprint's confidence is applied.
    ///
    /// Confidence ≤ 0.40 caps at read-only, ≤ 0.60 caps at propose-only.
    /// `Off` stays `Off` regardless.
    #[must_use]
    pub fn effective(self, confidence: f64) -> Self {
        if self == Self::Off {
            return Self::Off;
        }
        let cap = if confidence <= 0.40 {
            Self::ReadOnly
        } else if confidence <= 0.60 {
            Self::ProposeOnly
        } else {
            Self::Full
        };
        self.min(cap)
    }
}

impl fmt::Display for AutonomyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutonomyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFF" => Ok(Self::Off),
            "READ_ONLY_AUTONOMY" => Ok(Self::ReadOnly),
            "PROPOSE_ONLY_AUTONOMY" => Ok(Self::ProposeOnly),
            "APPROVAL_GATED_AUTONOMY" => Ok(Self::ApprovalGated),
            "FULL_AUTONOMY" => Ok(Self::Full),
            other => Err(format!("unknown autonomy mode: {other}")),
        }
    }
}
