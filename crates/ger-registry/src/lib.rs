// SPDX-License-Identifier: MIT OR Apache-2.0
#![warn(missing_docs)]
//! Agent registry and capability resolution.
//!
//! The registry maps agents to the capabilities they provide. Resolution
//! pins each required capability to exactly one provider: zero providers is
//! `POLICY_CAPABILITY_UNRESOLVED`, two or more is
//! `POLICY_CAPABILITY_AMBIGUOUS`. Plans additionally pin agent versions;
//! a pin that disagrees with the registry is
//! `POLICY_AGENT_VERSION_MISMATCH` unless explicitly bypassed.

use ger_error::ReasonCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AgentSpec {
    /// Agent name, unique within the registry.
    pub name: String,
    /// Registry version of the agent.
    pub version: String,
    /// Capabilities the agent provides.
    pub capabilities: Vec<String>,
}

/// The agent/capability registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Registry {
    /// Registered agents.
    pub agents: Vec<AgentSpec>,
}

/// A capability pinned to its single provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResolvedCapability {
    /// Requested capability string.
    pub capability: String,
    /// Providing agent.
    pub provider: String,
    /// Provider's registry version.
    pub version: String,
}

/// Resolution or pin-check failure with a stable denial code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No agent provides the capability.
    #[error("capability '{capability}' has no provider")]
    Unresolved {
        /// The unsatisfied capability.
        capability: String,
    },
    /// More than one agent provides the capability.
    #[error("capability '{capability}' has {count} providers: {providers:?}")]
    Ambiguous {
        /// The over-satisfied capability.
        capability: String,
        /// Number of providers found.
        count: usize,
        /// Provider names, sorted.
        providers: Vec<String>,
    },
    /// A pinned agent version disagrees with the registry.
    #[error("agent '{agent}' pinned at {pinned} but registry has {registered}")]
    VersionMismatch {
        /// Agent whose pin failed.
        agent: String,
        /// Version pinned in the plan.
        pinned: String,
        /// Version recorded in the registry.
        registered: String,
    },
    /// A pinned agent does not exist in the registry.
    #[error("agent '{agent}' pinned but not registered")]
    UnknownAgent {
        /// Agent whose pin failed.
        agent: String,
    },
}

impl RegistryError {
    /// Stable denial code for this failure.
    #[must_use]
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::Unresolved { .. } => ReasonCode::PolicyCapabilityUnresolved,
            Self::Ambiguous { .. } => ReasonCode::PolicyCapabilityAmbiguous,
            Self::VersionMismatch { .. } | Self::UnknownAgent { .. } => {
                ReasonCode::PolicyAgentVersionMismatch
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Registry {
    /// Load a registry from a JSON file; falls back to
    /// [`Registry::builtin`] when the file does not exist.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or malformed files.
    pub fn load_or_builtin(path: &Path) -> Result<Self, std::io::Error> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::builtin()),
            Err(e) => Err(e),
        }
    }

    /// Built-in single-agent registry that keeps read-only operation
    /// working before any registry file exists.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            agents: vec![AgentSpec {
                name: "core-agent".into(),
                version: "1.0.0".into(),
                capabilities: vec![
                    "notion.read".into(),
                    "notion.write".into(),
                    "shell.run".into(),
                    "webhook.emit".into(),
                ],
            }],
        }
    }

    /// Look up an agent by name.
    #[must_use]
    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Resolve each required capability to exactly one provider.
    ///
    /// Results are ordered by the iteration order of `required`.
    ///
    /// # Errors
    ///
    /// The first unresolved or ambiguous capability aborts resolution.
    pub fn resolve<'a, I>(&self, required: I) -> Result<Vec<ResolvedCapability>, RegistryError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut resolved = Vec::new();
        for capability in required {
            let mut providers: Vec<&AgentSpec> = self
                .agents
                .iter()
                .filter(|a| a.capabilities.iter().any(|c| c == capability))
                .collect();
            providers.sort_by(|a, b| a.name.cmp(&b.name));
            match providers.as_slice() {
                [] => {
                    return Err(RegistryError::Unresolved {
                        capability: capability.clone(),
                    });
                }
                [single] => resolved.push(ResolvedCapability {
                    capability: capability.clone(),
                    provider: single.name.clone(),
                    version: single.version.clone(),
                }),
                many => {
                    return Err(RegistryError::Ambiguous {
                        capability: capability.clone(),
                        count: many.len(),
                        providers: many.iter().map(|a| a.name.clone()).collect(),
                    });
                }
            }
        }
        Ok(resolved)
    }

    /// Check plan version pins against the registry.
    ///
    /// With `allow_mismatch` the check is skipped entirely (the operator
    /// accepted the risk via `ALLOW_AGENT_VERSION_MISMATCH`).
    ///
    /// # Errors
    ///
    /// The first unknown agent or version mismatch aborts the check.
    pub fn check_version_pins(
        &self,
        pins: &BTreeMap<String, String>,
        allow_mismatch: bool,
    ) -> Result<(), RegistryError> {
        if allow_mismatch {
            return Ok(());
        }
        for (agent, pinned) in pins {
            let Some(spec) = self.agent(agent) else {
                return Err(RegistryError::UnknownAgent {
                    agent: agent.clone(),
                });
            };
            if spec.version != *pinned {
                return Err(RegistryError::VersionMismatch {
                    agent: agent.clone(),
                    pinned: pinned.clone(),
                    registered: spec.version.clone(),
                });
            }
        }
        Ok(())
    }
}
