// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-driven runtime configuration.
//!
//! Every tunable the governance pipeline consults is collected here with a
//! documented default, so tests construct a [`RuntimeConfig`] directly and
//! production reads the environment exactly once at startup.

use crate::autonomy::AutonomyMode;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Runtime settings for one invocation.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Operator-chosen autonomy envelope (`AUTONOMY_MODE`).
    pub autonomy_mode: AutonomyMode,
    /// Deny all execution when set (`ENGINE_FROZEN=1`).
    pub engine_frozen: bool,
    /// Activates the requalification lifecycle (`REQUALIFICATION_ENABLED=1`).
    pub requalification_enabled: bool,
    /// Ledger root (`RUNS_DIR`, falling back to `SINTRAPRIME_RUNS_DIR`).
    pub runs_dir: PathBuf,
    /// Disables the planner's one parse retry (`STRICT_AGENT_OUTPUT=1`).
    pub strict_agent_output: bool,
    /// Bypass the agent-version pin check (`ALLOW_AGENT_VERSION_MISMATCH=1`).
    pub allow_agent_version_mismatch: bool,
    /// Export audit bundles without redaction (`ALLOW_UNREDACTED_AUDIT_EXPORT=1`).
    pub allow_unredacted_audit_export: bool,
    /// Permit a caller-supplied plan instead of the planner (`ALLOW_PLANNER_OVERRIDE=1`).
    pub allow_planner_override: bool,
    /// Operator role grants as `domain:role` pairs (`OPERATOR_ROLES`).
    pub operator_roles: BTreeSet<(String, String)>,

    // -- Governor --
    /// Token bucket capacity per fingerprint (`GOVERNOR_BUCKET_CAPACITY`).
    pub bucket_capacity: f64,
    /// Refill rate, tokens per second (`GOVERNOR_REFILL_PER_SEC`).
    pub refill_rate_per_sec: f64,
    /// Consecutive failures that open the breaker (`BREAKER_FAILURE_THRESHOLD`).
    pub breaker_failure_threshold: u32,
    /// Breaker cooldown, seconds (`BREAKER_COOLDOWN_SECS`).
    pub breaker_cooldown_secs: i64,

    // -- Policy budgets --
    /// Runs per fingerprint per UTC day (`MAX_RUNS_PER_DAY`).
    pub max_runs_per_day: u32,
    /// Cap on the summed per-step costs of one plan (`PLAN_BUDGET_UNITS`).
    pub plan_budget_units: f64,

    // -- Requalification --
    /// Rolling decay horizon, hours (`CONFIDENCE_DECAY_HORIZON_HOURS`).
    pub confidence_decay_horizon_hours: i64,
    /// Successes required inside the horizon (`REQUIRED_SUCCESSES_IN_HORIZON`).
    pub required_successes_in_horizon: u32,
    /// Successes that complete probation (`REQUIRED_PROBATION_SUCCESSES`).
    pub required_probation_successes: u32,

    // -- Execution --
    /// Default per-step timeout, seconds (`STEP_TIMEOUT_SECS`).
    pub step_timeout_secs: u64,
    /// Idempotency record TTL, days (`IDEMPOTENCY_TTL_DAYS`).
    pub idempotency_ttl_days: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            autonomy_mode: AutonomyMode::ApprovalGated,
            engine_frozen: false,
            requalification_enabled: true,
            runs_dir: PathBuf::from("runs"),
            strict_agent_output: false,
            allow_agent_version_mismatch: false,
            allow_unredacted_audit_export: false,
            allow_planner_override: false,
            operator_roles: BTreeSet::new(),
            bucket_capacity: 5.0,
            refill_rate_per_sec: 0.2,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 60,
            max_runs_per_day: 50,
            plan_budget_units: 100.0,
            confidence_decay_horizon_hours: 72,
            required_successes_in_horizon: 3,
            required_probation_successes: 3,
            step_timeout_secs: 30,
            idempotency_ttl_days: 14,
        }
    }
}

impl RuntimeConfig {
    /// Assemble configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(mode) = env_str("AUTONOMY_MODE") {
            if let Ok(parsed) = mode.parse() {
                cfg.autonomy_mode = parsed;
            }
        }
        cfg.engine_frozen = env_flag("ENGINE_FROZEN");
        if std::env::var_os("REQUALIFICATION_ENABLED").is_some() {
            cfg.requalification_enabled = env_flag("REQUALIFICATION_ENABLED");
        }
        if let Some(dir) = env_str("RUNS_DIR").or_else(|| env_str("SINTRAPRIME_RUNS_DIR")) {
            cfg.runs_dir = PathBuf::from(dir);
        }
        cfg.strict_agent_output = env_flag("STRICT_AGENT_OUTPUT");
        cfg.allow_agent_version_mismatch = env_flag("ALLOW_AGENT_VERSION_MISMATCH");
        cfg.allow_unredacted_audit_export = env_flag("ALLOW_UNREDACTED_AUDIT_EXPORT");
        cfg.allow_planner_override = env_flag("ALLOW_PLANNER_OVERRIDE");
        if let Some(roles) = env_str("OPERATOR_ROLES") {
            cfg.operator_roles = parse_roles(&roles);
        }

        env_parse("GOVERNOR_BUCKET_CAPACITY", &mut cfg.bucket_capacity);
        env_parse("GOVERNOR_REFILL_PER_SEC", &mut cfg.refill_rate_per_sec);
        env_parse(
            "BREAKER_FAILURE_THRESHOLD",
            &mut cfg.breaker_failure_threshold,
        );
        env_parse("BREAKER_COOLDOWN_SECS", &mut cfg.breaker_cooldown_secs);
        env_parse("MAX_RUNS_PER_DAY", &mut cfg.max_runs_per_day);
        env_parse("PLAN_BUDGET_UNITS", &mut cfg.plan_budget_units);
        env_parse(
            "CONFIDENCE_DECAY_HORIZON_HOURS",
            &mut cfg.confidence_decay_horizon_hours,
        );
        env_parse(
            "REQUIRED_SUCCESSES_IN_HORIZON",
            &mut cfg.required_successes_in_horizon,
        );
        env_parse(
            "REQUIRED_PROBATION_SUCCESSES",
            &mut cfg.required_probation_successes,
        );
        env_parse("STEP_TIMEOUT_SECS", &mut cfg.step_timeout_secs);
        env_parse("IDEMPOTENCY_TTL_DAYS", &mut cfg.idempotency_ttl_days);
        cfg
    }

    /// Whether the operator holds `role` in `domain`.
    ///
    /// A `*:role` grant matches every domain.
    #[must_use]
    pub fn operator_has_role(&self, domain: &str, role: &str) -> bool {
        self.operator_roles
            .contains(&(domain.to_string(), role.to_string()))
            || self
                .operator_roles
                .contains(&("*".to_string(), role.to_string()))
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_flag(name: &str) -> bool {
    env_str(name).as_deref() == Some("1")
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Some(raw) = env_str(name)
        && let Ok(parsed) = raw.parse()
    {
        *target = parsed;
    }
}

fn parse_roles(raw: &str) -> BTreeSet<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (domain, role) = entry.trim().split_once(':')?;
            if domain.is_empty() || role.is_empty() {
                return None;
            }
            Some((domain.to_string(), role.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.bucket_capacity, 5.0);
        assert_eq!(cfg.refill_rate_per_sec, 0.2);
        assert_eq!(cfg.breaker_failure_threshold, 5);
        assert_eq!(cfg.breaker_cooldown_secs, 60);
        assert_eq!(cfg.confidence_decay_horizon_hours, 72);
        assert_eq!(cfg.required_probation_successes, 3);
        assert_eq!(cfg.step_timeout_secs, 30);
        assert_eq!(cfg.autonomy_mode, AutonomyMode::ApprovalGated);
    }

    #[test]
    fn role_parsing() {
        let roles = parse_roles("filings:approver, billing:viewer,,bad");
        assert!(roles.contains(&("filings".into(), "approver".into())));
        assert!(roles.contains(&("billing".into(), "viewer".into())));
        assert_eq!(roles.len(), 2);
    }

    #[test]
    fn wildcard_role_grant() {
        let mut cfg = RuntimeConfig::default();
        cfg.operator_roles = parse_roles("*:approver");
        assert!(cfg.operator_has_role("filings", "approver"));
        assert!(cfg.operator_has_role("anything", "approver"));
        assert!(!cfg.operator_has_role("filings", "admin"));
    }

    #[test]
    fn scoped_role_grant() {
        let mut cfg = RuntimeConfig::default();
        cfg.operator_roles = parse_roles("filings:approver");
        assert!(cfg.operator_has_role("filings", "approver"));
        assert!(!cfg.operator_has_role("billing", "approver"));
    }
}
