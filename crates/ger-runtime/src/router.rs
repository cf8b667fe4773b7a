// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command router: raw operator text → runtime operation.
//!
//! Anything that is not a `/`-prefixed control command is a DSL command
//! bound for the planner.

/// A routed operator request.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Plan and execute a DSL command.
    Dsl(String),
    /// Resume a paused plan.
    Approve {
        /// Execution to resume.
        execution_id: String,
    },
    /// Emit a compensation plan for a past execution.
    Rollback {
        /// Execution to compensate.
        execution_id: String,
    },
    /// Cooldown sweep over all requalification states.
    RequalifyScan,
    /// Operator-only activation of an eligible fingerprint.
    RequalifyActivate {
        /// Fingerprint to activate.
        fingerprint: String,
    },
    /// Read-only promotion candidate report.
    PromoteRecommend {
        /// Emit raw JSON.
        json: bool,
    },
    /// Read-only fingerprint rankings.
    RankingsCompute {
        /// Lookback window in days.
        days: i64,
    },
    /// Deterministic audit bundle export.
    AuditExport {
        /// Execution id or a `{"since_iso": …}` selector.
        selector: String,
    },
    /// List available plan templates.
    TemplateList,
    /// Show one template.
    TemplateShow {
        /// Template name.
        name: String,
    },
    /// Materialize and run a template.
    TemplateRun {
        /// Template name.
        name: String,
        /// Substitution parameters as JSON text.
        params: Option<String>,
    },
    /// A `/` command the router does not know.
    Unknown(String),
}

/// Route raw operator text.
#[must_use]
pub fn route(text: &str) -> Route {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return Route::Dsl(trimmed.to_string());
    }
    let mut words = trimmed.split_whitespace();
    match words.next() {
        Some("/approve") => match words.next() {
            Some(id) => Route::Approve {
                execution_id: id.to_string(),
            },
            None => Route::Unknown(trimmed.to_string()),
        },
        Some("/rollback") => match words.next() {
            Some(id) => Route::Rollback {
                execution_id: id.to_string(),
            },
            None => Route::Unknown(trimmed.to_string()),
        },
        Some("/autonomy") => match (words.next(), words.next(), words.next()) {
            (Some("requalify"), Some("scan"), None) => Route::RequalifyScan,
            (Some("requalify"), Some("activate"), Some(fingerprint)) => {
                Route::RequalifyActivate {
                    fingerprint: fingerprint.to_string(),
                }
            }
            (Some("promote"), Some("recommend"), tail) => Route::PromoteRecommend {
                json: tail == Some("json"),
            },
            _ => Route::Unknown(trimmed.to_string()),
        },
        Some("/rankings") => match (words.next(), words.next()) {
            (Some("compute"), days) => Route::RankingsCompute {
                days: days.and_then(|d| d.parse().ok()).unwrap_or(30),
            },
            _ => Route::Unknown(trimmed.to_string()),
        },
        Some("/audit") => match words.next() {
            Some("export") => {
                let rest: Vec<&str> = words.collect();
                if rest.is_empty() {
                    Route::Unknown(trimmed.to_string())
                } else {
                    Route::AuditExport {
                        selector: rest.join(" "),
                    }
                }
            }
            _ => Route::Unknown(trimmed.to_string()),
        },
        Some("/template") => match words.next() {
            Some("list") => Route::TemplateList,
            Some("show") => match words.next() {
                Some(name) => Route::TemplateShow {
                    name: name.to_string(),
                },
                None => Route::Unknown(trimmed.to_string()),
            },
            Some("run") => match words.next() {
                Some(name) => {
                    let rest: Vec<&str> = words.collect();
                    Route::TemplateRun {
                        name: name.to_string(),
                        params: (!rest.is_empty()).then(|| rest.join(" ")),
                    }
                }
                None => Route::Unknown(trimmed.to_string()),
            },
            _ => Route::Unknown(trimmed.to_string()),
        },
        _ => Route::Unknown(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_routes_to_dsl() {
        assert_eq!(
            route("  sync docket 42 "),
            Route::Dsl("sync docket 42".into())
        );
    }

    #[test]
    fn approve_and_rollback() {
        assert_eq!(
            route("/approve exec-9"),
            Route::Approve {
                execution_id: "exec-9".into()
            }
        );
        assert_eq!(
            route("/rollback exec-9"),
            Route::Rollback {
                execution_id: "exec-9".into()
            }
        );
        assert!(matches!(route("/approve"), Route::Unknown(_)));
    }

    #[test]
    fn autonomy_subcommands() {
        assert_eq!(route("/autonomy requalify scan"), Route::RequalifyScan);
        assert_eq!(
            route("/autonomy requalify activate abc123"),
            Route::RequalifyActivate {
                fingerprint: "abc123".into()
            }
        );
        assert_eq!(
            route("/autonomy promote recommend"),
            Route::PromoteRecommend { json: false }
        );
        assert_eq!(
            route("/autonomy promote recommend json"),
            Route::PromoteRecommend { json: true }
        );
        assert!(matches!(route("/autonomy requalify"), Route::Unknown(_)));
    }

    #[test]
    fn rankings_default_window() {
        assert_eq!(route("/rankings compute"), Route::RankingsCompute { days: 30 });
        assert_eq!(
            route("/rankings compute 7"),
            Route::RankingsCompute { days: 7 }
        );
    }

    #[test]
    fn audit_export_selector_keeps_json() {
        assert_eq!(
            route(r#"/audit export {"since_iso":"2025-06-01T00:00:00Z"}"#),
            Route::AuditExport {
                selector: r#"{"since_iso":"2025-06-01T00:00:00Z"}"#.into()
            }
        );
        assert_eq!(
            route("/audit export exec-1"),
            Route::AuditExport {
                selector: "exec-1".into()
            }
        );
    }

    #[test]
    fn template_subcommands() {
        assert_eq!(route("/template list"), Route::TemplateList);
        assert_eq!(
            route("/template show sync"),
            Route::TemplateShow { name: "sync".into() }
        );
        assert_eq!(
            route(r#"/template run sync {"docket":"42"}"#),
            Route::TemplateRun {
                name: "sync".into(),
                params: Some(r#"{"docket":"42"}"#.into())
            }
        );
        assert_eq!(
            route("/template run sync"),
            Route::TemplateRun {
                name: "sync".into(),
                params: None
            }
        );
    }

    #[test]
    fn unknown_slash_commands_are_flagged() {
        assert!(matches!(route("/frobnicate"), Route::Unknown(_)));
    }
}
