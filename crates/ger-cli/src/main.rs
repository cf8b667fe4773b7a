// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! `ger`: operator entry point for the governed execution runtime.
//!
//! Every terminal outcome maps to a deterministic exit code: 0 success or
//! idempotent-hit, 1 executor failure, 2 need-input, 3 policy-denied or
//! throttled, 4 approval-pending or drift.

use clap::{Parser, Subcommand, ValueEnum};
use ger_core::{ExecutionPlan, Receipt, RuntimeConfig, SystemClock};
use ger_executor::{
    AdapterRegistry, NotionLiveAdapter, ShellRunAdapter, WebhookEmitAdapter,
};
use ger_ledger::Ledger;
use ger_prestate::HttpPrestateFetcher;
use ger_runtime::{Orchestrator, RunOutcome, TemplatePlanner, TemplateRegistry};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing_subscriber::EnvFilter;

/// Exit code for internal runtime errors (disk failures, corrupt state).
const EXIT_INTERNAL_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "ger", version, about = "Governed execution runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Print outcomes as JSON instead of pretty text.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Route operator text (DSL command or /control command).
    Run {
        /// The command text.
        text: Vec<String>,
    },

    /// Resume a paused plan.
    Approve {
        /// Execution to resume.
        execution_id: String,
    },

    /// Emit a compensation plan from stored prestates.
    Rollback {
        /// Execution to compensate.
        execution_id: String,
    },

    /// Requalification maintenance.
    Requalify {
        #[command(subcommand)]
        action: RequalifyAction,
    },

    /// Promotion candidate report.
    Promote {
        #[command(subcommand)]
        action: PromoteAction,
    },

    /// Fingerprint rankings.
    Rankings {
        #[command(subcommand)]
        action: RankingsAction,
    },

    /// Audit bundle export.
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Pre-authored plan templates.
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Inspect the receipt ledger.
    Receipts {
        #[command(subcommand)]
        action: ReceiptsAction,
    },

    /// Print the JSON schema of a wire type.
    Schema {
        /// Which schema to print.
        #[arg(value_enum)]
        kind: SchemaKind,
    },
}

#[derive(Subcommand, Debug)]
enum RequalifyAction {
    /// Cooldown sweep over all requalification states.
    Scan,
    /// Operator-only activation of an eligible fingerprint.
    Activate {
        /// Fingerprint to activate.
        fingerprint: String,
    },
}

#[derive(Subcommand, Debug)]
enum PromoteAction {
    /// Read-only promotion candidate report.
    Recommend,
}

#[derive(Subcommand, Debug)]
enum RankingsAction {
    /// Compute rankings over a lookback window.
    Compute {
        /// Lookback window in days.
        #[arg(default_value_t = 30)]
        days: i64,
    },
}

#[derive(Subcommand, Debug)]
enum AuditAction {
    /// Export a deterministic bundle (redacted by default).
    Export {
        /// Execution id or a `{"since_iso": …}` selector.
        selector: String,
    },
}

#[derive(Subcommand, Debug)]
enum TemplateAction {
    /// List template names.
    List,
    /// Show one template.
    Show {
        /// Template name.
        name: String,
    },
    /// Materialize and run a template.
    Run {
        /// Template name.
        name: String,
        /// Substitution parameters as JSON.
        params: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ReceiptsAction {
    /// List receipts in append order.
    List,
    /// Show the latest receipt for an execution.
    Show {
        /// Execution id.
        execution_id: String,
    },
    /// Verify every stored receipt hash.
    Verify,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SchemaKind {
    Plan,
    Receipt,
    Envelope,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_INTERNAL_ERROR
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = RuntimeConfig::from_env();

    // Ledger-only commands skip the full pipeline.
    if let Commands::Receipts { action } = &cli.command {
        return receipts_command(&config, action, cli.json);
    }
    if let Commands::Schema { kind } = &cli.command {
        print_schema(*kind)?;
        return Ok(0);
    }

    let orchestrator = build_orchestrator(config)?;

    // SIGTERM/ctrl-c marks the in-flight step failed and flushes a
    // failure receipt instead of dying mid-write.
    let interrupt = orchestrator.interrupt_flag();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            )
            .expect("install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        interrupt.store(true, Ordering::SeqCst);
    });

    let text = match cli.command {
        Commands::Run { text } => text.join(" "),
        Commands::Approve { execution_id } => format!("/approve {execution_id}"),
        Commands::Rollback { execution_id } => format!("/rollback {execution_id}"),
        Commands::Requalify { action } => match action {
            RequalifyAction::Scan => "/autonomy requalify scan".to_string(),
            RequalifyAction::Activate { fingerprint } => {
                format!("/autonomy requalify activate {fingerprint}")
            }
        },
        Commands::Promote {
            action: PromoteAction::Recommend,
        } => "/autonomy promote recommend".to_string(),
        Commands::Rankings {
            action: RankingsAction::Compute { days },
        } => format!("/rankings compute {days}"),
        Commands::Audit {
            action: AuditAction::Export { selector },
        } => format!("/audit export {selector}"),
        Commands::Template { action } => match action {
            TemplateAction::List => "/template list".to_string(),
            TemplateAction::Show { name } => format!("/template show {name}"),
            TemplateAction::Run { name, params } => match params {
                Some(params) => format!("/template run {name} {params}"),
                None => format!("/template run {name}"),
            },
        },
        Commands::Receipts { .. } | Commands::Schema { .. } => unreachable!("handled above"),
    };

    let outcome = orchestrator.handle(&text).await?;
    print_outcome(&outcome, cli.json)?;
    Ok(outcome.exit_code())
}

fn build_orchestrator(config: RuntimeConfig) -> anyhow::Result<Orchestrator> {
    let store_base = std::env::var("NOTION_BASE_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());

    let mut adapters = AdapterRegistry::new();
    let notion = Arc::new(NotionLiveAdapter::new(store_base.clone()));
    adapters.register("notion.live.write", notion.clone());
    adapters.register("notion.live.read", notion);
    adapters.register("shell.run", Arc::new(ShellRunAdapter));
    adapters.register("webhook.emit", Arc::new(WebhookEmitAdapter::new()));

    let planner = Arc::new(TemplatePlanner::new(
        TemplateRegistry::new(config.runs_dir.join("templates")),
        config.allow_planner_override,
    ));
    let fetcher = Arc::new(HttpPrestateFetcher::new(store_base));
    Orchestrator::new(
        config,
        Arc::new(SystemClock),
        planner,
        fetcher,
        adapters,
    )
}

fn print_outcome(outcome: &RunOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    match outcome {
        RunOutcome::Success { receipt } => {
            println!(
                "ok: {} ({} step(s), receipt {})",
                receipt.execution_id,
                receipt.steps.len(),
                receipt.receipt_hash.as_deref().unwrap_or("-")
            );
        }
        RunOutcome::AlreadyExecuted {
            execution_id,
            steps,
            ..
        } => {
            println!("already executed: {execution_id} ({} step(s))", steps.len());
        }
        RunOutcome::Failure { receipt } => {
            let detail = receipt
                .policy_denied
                .as_ref()
                .map(|d| d.reason.clone())
                .unwrap_or_default();
            println!("failed: {} {detail}", receipt.execution_id);
        }
        RunOutcome::NeedInput { question } => {
            println!("need input: {question}");
        }
        RunOutcome::Denied { receipt } => {
            let denied = receipt.policy_denied.as_ref();
            println!(
                "denied: {} ({})",
                denied.map(|d| d.code.as_str()).unwrap_or("POLICY"),
                denied.map(|d| d.reason.as_str()).unwrap_or("")
            );
        }
        RunOutcome::Throttled { receipt } => {
            let denied = receipt.policy_denied.as_ref();
            println!(
                "throttled: {} retry in {:.1}s",
                denied.map(|d| d.code.as_str()).unwrap_or("THROTTLE"),
                denied.and_then(|d| d.retry_after_secs).unwrap_or(0.0)
            );
        }
        RunOutcome::AwaitingApproval {
            receipt,
            envelope_path,
        } => {
            println!(
                "awaiting approval: /approve {} (envelope {envelope_path})",
                receipt.execution_id
            );
        }
        RunOutcome::NeedApprovalAgain { code, details } => {
            println!("approval needed again: {code} {details}");
        }
        RunOutcome::GuardFailed { code, failures } => {
            println!("guards failed: {code} ({} predicate(s))", failures.len());
        }
        RunOutcome::ConfidenceDecayed { fingerprint } => {
            println!("confidence decayed: {fingerprint} entered probation");
        }
        RunOutcome::Report { report } => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
    }
    Ok(())
}

fn receipts_command(
    config: &RuntimeConfig,
    action: &ReceiptsAction,
    json: bool,
) -> anyhow::Result<i32> {
    let ledger = Ledger::new(&config.runs_dir);
    match action {
        ReceiptsAction::List => {
            let receipts = ledger.read_receipts()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&receipts)?);
            } else {
                for r in &receipts {
                    println!(
                        "{}  {:<18}  {:?}  {}",
                        r.started_at, r.execution_id, r.status, r.kind
                    );
                }
            }
            Ok(0)
        }
        ReceiptsAction::Show { execution_id } => {
            match ledger.last_receipt_by_execution(execution_id)? {
                Some(receipt) => {
                    println!("{}", serde_json::to_string_pretty(&receipt)?);
                    Ok(0)
                }
                None => {
                    eprintln!("no receipts for '{execution_id}'");
                    Ok(2)
                }
            }
        }
        ReceiptsAction::Verify => {
            let verification = ledger.verify()?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "valid_count": verification.valid_count,
                        "invalid": verification.invalid,
                    })
                );
            } else {
                println!(
                    "{} valid, {} invalid",
                    verification.valid_count,
                    verification.invalid.len()
                );
            }
            Ok(if verification.is_valid() { 0 } else { 1 })
        }
    }
}

fn print_schema(kind: SchemaKind) -> anyhow::Result<()> {
    let schema = match kind {
        SchemaKind::Plan => schemars::schema_for!(ExecutionPlan),
        SchemaKind::Receipt => schemars::schema_for!(Receipt),
        SchemaKind::Envelope => schemars::schema_for!(ger_approval::ApprovalEnvelope),
    };
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
