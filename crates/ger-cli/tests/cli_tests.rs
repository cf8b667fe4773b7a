// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exit-code and output contract tests for the `ger` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn ger(runs_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ger").unwrap();
    cmd.env("RUNS_DIR", runs_dir.path());
    cmd.env_remove("AUTONOMY_MODE");
    cmd.env_remove("ENGINE_FROZEN");
    cmd
}

#[test]
fn unknown_slash_command_exits_2() {
    let dir = TempDir::new().unwrap();
    ger(&dir)
        .args(["run", "/frobnicate"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("need input"));
}

#[test]
fn unplannable_command_exits_2() {
    let dir = TempDir::new().unwrap();
    ger(&dir)
        .args(["run", "sync", "docket", "42"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("no template named 'sync'"));
}

#[test]
fn template_list_is_empty_by_default() {
    let dir = TempDir::new().unwrap();
    ger(&dir)
        .args(["template", "list"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("\"templates\""));
}

#[test]
fn template_run_executes_and_receipts_persist() {
    let dir = TempDir::new().unwrap();
    let templates = dir.path().join("templates");
    std::fs::create_dir_all(&templates).unwrap();
    std::fs::write(
        templates.join("noop.json"),
        r#"{
            "execution_id": "",
            "thread_id": "",
            "goal": "say ${word}",
            "steps": [
                {
                    "step_id": "echo",
                    "action": "shell.run",
                    "read_only": true,
                    "payload": "echo ${word}"
                }
            ]
        }"#,
    )
    .unwrap();

    ger(&dir)
        .args(["template", "run", "noop", r#"{"word":"governed"}"#])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("ok: exec-"));

    // The run left exactly one verifiable receipt.
    ger(&dir)
        .args(["receipts", "list"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Success"));
    ger(&dir)
        .args(["receipts", "verify"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("1 valid, 0 invalid"));
}

#[test]
fn frozen_engine_denies_with_exit_3() {
    let dir = TempDir::new().unwrap();
    let templates = dir.path().join("templates");
    std::fs::create_dir_all(&templates).unwrap();
    std::fs::write(
        templates.join("noop.json"),
        r#"{
            "execution_id": "",
            "thread_id": "",
            "goal": "noop",
            "steps": [
                {"step_id": "echo", "action": "shell.run", "read_only": true, "payload": "true"}
            ]
        }"#,
    )
    .unwrap();

    ger(&dir)
        .env("ENGINE_FROZEN", "1")
        .args(["template", "run", "noop"])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("POLICY_ENGINE_FROZEN"));
}

#[test]
fn receipts_verify_empty_ledger_is_valid() {
    let dir = TempDir::new().unwrap();
    ger(&dir)
        .args(["receipts", "verify"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("0 valid, 0 invalid"));
}

#[test]
fn receipts_show_missing_execution_exits_2() {
    let dir = TempDir::new().unwrap();
    ger(&dir)
        .args(["receipts", "show", "ghost"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no receipts"));
}

#[test]
fn schema_prints_receipt_contract() {
    let dir = TempDir::new().unwrap();
    ger(&dir)
        .args(["schema", "receipt"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("receipt_hash"))
        .stdout(predicate::str::contains("autonomy_mode_effective"));
}

#[test]
fn json_flag_emits_structured_outcome() {
    let dir = TempDir::new().unwrap();
    ger(&dir)
        .args(["--json", "run", "/frobnicate"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("\"kind\": \"NeedInput\""));
}

#[test]
fn rankings_compute_reports_empty_window() {
    let dir = TempDir::new().unwrap();
    ger(&dir)
        .args(["rankings", "compute", "7"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("\"window_days\": 7"));
}
