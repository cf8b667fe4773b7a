// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::mock::MockAdapter;
use crate::{AdapterRegistry, AdapterResponse, Executor, idempotency_key};
use chrono::{TimeZone, Utc};
use ger_core::{
    Clock, ExecutionPlan, FixedClock, Phase, RetrySpec, Step, StepStatus,
};
use ger_ledger::Ledger;
use ger_state::{IdempotencyRecord, IdempotencyStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    executor: Executor,
    mock: Arc<MockAdapter>,
    ledger: Ledger,
    idempotency: IdempotencyStore,
    clock: Arc<FixedClock>,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::new(dir.path());
    let idempotency = IdempotencyStore::new(ledger.clone(), 14);
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    ));
    let mock = Arc::new(MockAdapter::always_succeeding());
    let mut adapters = AdapterRegistry::new();
    adapters.register("notion.live.write", mock.clone());
    adapters.register("notion.live.read", mock.clone());
    adapters.register("shell.run", mock.clone());
    let executor = Executor::new(
        adapters,
        idempotency.clone(),
        ledger.clone(),
        clock.clone(),
        Duration::from_secs(30),
    );
    Harness {
        _dir: dir,
        executor,
        mock,
        ledger,
        idempotency,
        clock,
    }
}

fn write_step(id: &str) -> Step {
    let mut s = Step::new(id, "notion.live.write");
    s.approval_scoped = true;
    s.notion_path = Some(format!("/docs/{id}"));
    s
}

fn read_step(id: &str) -> Step {
    let mut s = Step::new(id, "notion.live.read");
    s.read_only = true;
    s
}

fn flat_plan(steps: Vec<Step>) -> ExecutionPlan {
    ExecutionPlan {
        execution_id: "exec-1".into(),
        thread_id: "thread-1".into(),
        goal: "test".into(),
        dry_run: false,
        agent_versions: BTreeMap::new(),
        required_capabilities: BTreeSet::new(),
        steps,
        phases: vec![],
    }
}

#[tokio::test]
async fn successful_write_records_idempotency_and_artifact() {
    let h = harness();
    let plan = flat_plan(vec![write_step("w1")]);
    let hash = plan.plan_hash().unwrap();

    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert!(report.success);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].status, StepStatus::Success);
    assert_eq!(report.steps[0].attempts, 1);
    assert!(report.steps[0].response_digest.is_some());
    assert_eq!(report.artifacts.len(), 1);
    assert!(report.artifacts[0].contains("artifacts/notion.write/exec-1/w1.json"));

    let key = idempotency_key(&plan.steps[0], &hash, "thread-1");
    let record = h.idempotency.get(&key, h.clock.now()).unwrap().unwrap();
    assert_eq!(record.execution_id, "exec-1");
    assert_eq!(record.step_id, "w1");
}

#[tokio::test]
async fn read_steps_leave_no_records() {
    let h = harness();
    let plan = flat_plan(vec![read_step("r1")]);
    let hash = plan.plan_hash().unwrap();

    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert!(report.success);
    assert!(report.artifacts.is_empty());
    assert!(report.steps[0].idempotency_key.is_none());
    assert!(h.ledger.list_artifacts("exec-1").unwrap().is_empty());
}

#[tokio::test]
async fn existing_record_short_circuits_dispatch() {
    let h = harness();
    let plan = flat_plan(vec![write_step("w1")]);
    let hash = plan.plan_hash().unwrap();
    let key = idempotency_key(&plan.steps[0], &hash, "thread-1");
    h.idempotency
        .put(&IdempotencyRecord {
            key: key.clone(),
            execution_id: "earlier".into(),
            plan_hash: hash.clone(),
            step_id: "w1".into(),
            completed_at: h.clock.now(),
            response_digest: "abc".into(),
        })
        .unwrap();

    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert!(report.success);
    assert_eq!(report.steps[0].status, StepStatus::IdempotentHit);
    assert_eq!(report.steps[0].attempts, 0);
    assert_eq!(report.steps[0].response_digest.as_deref(), Some("abc"));
    // The adapter was never called.
    assert_eq!(h.mock.call_count(), 0);
}

#[tokio::test]
async fn same_key_produces_at_most_one_side_effect() {
    let h = harness();
    let plan = flat_plan(vec![write_step("w1")]);
    let hash = plan.plan_hash().unwrap();

    h.executor.execute(&plan, &hash).await.unwrap();
    let second = h.executor.execute(&plan, &hash).await.unwrap();
    assert_eq!(second.steps[0].status, StepStatus::IdempotentHit);
    assert_eq!(h.mock.call_count(), 1);
}

#[tokio::test]
async fn retry_until_success_shares_key() {
    let h = harness();
    h.mock.push_failure("connection reset");
    h.mock.push_response(AdapterResponse {
        http_status: Some(200),
        response: Some(serde_json::json!({"ok": true})),
        ..Default::default()
    });
    let mut step = write_step("w1");
    step.retry = Some(RetrySpec {
        max_attempts: 3,
        backoff_ms: 0,
    });
    let plan = flat_plan(vec![step]);
    let hash = plan.plan_hash().unwrap();

    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert!(report.success);
    assert_eq!(report.steps[0].attempts, 2);
    assert_eq!(h.mock.call_count(), 2);
}

#[tokio::test]
async fn exhausted_retries_fail_the_step() {
    let h = harness();
    h.mock.push_failure("boom");
    h.mock.push_failure("boom again");
    let mut step = write_step("w1");
    step.retry = Some(RetrySpec {
        max_attempts: 2,
        backoff_ms: 0,
    });
    let plan = flat_plan(vec![step, read_step("r1")]);
    let hash = plan.plan_hash().unwrap();

    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.failed_step.as_deref(), Some("w1"));
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].attempts, 2);
    assert!(report.steps[0].error.as_deref().unwrap().contains("boom"));
    // The later step never ran.
    assert_eq!(report.steps[1].status, StepStatus::Skipped);
    assert!(h.ledger.list_artifacts("exec-1").unwrap().is_empty());
}

#[tokio::test]
async fn non_2xx_http_is_a_failure() {
    let h = harness();
    h.mock.push_http(500);
    let plan = flat_plan(vec![write_step("w1")]);
    let hash = plan.plan_hash().unwrap();

    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.steps[0].error.as_deref(), Some("HTTP 500"));
    assert_eq!(report.steps[0].http_status, Some(500));
}

#[tokio::test]
async fn failed_phase_halts_later_phases() {
    let h = harness();
    h.mock.push_failure("dead");
    let plan = ExecutionPlan {
        execution_id: "exec-1".into(),
        thread_id: "thread-1".into(),
        goal: "phased".into(),
        dry_run: false,
        agent_versions: BTreeMap::new(),
        required_capabilities: BTreeSet::new(),
        steps: vec![],
        phases: vec![
            Phase {
                phase_id: "p1".into(),
                steps: vec![write_step("a"), write_step("b")],
            },
            Phase {
                phase_id: "p2".into(),
                steps: vec![write_step("c")],
            },
        ],
    };
    let hash = plan.plan_hash().unwrap();

    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.phases_planned, Some(2));
    assert_eq!(report.phases_executed, Some(0));
    let statuses: Vec<_> = report.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        [StepStatus::Failed, StepStatus::Skipped, StepStatus::Skipped]
    );
    assert_eq!(h.mock.call_count(), 1);
}

#[tokio::test]
async fn completed_phases_are_counted() {
    let h = harness();
    let plan = ExecutionPlan {
        execution_id: "exec-1".into(),
        thread_id: "thread-1".into(),
        goal: "phased".into(),
        dry_run: false,
        agent_versions: BTreeMap::new(),
        required_capabilities: BTreeSet::new(),
        steps: vec![],
        phases: vec![
            Phase {
                phase_id: "p1".into(),
                steps: vec![write_step("a")],
            },
            Phase {
                phase_id: "p2".into(),
                steps: vec![write_step("b")],
            },
        ],
    };
    let hash = plan.plan_hash().unwrap();
    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert!(report.success);
    assert_eq!(report.phases_executed, Some(2));
}

#[tokio::test]
async fn dry_run_dispatches_nothing() {
    let h = harness();
    let mut plan = flat_plan(vec![write_step("w1"), read_step("r1")]);
    plan.dry_run = true;
    let hash = plan.plan_hash().unwrap();

    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert!(report.success);
    assert_eq!(h.mock.call_count(), 0);
    assert!(report.artifacts.is_empty());
    let key = idempotency_key(&plan.steps[0], &hash, "thread-1");
    assert!(h.idempotency.get(&key, h.clock.now()).unwrap().is_none());
}

#[tokio::test]
async fn interrupt_flag_fails_current_step() {
    let h = harness();
    h.executor
        .interrupt_flag()
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let plan = flat_plan(vec![write_step("w1")]);
    let hash = plan.plan_hash().unwrap();

    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert!(!report.success);
    assert!(report.interrupted);
    assert_eq!(report.steps[0].error.as_deref(), Some("INTERRUPTED"));
    assert_eq!(h.mock.call_count(), 0);
}

#[tokio::test]
async fn unregistered_action_fails_without_retry() {
    let h = harness();
    let mut step = Step::new("x1", "unknown.action");
    step.retry = Some(RetrySpec {
        max_attempts: 5,
        backoff_ms: 0,
    });
    let plan = flat_plan(vec![step]);
    let hash = plan.plan_hash().unwrap();

    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.steps[0].attempts, 1);
    assert!(
        report.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("no adapter registered")
    );
}

#[tokio::test]
async fn explicit_idempotency_key_wins_over_derived() {
    let h = harness();
    let mut step = write_step("w1");
    step.idempotency_key = Some("explicit-key".into());
    let plan = flat_plan(vec![step]);
    let hash = plan.plan_hash().unwrap();

    let report = h.executor.execute(&plan, &hash).await.unwrap();
    assert_eq!(
        report.steps[0].idempotency_key.as_deref(),
        Some("explicit-key")
    );
    assert!(
        h.idempotency
            .get("explicit-key", h.clock.now())
            .unwrap()
            .is_some()
    );
}
