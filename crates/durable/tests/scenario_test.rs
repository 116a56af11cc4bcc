//! End-to-end scenarios against the in-memory store
//!
//! Run with: cargo test -p ledgerflow-durable --test scenario_test

mod common;

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};

use common::{resume_next, runner, LEASE};
use ledgerflow_durable::engine::{EngineError, PromiseTarget, TaskDisposition, WorkflowRegistry};
use ledgerflow_durable::persistence::{
    CreateOutcome, InMemoryWorkflowEventStore, NewWorkflow, WorkflowEventStore,
};
use ledgerflow_durable::replay::{ChildOptions, TaskOptions, WorkflowContext};
use ledgerflow_durable::scheduler::ClaimToken;
use ledgerflow_durable::task::TaskRegistry;
use ledgerflow_durable::worker::Resumption;
use ledgerflow_durable::workflow::{
    ChildStatus, TaskStatus, TimerStatus, Workflow, WorkflowEvent, WorkflowResult, WorkflowStatus,
};
use ledgerflow_durable::WorkflowEngine;

// =============================================================================
// Scenario A: parallel tasks completing in different orders
// =============================================================================

struct FanOut;

impl Workflow for FanOut {
    const KIND: &'static str = "fan_out";
    type Input = Value;
    type Output = Value;

    fn run(&self, ctx: &mut WorkflowContext, _input: Value) -> WorkflowResult<Value> {
        let handles = (1..=3)
            .map(|n| ctx.schedule_task("part", json!({ "n": n })))
            .collect::<WorkflowResult<Vec<_>>>()?;
        let outcomes = ctx.wait_all(&handles)?;

        let mut merged = Map::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            merged.insert(format!("part{}", index + 1), outcome.into_value()?);
        }
        Ok(Value::Object(merged))
    }
}

async fn run_fan_out(order: [u64; 3]) -> (WorkflowStatus, Option<Value>) {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let mut workflows = WorkflowRegistry::new();
    workflows.register(FanOut);
    let runner = runner(&store, workflows, TaskRegistry::new());
    let engine = runner.engine().clone();

    let id = engine.start::<FanOut>(json!({})).await.unwrap();
    resume_next(&runner, &store, "w1", "default").await.unwrap();
    assert_eq!(engine.get_workflow(id).await.unwrap().status, WorkflowStatus::Waiting);

    let mut claims = Vec::new();
    while let Some(claim) = store.claim_task("task-worker", "default", LEASE).await.unwrap() {
        claims.push(claim);
    }
    assert_eq!(claims.len(), 3);

    for n in order {
        let claim = claims
            .iter()
            .find(|c| c.task.input["n"] == json!(n))
            .unwrap();
        let disposition = engine.complete_task(claim, json!(n * 10)).await.unwrap();
        assert_eq!(disposition, TaskDisposition::Recorded);

        // Resume between completions so every order takes a different path
        resume_next(&runner, &store, "w1", "default").await.unwrap();
    }

    let state = engine.project(id).await.unwrap();
    assert!(state.tasks.values().all(|t| t.status == TaskStatus::Completed));
    (state.status, state.result)
}

#[tokio::test]
async fn test_parallel_tasks_converge_regardless_of_completion_order() {
    let expected = json!({"part1": 10, "part2": 20, "part3": 30});

    for order in [[1, 2, 3], [3, 2, 1], [2, 1, 3]] {
        let (status, result) = run_fan_out(order).await;
        assert_eq!(status, WorkflowStatus::Completed, "order {:?}", order);
        assert_eq!(result, Some(expected.clone()), "order {:?}", order);
    }
}

// =============================================================================
// Scenario B: concurrent child scheduling under one idempotency key
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_child_scheduling_creates_one_child() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let engine = WorkflowEngine::new(store.clone());
    let parent = engine
        .start_workflow(NewWorkflow::new("batch", json!({})))
        .await
        .unwrap()
        .id();

    let spawn = |engine: WorkflowEngine| {
        tokio::spawn(async move {
            engine
                .schedule_child(
                    parent,
                    "shard",
                    json!({"shard": 1}),
                    ChildOptions::default().idempotency_key("K"),
                )
                .await
        })
    };
    let (first, second) = tokio::join!(spawn(engine.clone()), spawn(engine.clone()));
    let first = first.unwrap().unwrap();
    let second = second.unwrap().unwrap();

    assert_eq!(first.id(), second.id());
    let created = [first, second]
        .iter()
        .filter(|o| matches!(o, CreateOutcome::Created(_)))
        .count();
    assert_eq!(created, 1);

    assert_eq!(store.children_of(parent).len(), 1);
    let started = engine
        .read_events(parent, 1)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.event, WorkflowEvent::ChildWorkflowStarted { .. }))
        .count();
    assert_eq!(started, 1);
    assert_eq!(engine.children(parent).await.unwrap().len(), 1);
}

// =============================================================================
// Scenario C: timer cancelled before it fires
// =============================================================================

struct Reminder;

impl Workflow for Reminder {
    const KIND: &'static str = "reminder";
    type Input = Value;
    type Output = Value;

    fn run(&self, ctx: &mut WorkflowContext, _input: Value) -> WorkflowResult<Value> {
        let fire_at = ctx.now() + chrono::Duration::seconds(1);
        let timer = ctx.start_timer("remind", fire_at)?;
        let stop = ctx.create_promise("stop", None)?;

        let (winner, _) = ctx.wait_any(&[timer, stop])?;
        if winner == 1 {
            ctx.cancel_timer("remind")?;
        }

        // Stay open so a late firing would still have somewhere to land
        let done = ctx.create_promise("done", None)?;
        ctx.wait(&done)?.into_value()
    }
}

#[tokio::test]
async fn test_cancelled_timer_never_fires() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let mut workflows = WorkflowRegistry::new();
    workflows.register(Reminder);
    let runner = runner(&store, workflows, TaskRegistry::new());
    let engine = runner.engine().clone();

    let id = engine.start::<Reminder>(json!({})).await.unwrap();
    resume_next(&runner, &store, "w1", "default").await.unwrap();
    assert_eq!(engine.fire_due_timers(Utc::now()).await.unwrap(), 0);

    engine
        .resolve_promise(
            PromiseTarget::Named {
                workflow_id: id,
                name: "stop".to_string(),
            },
            json!("stop"),
        )
        .await
        .unwrap();
    resume_next(&runner, &store, "w1", "default").await.unwrap();

    // Well past the original fire time
    let fired = engine
        .fire_due_timers(Utc::now() + chrono::Duration::seconds(2))
        .await
        .unwrap();
    assert_eq!(fired, 0);

    let events = engine.read_events(id, 1).await.unwrap();
    assert!(!events
        .iter()
        .any(|e| matches!(e.event, WorkflowEvent::TimerFired { .. })));
    assert!(events.iter().any(|e| matches!(
        &e.event,
        WorkflowEvent::TimerCancelled { timer_id, .. } if timer_id == "remind"
    )));

    let state = engine.project(id).await.unwrap();
    assert_eq!(state.timers["remind"].status, TimerStatus::Cancelled);
    assert_eq!(state.status, WorkflowStatus::Waiting);
}

// =============================================================================
// Scenario D: cancellation while a child is running
// =============================================================================

struct Supervisor;

impl Workflow for Supervisor {
    const KIND: &'static str = "supervisor";
    type Input = Value;
    type Output = Value;

    fn run(&self, ctx: &mut WorkflowContext, input: Value) -> WorkflowResult<Value> {
        let child = ctx.schedule_child(
            Idle::KIND,
            input,
            ChildOptions::default()
                .idempotency_key("only")
                .queue("children"),
        )?;
        ctx.wait(&child)?.into_value()
    }
}

/// Waits on a promise nobody resolves
struct Idle;

impl Workflow for Idle {
    const KIND: &'static str = "idle";
    type Input = Value;
    type Output = Value;

    fn run(&self, ctx: &mut WorkflowContext, _input: Value) -> WorkflowResult<Value> {
        let forever = ctx.create_promise("forever", None)?;
        ctx.wait(&forever)?.into_value()
    }
}

#[tokio::test]
async fn test_parent_cancellation_waits_for_running_child() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let mut workflows = WorkflowRegistry::new();
    workflows.register(Supervisor);
    workflows.register(Idle);
    let runner = runner(&store, workflows, TaskRegistry::new());
    let engine = runner.engine().clone();

    let parent = engine.start::<Supervisor>(json!({})).await.unwrap();
    resume_next(&runner, &store, "w1", "default").await.unwrap();
    let child = store.children_of(parent)[0].id;

    // A worker holds the child when the parent is cancelled
    let child_claim = store
        .claim_workflow("w2", "children", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child_claim.workflow.id, child);

    assert!(engine.request_cancellation(parent, "shutdown").await.unwrap());

    let child_events = engine.read_events(child, 1).await.unwrap();
    assert!(child_events
        .iter()
        .any(|e| matches!(e.event, WorkflowEvent::CancellationRequested { .. })));
    assert_eq!(engine.get_workflow(child).await.unwrap().status, WorkflowStatus::Cancelling);
    assert_eq!(engine.get_workflow(parent).await.unwrap().status, WorkflowStatus::Cancelling);

    // Sweeps cannot finish the parent while the child is open
    engine.run_maintenance(Utc::now()).await.unwrap();
    assert_eq!(engine.get_workflow(parent).await.unwrap().status, WorkflowStatus::Cancelling);

    // The child's worker observes the cancellation on its next submission
    let history = store.read_events(child, 1).await.unwrap();
    let resumption = runner.resume(&child_claim, history).await.unwrap();
    assert!(matches!(resumption, Resumption::Finished | Resumption::Cancelling));
    assert_eq!(engine.get_workflow(child).await.unwrap().status, WorkflowStatus::Cancelled);

    engine.run_maintenance(Utc::now()).await.unwrap();
    let state = engine.project(parent).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert_eq!(state.children[&child].status, ChildStatus::Cancelled);

    // The child's terminal event precedes the parent's
    let events = engine.read_events(parent, 1).await.unwrap();
    let child_cancelled = events
        .iter()
        .position(|e| matches!(e.event, WorkflowEvent::ChildWorkflowCancelled { .. }))
        .unwrap();
    let parent_cancelled = events
        .iter()
        .position(|e| matches!(e.event, WorkflowEvent::WorkflowCancelled { .. }))
        .unwrap();
    assert!(child_cancelled < parent_cancelled);
}

// =============================================================================
// Scenario E: task lease expiry and reclaim
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_expired_task_lease_is_reclaimed_by_second_worker() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let engine = WorkflowEngine::new(store.clone());
    let task_id = engine
        .submit_task("send_email", json!({"to": "ops"}), TaskOptions::default())
        .await
        .unwrap()
        .id();

    let first = store
        .claim_task("w1", "default", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.task.attempt, 1);

    // w1 crashes without heartbeating
    store.expire_task_lease(task_id);
    let report = engine.reclaim_expired_tasks(Utc::now()).await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(engine.get_task(task_id).await.unwrap().status, TaskStatus::Pending);

    let second = store
        .claim_task("w2", "default", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.task.id, task_id);
    assert_eq!(second.task.attempt, 2);

    // The first worker has lost the task for good
    let token = ClaimToken::Task {
        task_id,
        worker_id: "w1".to_string(),
        attempt: 1,
    };
    let heartbeat = engine.scheduler().heartbeat(&token).await.unwrap();
    assert!(!heartbeat.accepted);
    let late = engine.complete_task(&first, json!({"sent": "w1"})).await;
    assert!(matches!(late, Err(EngineError::ClaimLeaseExpired(_))));

    engine
        .complete_task(&second, json!({"sent": "w2"}))
        .await
        .unwrap();
    let task = engine.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output, Some(json!({"sent": "w2"})));
}

#[tokio::test]
async fn test_released_task_never_exceeds_its_attempts() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let engine = WorkflowEngine::new(store.clone());
    let task_id = engine
        .submit_task(
            "send_email",
            json!({"to": "ops"}),
            TaskOptions::default().max_retries(1),
        )
        .await
        .unwrap()
        .id();

    let first = store.claim_task("w1", "default", LEASE).await.unwrap().unwrap();
    let token = ClaimToken::Task {
        task_id,
        worker_id: "w1".to_string(),
        attempt: first.task.attempt,
    };
    engine.scheduler().release(&token).await.unwrap();

    let second = store.claim_task("w2", "default", LEASE).await.unwrap().unwrap();
    assert_eq!(second.task.attempt, 2);

    // The final attempt is not handed back to the queue
    let token = ClaimToken::Task {
        task_id,
        worker_id: "w2".to_string(),
        attempt: 2,
    };
    engine.scheduler().release(&token).await.unwrap();
    assert!(store.claim_task("w3", "default", LEASE).await.unwrap().is_none());
    assert_eq!(engine.get_task(task_id).await.unwrap().status, TaskStatus::Running);

    assert_eq!(engine.release_task(&second).await.unwrap(), TaskStatus::Failed);
    let task = engine.get_task(task_id).await.unwrap();
    assert_eq!(task.attempt, 2);
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(store.claim_task("w3", "default", LEASE).await.unwrap().is_none());
}
