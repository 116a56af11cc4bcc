//! Shared helpers for the in-memory integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ledgerflow_durable::engine::WorkflowRegistry;
use ledgerflow_durable::persistence::{InMemoryWorkflowEventStore, WorkflowEventStore};
use ledgerflow_durable::scheduler::ClaimedWork;
use ledgerflow_durable::task::TaskRegistry;
use ledgerflow_durable::worker::{Resumption, WorkflowRunner};
use ledgerflow_durable::WorkflowEngine;
use uuid::Uuid;

pub const LEASE: Duration = Duration::from_secs(30);

pub fn runner(
    store: &Arc<InMemoryWorkflowEventStore>,
    workflows: WorkflowRegistry,
    tasks: TaskRegistry,
) -> WorkflowRunner {
    WorkflowRunner::new(WorkflowEngine::new(store.clone()), workflows, tasks)
}

/// Claim and resume the next workflow on `queue`, if any is claimable
pub async fn resume_next(
    runner: &WorkflowRunner,
    store: &InMemoryWorkflowEventStore,
    worker_id: &str,
    queue: &str,
) -> Option<(Uuid, Resumption)> {
    let claim = store.claim_workflow(worker_id, queue, LEASE).await.unwrap()?;
    let history = store.read_events(claim.workflow.id, 1).await.unwrap();
    let resumption = runner.resume(&claim, history).await.unwrap();
    Some((claim.workflow.id, resumption))
}

/// Run everything claimable on `queue` until nothing is left
pub async fn drain(runner: &WorkflowRunner, queue: &str) -> usize {
    let scheduler = runner.engine().scheduler().clone();
    let mut processed = 0;
    while let Some(work) = scheduler.claim_next("drain-worker", queue).await.unwrap() {
        match work {
            ClaimedWork::Workflow { claim, history } => {
                runner.resume(&claim, history).await.unwrap();
            }
            ClaimedWork::Task(claim) => {
                runner
                    .execute_task(&claim, Duration::from_millis(50))
                    .await
                    .unwrap();
            }
        }
        processed += 1;
    }
    processed
}
