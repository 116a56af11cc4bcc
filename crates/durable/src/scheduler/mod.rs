//! Work distribution
//!
//! The [`Scheduler`] hands claimable workflows and tasks to polling workers.
//! Claims are row-level leases taken with "lock the first unlocked matching
//! row, skip locked rows", so competing workers never receive the same
//! execution. Within a class work is FIFO by readiness; across classes the
//! scheduler alternates which one it tries first, so a deep task backlog
//! cannot starve workflow resumptions or the other way round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::persistence::{
    ClaimCandidate, HeartbeatResponse, StoreError, TaskClaim, WorkKind, WorkflowClaim,
    WorkflowEventStore,
};
use crate::reliability::{retry_transient, RetryPolicy};
use crate::workflow::EventEnvelope;

/// Work handed to a worker
#[derive(Debug, Clone)]
pub enum ClaimedWork {
    /// A workflow to resume, with its full history
    Workflow {
        claim: WorkflowClaim,
        history: Vec<EventEnvelope>,
    },
    Task(TaskClaim),
}

impl ClaimedWork {
    pub fn token(&self) -> ClaimToken {
        match self {
            Self::Workflow { claim, .. } => ClaimToken::Workflow {
                workflow_id: claim.workflow.id,
                worker_id: claim.worker_id.clone(),
            },
            Self::Task(claim) => ClaimToken::Task {
                task_id: claim.task.id,
                worker_id: claim.worker_id.clone(),
                attempt: claim.task.attempt,
            },
        }
    }
}

/// Identifies a held claim for heartbeats and release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimToken {
    Workflow {
        workflow_id: Uuid,
        worker_id: String,
    },
    Task {
        task_id: Uuid,
        worker_id: String,
        attempt: u32,
    },
}

/// Claims work for workers
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn WorkflowEventStore>,
    lease: Duration,
    store_retry: RetryPolicy,
    tasks_first: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn WorkflowEventStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            lease: config.lease,
            store_retry: config.store_retry.clone(),
            tasks_first: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Claim the next piece of work on a queue
    #[instrument(skip(self))]
    pub async fn claim_next(
        &self,
        worker_id: &str,
        queue: &str,
    ) -> Result<Option<ClaimedWork>, StoreError> {
        let order = if self.tasks_first.fetch_xor(true, Ordering::Relaxed) {
            [WorkKind::Task, WorkKind::Workflow]
        } else {
            [WorkKind::Workflow, WorkKind::Task]
        };

        for kind in order {
            let claimed = match kind {
                WorkKind::Workflow => self.claim_workflow(worker_id, queue).await?,
                WorkKind::Task => self.claim_task(worker_id, queue).await?,
            };
            if claimed.is_some() {
                return Ok(claimed);
            }
        }
        Ok(None)
    }

    async fn claim_workflow(
        &self,
        worker_id: &str,
        queue: &str,
    ) -> Result<Option<ClaimedWork>, StoreError> {
        let claim = retry_transient(&self.store_retry, "claim_workflow", || {
            self.store.claim_workflow(worker_id, queue, self.lease)
        })
        .await?;
        let Some(claim) = claim else {
            return Ok(None);
        };

        let workflow_id = claim.workflow.id;
        let history = match retry_transient(&self.store_retry, "read_events", || {
            self.store.read_events(workflow_id, 1)
        })
        .await
        {
            Ok(history) => history,
            Err(e) => {
                if let Err(release) = self.store.release_workflow(workflow_id, worker_id).await {
                    warn!(%workflow_id, "Failed to release claim after read error: {}", release);
                }
                return Err(e);
            }
        };

        debug!(%workflow_id, worker_id, events = history.len(), "Claimed workflow");
        Ok(Some(ClaimedWork::Workflow { claim, history }))
    }

    async fn claim_task(
        &self,
        worker_id: &str,
        queue: &str,
    ) -> Result<Option<ClaimedWork>, StoreError> {
        let claim = retry_transient(&self.store_retry, "claim_task", || {
            self.store.claim_task(worker_id, queue, self.lease)
        })
        .await?;
        if let Some(claim) = &claim {
            debug!(task_id = %claim.task.id, worker_id, attempt = claim.task.attempt, "Claimed task");
        }
        Ok(claim.map(ClaimedWork::Task))
    }

    /// Extend the lease of a held claim
    pub async fn heartbeat(&self, token: &ClaimToken) -> Result<HeartbeatResponse, StoreError> {
        match token {
            ClaimToken::Workflow {
                workflow_id,
                worker_id,
            } => {
                self.store
                    .heartbeat_workflow(*workflow_id, worker_id, self.lease)
                    .await
            }
            ClaimToken::Task {
                task_id, worker_id, ..
            } => self.store.heartbeat_task(*task_id, worker_id, self.lease).await,
        }
    }

    /// Give up a claim without submitting anything
    ///
    /// A released task goes back to the queue and the attempt still counts.
    /// On its final attempt the task is not requeued: it stays claimed until
    /// the lease runs out and the sweep fails it. Workers holding a
    /// [`TaskClaim`] should prefer [`WorkflowEngine::release_task`], which
    /// fails it at once.
    ///
    /// [`WorkflowEngine::release_task`]: crate::engine::WorkflowEngine::release_task
    pub async fn release(&self, token: &ClaimToken) -> Result<(), StoreError> {
        match token {
            ClaimToken::Workflow {
                workflow_id,
                worker_id,
            } => self.store.release_workflow(*workflow_id, worker_id).await,
            ClaimToken::Task {
                task_id, attempt, ..
            } => self.store.requeue_task(*task_id, *attempt).await.map(|_| ()),
        }
    }

    /// Work a worker polling `queue` could claim right now
    pub async fn list_claimable(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>, StoreError> {
        self.store.list_claimable(queue, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowEventStore, NewTask, NewWorkflow};
    use serde_json::json;

    fn scheduler(store: Arc<InMemoryWorkflowEventStore>) -> Scheduler {
        Scheduler::new(store, &EngineConfig::default())
    }

    fn standalone(kind: &str) -> NewTask {
        NewTask {
            id: Uuid::now_v7(),
            workflow_id: None,
            kind: kind.to_string(),
            queue: "default".to_string(),
            input: json!({}),
            idempotency_key: None,
            max_retries: 0,
        }
    }

    #[tokio::test]
    async fn test_alternates_between_classes() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        for _ in 0..2 {
            store
                .create_workflow(NewWorkflow::new("order", json!({})))
                .await
                .unwrap();
            store.enqueue_task(standalone("email")).await.unwrap();
        }
        let scheduler = scheduler(store);

        let mut kinds = vec![];
        while let Some(work) = scheduler.claim_next("w1", "default").await.unwrap() {
            kinds.push(matches!(work, ClaimedWork::Task(_)));
        }
        assert_eq!(kinds, vec![false, true, false, true]);
    }

    #[tokio::test]
    async fn test_workflow_claim_carries_history() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        store
            .create_workflow(NewWorkflow::new("order", json!({"id": 1})))
            .await
            .unwrap();
        let scheduler = scheduler(store);

        let Some(ClaimedWork::Workflow { claim, history }) =
            scheduler.claim_next("w1", "default").await.unwrap()
        else {
            panic!("expected a workflow");
        };
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sequence, 1);

        let token = ClaimToken::Workflow {
            workflow_id: claim.workflow.id,
            worker_id: "w1".to_string(),
        };
        assert!(scheduler.heartbeat(&token).await.unwrap().accepted);
        scheduler.release(&token).await.unwrap();
        assert_eq!(scheduler.list_claimable("default", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_other_queues_are_ignored() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        store
            .create_workflow(NewWorkflow::new("order", json!({})).with_queue("billing"))
            .await
            .unwrap();
        let scheduler = scheduler(store);

        assert!(scheduler.claim_next("w1", "default").await.unwrap().is_none());
        assert!(scheduler.claim_next("w1", "billing").await.unwrap().is_some());
    }
}
