//! Task results and the task queue's recovery sweep

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::executor::{EngineError, Plan, WorkflowEngine};
use super::machine::{plan_task_result, settled_status, TaskResult};
use crate::persistence::{CreateOutcome, NewTask, TaskClaim, TaskRecord, TaskSettlement};
use crate::replay::TaskOptions;
use crate::task::TaskError;
use crate::workflow::TaskStatus;

/// What happened to a reported task result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    /// Settled; for workflow tasks the owning log recorded it
    Recorded,
    /// A retryable failure with attempts left; the task runs again
    Retrying { visible_at: DateTime<Utc> },
    /// The row settled but the owning workflow no longer cares
    Discarded,
}

/// Outcome of [`WorkflowEngine::reclaim_expired_tasks`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub requeued: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl WorkflowEngine {
    /// Enqueue a task that belongs to no workflow
    #[instrument(skip(self, input, options))]
    pub async fn submit_task(
        &self,
        kind: &str,
        input: Value,
        options: TaskOptions,
    ) -> Result<CreateOutcome, EngineError> {
        let task = NewTask {
            id: Uuid::now_v7(),
            workflow_id: None,
            kind: kind.to_string(),
            queue: options
                .queue
                .unwrap_or_else(|| self.config.default_queue.clone()),
            input,
            idempotency_key: options.idempotency_key,
            max_retries: options
                .max_retries
                .unwrap_or(self.config.default_max_retries),
        };
        let outcome = self
            .store_call("enqueue_task", || self.store.enqueue_task(task.clone()))
            .await?;
        debug!(task_id = %outcome.id(), kind, ?outcome, "Submitted standalone task");
        Ok(outcome)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, EngineError> {
        Ok(self
            .store_call("get_task", || self.store.get_task(task_id))
            .await?)
    }

    /// Report a successful attempt
    #[instrument(skip(self, claim, output), fields(task_id = %claim.task.id, attempt = claim.task.attempt))]
    pub async fn complete_task(
        &self,
        claim: &TaskClaim,
        output: Value,
    ) -> Result<TaskDisposition, EngineError> {
        let record = self.held_task(claim).await?;
        self.settle(&record, &claim.worker_id, TaskResult::Completed(output))
            .await
    }

    /// Report a failed attempt
    ///
    /// A retryable error with attempts left puts the task back in the queue
    /// after a backoff and touches no workflow log. Anything else is final.
    #[instrument(skip(self, claim, error), fields(task_id = %claim.task.id, attempt = claim.task.attempt))]
    pub async fn fail_task(
        &self,
        claim: &TaskClaim,
        error: TaskError,
    ) -> Result<TaskDisposition, EngineError> {
        let record = self.held_task(claim).await?;
        if record.cancel_requested {
            return self
                .settle(&record, &claim.worker_id, TaskResult::Cancelled)
                .await;
        }

        if error.retryable && record.has_attempts_remaining() {
            let delay = self.config.task_retry.delay_for_retry(record.attempt);
            let visible_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.store_call("retry_task", || {
                self.store.retry_task(
                    record.id,
                    &claim.worker_id,
                    record.attempt,
                    visible_at,
                    &error,
                )
            })
            .await?;
            info!(
                task_id = %record.id,
                attempt = record.attempt,
                max_attempts = record.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                "Task attempt failed, retrying: {}",
                error
            );
            return Ok(TaskDisposition::Retrying { visible_at });
        }

        warn!(task_id = %record.id, attempt = record.attempt, "Task failed: {}", error);
        self.settle(&record, &claim.worker_id, TaskResult::Failed(error))
            .await
    }

    /// Report that an attempt stopped because cancellation was requested
    pub async fn cancel_task(&self, claim: &TaskClaim) -> Result<TaskDisposition, EngineError> {
        let record = self.held_task(claim).await?;
        self.settle(&record, &claim.worker_id, TaskResult::Cancelled)
            .await
    }

    /// Requeue or fail tasks whose worker stopped heartbeating
    #[instrument(skip(self))]
    pub async fn reclaim_expired_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport, EngineError> {
        let expired = self
            .store_call("expired_task_claims", || {
                self.store
                    .expired_task_claims(now, self.config.sweep_batch_size)
            })
            .await?;

        let mut report = ReclaimReport::default();
        for record in expired {
            match self.reclaim(&record).await {
                Ok(Some(TaskStatus::Pending)) => report.requeued += 1,
                Ok(Some(TaskStatus::Cancelled)) => report.cancelled += 1,
                Ok(Some(_)) => report.failed += 1,
                Ok(None) => {}
                Err(e) => warn!(task_id = %record.id, "Failed to reclaim expired task: {}", e),
            }
        }
        if report != ReclaimReport::default() {
            info!(?report, "Reclaimed expired task claims");
        }
        Ok(report)
    }

    /// Give up a held claim without a result
    ///
    /// With attempts left the task goes back to the queue and the attempt
    /// still counts. On the final attempt the task fails instead, so a
    /// task is never claimed more than `max_retries + 1` times.
    #[instrument(skip(self, claim), fields(task_id = %claim.task.id, attempt = claim.task.attempt))]
    pub async fn release_task(&self, claim: &TaskClaim) -> Result<TaskStatus, EngineError> {
        let record = self.held_task(claim).await?;
        let error = TaskError::non_retryable(format!(
            "released on final attempt {} of {}",
            record.attempt,
            record.max_attempts()
        ))
        .with_type(TaskError::RELEASED);
        let status = self
            .give_back(&record, &claim.worker_id, error)
            .await?
            .ok_or(EngineError::ClaimLeaseExpired(record.id))?;
        debug!(task_id = %record.id, %status, "Released task claim");
        Ok(status)
    }

    async fn reclaim(&self, record: &TaskRecord) -> Result<Option<TaskStatus>, EngineError> {
        let worker_id = record.claimed_by.clone().unwrap_or_default();
        let error = TaskError::non_retryable(format!(
            "lease expired on attempt {} of {}",
            record.attempt,
            record.max_attempts()
        ))
        .with_type(TaskError::LEASE_EXPIRED);
        self.give_back(record, &worker_id, error).await
    }

    /// Requeue a claimed task, or settle it with `exhausted` when no
    /// attempts remain. `None` when another writer moved the row first.
    async fn give_back(
        &self,
        record: &TaskRecord,
        worker_id: &str,
        exhausted: TaskError,
    ) -> Result<Option<TaskStatus>, EngineError> {
        if record.cancel_requested {
            self.settle(record, worker_id, TaskResult::Cancelled)
                .await?;
            return Ok(Some(TaskStatus::Cancelled));
        }
        if record.has_attempts_remaining() {
            let requeued = self
                .store_call("requeue_task", || {
                    self.store.requeue_task(record.id, record.attempt)
                })
                .await?;
            if requeued {
                debug!(task_id = %record.id, attempt = record.attempt, "Requeued task");
            }
            return Ok(requeued.then_some(TaskStatus::Pending));
        }

        warn!(task_id = %record.id, attempt = record.attempt, "Task out of attempts: {}", exhausted);
        self.settle(record, worker_id, TaskResult::Failed(exhausted))
            .await?;
        Ok(Some(TaskStatus::Failed))
    }

    /// Re-read the row behind a claim and check the claim still holds it
    async fn held_task(&self, claim: &TaskClaim) -> Result<TaskRecord, EngineError> {
        let task_id = claim.task.id;
        let record = self.get_task(task_id).await?;
        if record.status != TaskStatus::Running
            || record.claimed_by.as_deref() != Some(claim.worker_id.as_str())
            || record.attempt != claim.task.attempt
        {
            return Err(EngineError::ClaimLeaseExpired(task_id));
        }
        Ok(record)
    }

    /// Settle the task row and, for workflow tasks, record the result in the
    /// owning log in the same commit
    async fn settle(
        &self,
        record: &TaskRecord,
        worker_id: &str,
        result: TaskResult,
    ) -> Result<TaskDisposition, EngineError> {
        let (output, error) = match &result {
            TaskResult::Completed(output) => (Some(output.clone()), None),
            TaskResult::Failed(error) => (None, Some(error.clone())),
            TaskResult::Cancelled => (None, None),
        };
        let settlement = TaskSettlement {
            task_id: record.id,
            worker_id: worker_id.to_string(),
            attempt: record.attempt,
            status: settled_status(&result),
            output,
            error,
        };

        let Some(workflow_id) = record.workflow_id else {
            self.store_call("settle_task", || {
                self.store.settle_task(settlement.clone())
            })
            .await?;
            return Ok(TaskDisposition::Recorded);
        };

        let applied = self
            .apply(workflow_id, "record_task_result", |_, state| {
                Ok(
                    match plan_task_result(
                        state,
                        workflow_id,
                        record.id,
                        record.attempt,
                        &result,
                        Utc::now(),
                    ) {
                        Some(mut transition) => {
                            transition.settle_task = Some(settlement.clone());
                            Plan::Commit(transition, true)
                        }
                        None => Plan::Done(false),
                    },
                )
            })
            .await?;

        if !applied.value {
            self.store_call("settle_task", || {
                self.store.settle_task(settlement.clone())
            })
            .await?;
            debug!(task_id = %record.id, %workflow_id, "Discarded result of abandoned task");
            return Ok(TaskDisposition::Discarded);
        }

        self.drive(applied.follow_ups).await;
        Ok(TaskDisposition::Recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::persistence::{InMemoryWorkflowEventStore, NewWorkflow, WorkflowEventStore};
    use crate::reliability::RetryPolicy;
    use crate::workflow::{WorkflowCommand, WorkflowEvent, WorkflowStatus};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine(store: Arc<InMemoryWorkflowEventStore>) -> WorkflowEngine {
        let config = EngineConfig::default()
            .with_task_retry(RetryPolicy::fixed(Duration::ZERO, 10));
        WorkflowEngine::with_config(store, config)
    }

    /// Start a workflow and schedule one task from its first resumption
    async fn workflow_with_task(
        engine: &WorkflowEngine,
        store: &InMemoryWorkflowEventStore,
        max_retries: u32,
    ) -> (Uuid, TaskClaim) {
        let id = engine
            .start_workflow(NewWorkflow::new("order", json!({})))
            .await
            .unwrap()
            .id();
        store.claim_workflow("w1", "default", Duration::from_secs(30)).await.unwrap();
        engine
            .submit_commands(
                id,
                "w1",
                1,
                vec![WorkflowCommand::ScheduleTask {
                    kind: "charge".to_string(),
                    queue: None,
                    input: json!({"amount": 10}),
                    idempotency_key: None,
                    max_retries: Some(max_retries),
                }],
            )
            .await
            .unwrap();
        let claim = store
            .claim_task("w2", "default", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        (id, claim)
    }

    #[tokio::test]
    async fn test_complete_records_in_workflow_log() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = engine(store.clone());
        let (id, claim) = workflow_with_task(&engine, &store, 0).await;

        let disposition = engine.complete_task(&claim, json!("ok")).await.unwrap();
        assert_eq!(disposition, TaskDisposition::Recorded);

        let events = engine.read_events(id, 1).await.unwrap();
        assert!(matches!(
            events.last().unwrap().event,
            WorkflowEvent::TaskCompleted { attempt: 1, .. }
        ));
        assert_eq!(engine.get_workflow(id).await.unwrap().status, WorkflowStatus::Running);
        assert_eq!(engine.get_task(claim.task.id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_retryable_failure_requeues_without_event() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = engine(store.clone());
        let (id, claim) = workflow_with_task(&engine, &store, 1).await;
        let before = engine.read_events(id, 1).await.unwrap().len();

        let disposition = engine
            .fail_task(&claim, TaskError::retryable("card declined"))
            .await
            .unwrap();
        assert!(matches!(disposition, TaskDisposition::Retrying { .. }));
        assert_eq!(engine.read_events(id, 1).await.unwrap().len(), before);

        let second = store
            .claim_task("w2", "default", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.task.attempt, 2);

        let disposition = engine
            .fail_task(&second, TaskError::retryable("card declined"))
            .await
            .unwrap();
        assert_eq!(disposition, TaskDisposition::Recorded);
        let events = engine.read_events(id, 1).await.unwrap();
        assert!(matches!(
            events.last().unwrap().event,
            WorkflowEvent::TaskFailed { attempt: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_stale_claim_is_rejected() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = engine(store.clone());
        let (_, claim) = workflow_with_task(&engine, &store, 3).await;

        store.expire_task_lease(claim.task.id);
        let report = engine.reclaim_expired_tasks(Utc::now()).await.unwrap();
        assert_eq!(report.requeued, 1);

        let result = engine.complete_task(&claim, json!("late")).await;
        assert!(matches!(result, Err(EngineError::ClaimLeaseExpired(_))));
    }

    #[tokio::test]
    async fn test_expiry_on_last_attempt_fails_task() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = engine(store.clone());
        let (id, claim) = workflow_with_task(&engine, &store, 0).await;

        store.expire_task_lease(claim.task.id);
        let report = engine.reclaim_expired_tasks(Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);

        let task = engine.get_task(claim.task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error.and_then(|e| e.error_type).as_deref(),
            Some(TaskError::LEASE_EXPIRED)
        );
        let events = engine.read_events(id, 1).await.unwrap();
        assert!(matches!(events.last().unwrap().event, WorkflowEvent::TaskFailed { .. }));
    }

    #[tokio::test]
    async fn test_release_requeues_while_attempts_remain() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = engine(store.clone());
        let (id, claim) = workflow_with_task(&engine, &store, 1).await;
        let before = engine.read_events(id, 1).await.unwrap().len();

        assert_eq!(engine.release_task(&claim).await.unwrap(), TaskStatus::Pending);
        assert_eq!(engine.read_events(id, 1).await.unwrap().len(), before);

        let second = store
            .claim_task("w3", "default", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.task.attempt, 2);

        // Old claim is gone once the task moved on
        let stale = engine.release_task(&claim).await;
        assert!(matches!(stale, Err(EngineError::ClaimLeaseExpired(_))));
    }

    #[tokio::test]
    async fn test_release_on_last_attempt_fails_task() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = engine(store.clone());
        let (id, claim) = workflow_with_task(&engine, &store, 0).await;

        assert_eq!(engine.release_task(&claim).await.unwrap(), TaskStatus::Failed);

        let task = engine.get_task(claim.task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 1);
        assert_eq!(
            task.error.and_then(|e| e.error_type).as_deref(),
            Some(TaskError::RELEASED)
        );
        let events = engine.read_events(id, 1).await.unwrap();
        assert!(matches!(
            events.last().unwrap().event,
            WorkflowEvent::TaskFailed { attempt: 1, .. }
        ));
        assert!(store
            .claim_task("w3", "default", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_standalone_task_dedup_and_settle() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = engine(store.clone());

        let options = TaskOptions::default().idempotency_key("email-42");
        let first = engine
            .submit_task("email", json!({"to": "a@example.com"}), options.clone())
            .await
            .unwrap();
        let second = engine
            .submit_task("email", json!({"to": "a@example.com"}), options)
            .await
            .unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));
        assert_eq!(second, CreateOutcome::Existing(first.id()));

        let claim = store
            .claim_task("w1", "default", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let disposition = engine
            .fail_task(&claim, TaskError::non_retryable("bad address"))
            .await
            .unwrap();
        assert_eq!(disposition, TaskDisposition::Recorded);
        assert_eq!(engine.get_task(first.id()).await.unwrap().status, TaskStatus::Failed);
    }
}
