//! In-memory implementation of WorkflowEventStore for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::task::TaskError;
use crate::workflow::{EventEnvelope, TaskStatus, WorkflowEvent, WorkflowStatus};

struct ExecutionRow {
    record: WorkflowRecord,
    events: Vec<EventEnvelope>,
}

#[derive(Default)]
struct Inner {
    executions: HashMap<Uuid, ExecutionRow>,
    /// (parent or none, idempotency key) -> execution id
    execution_keys: HashMap<(Option<Uuid>, String), Uuid>,
    tasks: HashMap<Uuid, TaskRecord>,
    task_keys: HashMap<String, Uuid>,
    wakeups: BTreeMap<WakeupKey, DateTime<Utc>>,
    promise_keys: HashMap<String, PromiseKey>,
}

impl Inner {
    fn execution(&self, id: Uuid) -> Result<&ExecutionRow, StoreError> {
        self.executions
            .get(&id)
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    fn insert_execution(&mut self, workflow: NewWorkflow, now: DateTime<Utc>) {
        let started = workflow.started_event();
        if let Some(key) = &workflow.idempotency_key {
            self.execution_keys
                .insert((workflow.parent_id, key.clone()), workflow.id);
        }
        let record = WorkflowRecord {
            id: workflow.id,
            kind: workflow.kind,
            version: workflow.version,
            queue: workflow.queue,
            status: WorkflowStatus::Pending,
            parent_id: workflow.parent_id,
            idempotency_key: workflow.idempotency_key,
            input: workflow.input,
            last_sequence: 1,
            claimed_by: None,
            lease_expires_at: None,
            ready_at: now,
            parent_notify_pending: false,
            created_at: now,
            updated_at: now,
        };
        self.executions.insert(
            workflow.id,
            ExecutionRow {
                record,
                events: vec![EventEnvelope {
                    workflow_id: workflow.id,
                    sequence: 1,
                    event: started,
                    recorded_at: now,
                }],
            },
        );
    }

    fn insert_task(&mut self, task: NewTask, now: DateTime<Utc>) {
        if task.workflow_id.is_none() {
            if let Some(key) = &task.idempotency_key {
                self.task_keys.insert(key.clone(), task.id);
            }
        }
        self.tasks.insert(
            task.id,
            TaskRecord {
                id: task.id,
                workflow_id: task.workflow_id,
                kind: task.kind,
                queue: task.queue,
                input: task.input,
                idempotency_key: task.idempotency_key,
                status: TaskStatus::Pending,
                attempt: 0,
                max_retries: task.max_retries,
                claimed_by: None,
                lease_expires_at: None,
                visible_at: now,
                cancel_requested: false,
                output: None,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// The task row held by `worker_id` at `attempt`
    fn claimed_task(
        &mut self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
    ) -> Result<&mut TaskRecord, StoreError> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        if task.status != TaskStatus::Running
            || task.claimed_by.as_deref() != Some(worker_id)
            || task.attempt != attempt
        {
            return Err(StoreError::LeaseExpired(task_id));
        }
        Ok(task)
    }
}

fn settle(task: &mut TaskRecord, settlement: &TaskSettlement, now: DateTime<Utc>) {
    task.status = settlement.status;
    task.output = settlement.output.clone();
    task.error = settlement.error.clone();
    task.claimed_by = None;
    task.lease_expires_at = None;
    task.updated_at = now;
}

fn workflow_claimable(record: &WorkflowRecord, queue: &str, now: DateTime<Utc>) -> bool {
    record.queue == queue && record.status.is_claimable() && !record.has_live_claim(now)
}

fn task_claimable(task: &TaskRecord, queue: &str, now: DateTime<Utc>) -> bool {
    task.queue == queue && task.status == TaskStatus::Pending && task.visible_at <= now
}

/// In-memory implementation of WorkflowEventStore
///
/// All state sits behind one lock, so every operation is atomic and claims
/// are trivially exclusive. It follows the PostgreSQL implementation's
/// semantics and is what the engine tests run against.
///
/// # Example
///
/// ```
/// use ledgerflow_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowEventStore {
    inner: RwLock<Inner>,
    unavailable_calls: AtomicUsize,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of workflow executions
    pub fn workflow_count(&self) -> usize {
        self.inner.read().executions.len()
    }

    /// Get the number of pending tasks
    pub fn pending_task_count(&self) -> usize {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    pub fn wakeup_count(&self) -> usize {
        self.inner.read().wakeups.len()
    }

    /// All tasks belonging to a workflow, oldest first
    pub fn tasks_for(&self, workflow_id: Uuid) -> Vec<TaskRecord> {
        let mut tasks: Vec<_> = self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.workflow_id == Some(workflow_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        tasks
    }

    /// Children of an execution
    pub fn children_of(&self, parent_id: Uuid) -> Vec<WorkflowRecord> {
        let mut children: Vec<_> = self
            .inner
            .read()
            .executions
            .values()
            .filter(|row| row.record.parent_id == Some(parent_id))
            .map(|row| row.record.clone())
            .collect();
        children.sort_by_key(|r| (r.created_at, r.id));
        children
    }

    /// Make the next `calls` store operations fail with `Unavailable`
    pub fn fail_next(&self, calls: usize) {
        self.unavailable_calls.store(calls, Ordering::SeqCst);
    }

    /// Move a task's lease into the past (for testing expiry)
    pub fn expire_task_lease(&self, task_id: Uuid) {
        if let Some(task) = self.inner.write().tasks.get_mut(&task_id) {
            task.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    /// Move a workflow claim's lease into the past (for testing expiry)
    pub fn expire_workflow_lease(&self, workflow_id: Uuid) {
        if let Some(row) = self.inner.write().executions.get_mut(&workflow_id) {
            row.record.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        let injected = self
            .unavailable_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<CreateOutcome, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();

        if let Some(key) = &workflow.idempotency_key {
            if let Some(existing) = inner.execution_keys.get(&(workflow.parent_id, key.clone())) {
                return Ok(CreateOutcome::Existing(*existing));
            }
        }
        if inner.executions.contains_key(&workflow.id) {
            return Ok(CreateOutcome::Existing(workflow.id));
        }

        let id = workflow.id;
        inner.insert_execution(workflow, Utc::now());
        Ok(CreateOutcome::Created(id))
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        Ok(inner.execution(workflow_id)?.record.clone())
    }

    async fn commit(&self, batch: CommitBatch) -> Result<i64, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut inner = self.inner.write();

        // Validate everything before touching anything
        let row = inner.execution(batch.workflow_id)?;
        if row.record.last_sequence != batch.expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: batch.expected_sequence,
                actual: row.record.last_sequence,
            });
        }
        if let Some(worker_id) = &batch.claimed_by {
            if !row.record.is_claimed_by(worker_id) {
                return Err(StoreError::LeaseExpired(batch.workflow_id));
            }
        }
        for workflow in &batch.new_workflows {
            if let Some(key) = &workflow.idempotency_key {
                if inner
                    .execution_keys
                    .contains_key(&(workflow.parent_id, key.clone()))
                {
                    return Err(StoreError::DuplicateKey(key.clone()));
                }
            }
        }
        for promise in &batch.promise_keys {
            if inner.promise_keys.contains_key(&promise.key) {
                return Err(StoreError::DuplicateKey(promise.key.clone()));
            }
        }
        if let Some(settlement) = &batch.settle_task {
            inner.claimed_task(settlement.task_id, &settlement.worker_id, settlement.attempt)?;
        }

        // Append
        let row = inner
            .executions
            .get_mut(&batch.workflow_id)
            .ok_or(StoreError::WorkflowNotFound(batch.workflow_id))?;
        let mut sequence = row.record.last_sequence;
        for event in batch.events {
            sequence += 1;
            row.events.push(EventEnvelope {
                workflow_id: batch.workflow_id,
                sequence,
                event,
                recorded_at: now,
            });
        }
        row.record.last_sequence = sequence;
        row.record.updated_at = now;

        let mut terminal = false;
        if let Some(status) = batch.status {
            if status.is_claimable() && !row.record.status.is_claimable() {
                row.record.ready_at = now;
            }
            if status.is_terminal() && !row.record.status.is_terminal() {
                terminal = true;
                row.record.parent_notify_pending = row.record.parent_id.is_some();
            }
            row.record.status = status;
        }
        if batch.release_claim || terminal {
            row.record.claimed_by = None;
            row.record.lease_expires_at = None;
        }

        for workflow in batch.new_workflows {
            inner.insert_execution(workflow, now);
        }
        for task in batch.new_tasks {
            inner.insert_task(task, now);
        }
        for task_id in batch.cancel_tasks {
            if let Some(task) = inner.tasks.get_mut(&task_id) {
                match task.status {
                    TaskStatus::Pending => {
                        task.status = TaskStatus::Cancelled;
                        task.updated_at = now;
                    }
                    TaskStatus::Running => {
                        task.cancel_requested = true;
                        task.updated_at = now;
                    }
                    _ => {}
                }
            }
        }
        if let Some(settlement) = batch.settle_task {
            if let Some(task) = inner.tasks.get_mut(&settlement.task_id) {
                settle(task, &settlement, now);
            }
        }
        for promise in batch.promise_keys {
            inner.promise_keys.insert(promise.key.clone(), promise);
        }
        for key in batch.cleared_wakeups {
            inner.wakeups.remove(&key);
        }
        for wakeup in batch.wakeups {
            inner.wakeups.insert(wakeup.key, wakeup.due_at);
        }
        if terminal {
            inner
                .wakeups
                .retain(|key, _| key.workflow_id != batch.workflow_id);
        }

        Ok(sequence)
    }

    async fn read_events(
        &self,
        workflow_id: Uuid,
        from_sequence: i64,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        Ok(inner
            .execution(workflow_id)?
            .events
            .iter()
            .filter(|e| e.sequence >= from_sequence)
            .cloned()
            .collect())
    }

    async fn find_child(&self, parent_id: Uuid, key: &str) -> Result<Option<Uuid>, StoreError> {
        self.check_available()?;
        Ok(self
            .inner
            .read()
            .execution_keys
            .get(&(Some(parent_id), key.to_string()))
            .copied())
    }

    async fn find_promise(&self, key: &str) -> Result<Option<PromiseKey>, StoreError> {
        self.check_available()?;
        Ok(self.inner.read().promise_keys.get(key).cloned())
    }

    async fn claim_workflow(
        &self,
        worker_id: &str,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<WorkflowClaim>, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut inner = self.inner.write();

        let Some(row) = inner
            .executions
            .values_mut()
            .filter(|row| workflow_claimable(&row.record, queue, now))
            .min_by_key(|row| (row.record.ready_at, row.record.id))
        else {
            return Ok(None);
        };

        let lease_expires_at = lease_deadline(now, lease);
        row.record.claimed_by = Some(worker_id.to_string());
        row.record.lease_expires_at = Some(lease_expires_at);
        row.record.updated_at = now;

        Ok(Some(WorkflowClaim {
            workflow: row.record.clone(),
            worker_id: worker_id.to_string(),
            lease_expires_at,
        }))
    }

    async fn heartbeat_workflow(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatResponse, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut inner = self.inner.write();
        let row = inner
            .executions
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        if !row.record.is_claimed_by(worker_id) {
            return Ok(HeartbeatResponse::rejected());
        }
        row.record.lease_expires_at = Some(lease_deadline(now, lease));
        Ok(HeartbeatResponse {
            accepted: true,
            should_cancel: !row.record.status.is_claimable(),
        })
    }

    async fn release_workflow(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        if let Some(row) = inner.executions.get_mut(&workflow_id) {
            if row.record.is_claimed_by(worker_id) {
                row.record.claimed_by = None;
                row.record.lease_expires_at = None;
                row.record.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn enqueue_task(&self, task: NewTask) -> Result<CreateOutcome, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        if task.workflow_id.is_none() {
            if let Some(existing) = task
                .idempotency_key
                .as_ref()
                .and_then(|key| inner.task_keys.get(key))
            {
                return Ok(CreateOutcome::Existing(*existing));
            }
        }
        let id = task.id;
        inner.insert_task(task, Utc::now());
        Ok(CreateOutcome::Created(id))
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
        self.check_available()?;
        self.inner
            .read()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn find_task_by_key(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        self.check_available()?;
        Ok(self.inner.read().task_keys.get(key).copied())
    }

    async fn claim_task(
        &self,
        worker_id: &str,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<TaskClaim>, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut inner = self.inner.write();

        let Some(task) = inner
            .tasks
            .values_mut()
            .filter(|t| task_claimable(t, queue, now))
            .min_by_key(|t| (t.visible_at, t.created_at, t.id))
        else {
            return Ok(None);
        };

        let lease_expires_at = lease_deadline(now, lease);
        task.status = TaskStatus::Running;
        task.attempt += 1;
        task.claimed_by = Some(worker_id.to_string());
        task.lease_expires_at = Some(lease_expires_at);
        task.updated_at = now;

        Ok(Some(TaskClaim {
            task: task.clone(),
            worker_id: worker_id.to_string(),
            lease_expires_at,
        }))
    }

    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatResponse, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Running || task.claimed_by.as_deref() != Some(worker_id) {
            return Ok(HeartbeatResponse::rejected());
        }
        task.lease_expires_at = Some(lease_deadline(now, lease));
        task.updated_at = now;
        Ok(HeartbeatResponse {
            accepted: true,
            should_cancel: task.cancel_requested,
        })
    }

    async fn settle_task(&self, settlement: TaskSettlement) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let task =
            inner.claimed_task(settlement.task_id, &settlement.worker_id, settlement.attempt)?;
        settle(task, &settlement, Utc::now());
        Ok(())
    }

    async fn retry_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        visible_at: DateTime<Utc>,
        error: &TaskError,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let task = inner.claimed_task(task_id, worker_id, attempt)?;
        task.status = if task.cancel_requested {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Pending
        };
        task.claimed_by = None;
        task.lease_expires_at = None;
        task.visible_at = visible_at;
        task.error = Some(error.clone());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn expired_task_claims(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut expired: Vec<_> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running && t.lease_expires_at.is_some_and(|at| at < now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|t| (t.lease_expires_at, t.id));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn requeue_task(&self, task_id: Uuid, attempt: u32) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        if task.status != TaskStatus::Running
            || task.attempt != attempt
            || !task.has_attempts_remaining()
        {
            return Ok(false);
        }
        task.status = TaskStatus::Pending;
        task.claimed_by = None;
        task.lease_expires_at = None;
        task.visible_at = now;
        task.updated_at = now;
        Ok(true)
    }

    async fn list_claimable(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let inner = self.inner.read();

        let workflows = inner
            .executions
            .values()
            .filter(|row| workflow_claimable(&row.record, queue, now))
            .map(|row| ClaimCandidate {
                work: WorkKind::Workflow,
                id: row.record.id,
                kind: row.record.kind.clone(),
                ready_at: row.record.ready_at,
            });
        let tasks = inner
            .tasks
            .values()
            .filter(|t| task_claimable(t, queue, now))
            .map(|t| ClaimCandidate {
                work: WorkKind::Task,
                id: t.id,
                kind: t.kind.clone(),
                ready_at: t.visible_at,
            });

        let mut candidates: Vec<_> = workflows.chain(tasks).collect();
        candidates.sort_by_key(|c| (c.ready_at, c.id));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn due_wakeups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Wakeup>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut due: Vec<_> = inner
            .wakeups
            .iter()
            .filter(|(_, due_at)| **due_at <= now)
            .map(|(key, due_at)| Wakeup {
                key: key.clone(),
                due_at: *due_at,
            })
            .collect();
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.key.cmp(&b.key)));
        due.truncate(limit);
        Ok(due)
    }

    async fn cancelling_workflows(&self, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut ids: Vec<_> = inner
            .executions
            .values()
            .filter(|row| row.record.status == WorkflowStatus::Cancelling)
            .map(|row| (row.record.updated_at, row.record.id))
            .collect();
        ids.sort();
        Ok(ids.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn pending_parent_notifications(
        &self,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut pending: Vec<_> = inner
            .executions
            .values()
            .filter(|row| row.record.parent_notify_pending)
            .map(|row| row.record.clone())
            .collect();
        pending.sort_by_key(|r| (r.updated_at, r.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_parent_notified(&self, child_id: Uuid) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        if let Some(row) = inner.executions.get_mut(&child_id) {
            row.record.parent_notify_pending = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    async fn started(store: &InMemoryWorkflowEventStore) -> Uuid {
        store
            .create_workflow(NewWorkflow::new("order", json!({"id": 1})))
            .await
            .unwrap()
            .id()
    }

    fn resumed() -> WorkflowEvent {
        WorkflowEvent::WorkflowResumed {
            worker_id: "w1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_writes_started_event() {
        let store = InMemoryWorkflowEventStore::new();
        let id = started(&store).await;

        let events = store.read_events(id, 1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(events[0].event.event_type(), "workflow_started");

        let record = store.get_workflow(id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Pending);
        assert_eq!(record.last_sequence, 1);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_by_key() {
        let store = InMemoryWorkflowEventStore::new();
        let first = store
            .create_workflow(NewWorkflow::new("order", json!({})).with_idempotency_key("o-1"))
            .await
            .unwrap();
        let second = store
            .create_workflow(NewWorkflow::new("order", json!({})).with_idempotency_key("o-1"))
            .await
            .unwrap();

        assert!(matches!(first, CreateOutcome::Created(_)));
        assert_eq!(second, CreateOutcome::Existing(first.id()));
        assert_eq!(store.workflow_count(), 1);
    }

    #[tokio::test]
    async fn test_append_conflict() {
        let store = InMemoryWorkflowEventStore::new();
        let id = started(&store).await;

        let seq = store.append_events(id, 1, vec![resumed()]).await.unwrap();
        assert_eq!(seq, 2);

        let err = store
            .append_events(id, 1, vec![resumed()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                expected: 1,
                actual: 2
            }
        ));
        assert_eq!(store.read_events(id, 1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_from_sequence() {
        let store = InMemoryWorkflowEventStore::new();
        let id = started(&store).await;
        store
            .append_events(id, 1, vec![resumed(), resumed()])
            .await
            .unwrap();

        let tail = store.read_events(id, 2).await.unwrap();
        assert_eq!(
            tail.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(store.read_events(id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_key_rejects_whole_batch() {
        let store = InMemoryWorkflowEventStore::new();
        let parent = started(&store).await;

        let child = NewWorkflow::new("ship", json!({}))
            .with_parent(parent)
            .with_idempotency_key("ship-1");
        let mut batch = CommitBatch::new(parent, 1, vec![resumed()]);
        batch.new_workflows.push(child.clone());
        store.commit(batch).await.unwrap();

        let mut again = CommitBatch::new(parent, 2, vec![resumed()]);
        again.new_workflows.push(NewWorkflow {
            id: Uuid::now_v7(),
            ..child
        });
        let err = store.commit(again).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(k) if k == "ship-1"));
        assert_eq!(store.get_workflow(parent).await.unwrap().last_sequence, 2);
        assert_eq!(store.children_of(parent).len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_lease_expires() {
        let store = InMemoryWorkflowEventStore::new();
        let id = started(&store).await;

        let claim = store.claim_workflow("w1", "default", LEASE).await.unwrap();
        assert_eq!(claim.unwrap().workflow.id, id);
        assert!(store
            .claim_workflow("w2", "default", LEASE)
            .await
            .unwrap()
            .is_none());

        store.expire_workflow_lease(id);
        let reclaimed = store.claim_workflow("w2", "default", LEASE).await.unwrap();
        assert_eq!(reclaimed.unwrap().worker_id, "w2");

        // The old holder can no longer commit
        let mut batch = CommitBatch::new(id, 1, vec![resumed()]);
        batch.claimed_by = Some("w1".to_string());
        assert!(matches!(
            store.commit(batch).await.unwrap_err(),
            StoreError::LeaseExpired(_)
        ));
    }

    #[tokio::test]
    async fn test_claim_oldest_first() {
        let store = InMemoryWorkflowEventStore::new();
        let first = started(&store).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let _second = started(&store).await;

        let claim = store
            .claim_workflow("w1", "default", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.workflow.id, first);
    }

    #[tokio::test]
    async fn test_task_claim_and_settle() {
        let store = InMemoryWorkflowEventStore::new();
        let task_id = Uuid::now_v7();
        store
            .enqueue_task(NewTask {
                id: task_id,
                workflow_id: None,
                kind: "email".to_string(),
                queue: "default".to_string(),
                input: json!({}),
                idempotency_key: Some("mail-1".to_string()),
                max_retries: 2,
            })
            .await
            .unwrap();

        let claim = store
            .claim_task("w1", "default", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.task.attempt, 1);
        assert_eq!(claim.task.status, TaskStatus::Running);

        let wrong_attempt = TaskSettlement {
            task_id,
            worker_id: "w1".to_string(),
            attempt: 2,
            status: TaskStatus::Completed,
            output: Some(json!("ok")),
            error: None,
        };
        assert!(store.settle_task(wrong_attempt.clone()).await.is_err());

        store
            .settle_task(TaskSettlement {
                attempt: 1,
                ..wrong_attempt
            })
            .await
            .unwrap();
        let task = store.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_cancel_tasks_in_batch() {
        let store = InMemoryWorkflowEventStore::new();
        let id = started(&store).await;
        let pending = Uuid::now_v7();
        let running = Uuid::now_v7();

        let mut batch = CommitBatch::new(id, 1, vec![resumed()]);
        for (task_id, kind) in [(running, "a"), (pending, "b")] {
            batch.new_tasks.push(NewTask {
                id: task_id,
                workflow_id: Some(id),
                kind: kind.to_string(),
                queue: "default".to_string(),
                input: json!({}),
                idempotency_key: None,
                max_retries: 0,
            });
        }
        store.commit(batch).await.unwrap();
        store.claim_task("w1", "default", LEASE).await.unwrap();

        let mut cancel = CommitBatch::new(id, 2, vec![]);
        cancel.cancel_tasks = vec![pending, running];
        store.commit(cancel).await.unwrap();

        let tasks = store.tasks_for(id);
        let claimed = tasks.iter().find(|t| t.attempt == 1).unwrap();
        let unclaimed = tasks.iter().find(|t| t.attempt == 0).unwrap();
        assert_eq!(claimed.status, TaskStatus::Running);
        assert!(claimed.cancel_requested);
        assert_eq!(unclaimed.status, TaskStatus::Cancelled);

        let heartbeat = store
            .heartbeat_task(claimed.id, "w1", LEASE)
            .await
            .unwrap();
        assert!(heartbeat.accepted);
        assert!(heartbeat.should_cancel);
    }

    #[tokio::test]
    async fn test_terminal_commit_clears_wakeups_and_flags_parent() {
        let store = InMemoryWorkflowEventStore::new();
        let parent = started(&store).await;
        let child = store
            .create_workflow(NewWorkflow::new("ship", json!({})).with_parent(parent))
            .await
            .unwrap()
            .id();

        let mut batch = CommitBatch::new(child, 1, vec![resumed()]);
        batch.wakeups.push(Wakeup {
            key: WakeupKey {
                workflow_id: child,
                kind: WakeupKind::Timer,
                target: "t".to_string(),
            },
            due_at: Utc::now(),
        });
        store.commit(batch).await.unwrap();
        assert_eq!(store.wakeup_count(), 1);

        let mut done = CommitBatch::new(
            child,
            2,
            vec![WorkflowEvent::WorkflowCompleted { result: json!(1) }],
        );
        done.status = Some(WorkflowStatus::Completed);
        store.commit(done).await.unwrap();

        assert_eq!(store.wakeup_count(), 0);
        let pending = store.pending_parent_notifications(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, child);

        store.mark_parent_notified(child).await.unwrap();
        assert!(store
            .pending_parent_notifications(10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_expired_task_requeue_checks_attempt() {
        let store = InMemoryWorkflowEventStore::new();
        let task_id = Uuid::now_v7();
        store
            .enqueue_task(NewTask {
                id: task_id,
                workflow_id: None,
                kind: "k".to_string(),
                queue: "default".to_string(),
                input: json!(null),
                idempotency_key: None,
                max_retries: 3,
            })
            .await
            .unwrap();
        store.claim_task("w1", "default", LEASE).await.unwrap();
        store.expire_task_lease(task_id);

        let expired = store.expired_task_claims(Utc::now(), 10).await.unwrap();
        assert_eq!(expired.len(), 1);

        assert!(!store.requeue_task(task_id, 2).await.unwrap());
        assert!(store.requeue_task(task_id, 1).await.unwrap());
        assert_eq!(store.pending_task_count(), 1);
    }

    #[tokio::test]
    async fn test_requeue_refused_on_final_attempt() {
        let store = InMemoryWorkflowEventStore::new();
        let task_id = Uuid::now_v7();
        store
            .enqueue_task(NewTask {
                id: task_id,
                workflow_id: None,
                kind: "k".to_string(),
                queue: "default".to_string(),
                input: json!(null),
                idempotency_key: None,
                max_retries: 0,
            })
            .await
            .unwrap();
        let claim = store.claim_task("w1", "default", LEASE).await.unwrap().unwrap();
        assert_eq!(claim.task.attempt, 1);

        assert!(!store.requeue_task(task_id, 1).await.unwrap());
        assert_eq!(store.pending_task_count(), 0);
        assert!(store.claim_task("w2", "default", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_unavailability() {
        let store = InMemoryWorkflowEventStore::new();
        store.fail_next(2);
        assert!(store
            .get_workflow(Uuid::now_v7())
            .await
            .unwrap_err()
            .is_transient());
        assert!(store
            .get_workflow(Uuid::now_v7())
            .await
            .unwrap_err()
            .is_transient());
        assert!(matches!(
            store.get_workflow(Uuid::now_v7()).await.unwrap_err(),
            StoreError::WorkflowNotFound(_)
        ));
    }
}
