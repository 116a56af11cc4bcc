//! WorkflowEventStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskError;
use crate::workflow::{EventEnvelope, TaskStatus, WorkflowEvent, WorkflowStatus};

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    /// The caller no longer holds the claim it is acting under
    #[error("claim lease expired or held by another worker: {0}")]
    LeaseExpired(Uuid),

    /// A unique idempotency key was already taken by a concurrent writer
    #[error("duplicate idempotency key: {0}")]
    DuplicateKey(String),

    /// Transient failure (connection loss, pool exhaustion)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Summary row of a workflow execution, maintained alongside its log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub kind: String,
    pub version: u32,
    pub queue: String,
    pub status: WorkflowStatus,
    pub parent_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
    pub input: serde_json::Value,
    pub last_sequence: i64,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub ready_at: DateTime<Utc>,
    pub parent_notify_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Whether some worker holds an unexpired claim
    pub fn has_live_claim(&self, now: DateTime<Utc>) -> bool {
        self.claimed_by.is_some() && self.lease_expires_at.is_some_and(|at| at > now)
    }

    /// Whether the claim column names this worker
    ///
    /// A lapsed lease stays with its holder until another worker claims the
    /// row, so the holder may still commit or heartbeat until then.
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.claimed_by.as_deref() == Some(worker_id)
    }
}

/// A workflow execution to create
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub id: Uuid,
    pub kind: String,
    pub version: u32,
    pub queue: String,
    pub input: serde_json::Value,
    pub parent_id: Option<Uuid>,
    /// Unique per parent (or globally, for top-level executions)
    pub idempotency_key: Option<String>,
}

impl NewWorkflow {
    pub fn new(kind: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind: kind.into(),
            version: 1,
            queue: "default".to_string(),
            input,
            parent_id: None,
            idempotency_key: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// The event that opens this execution's log
    pub fn started_event(&self) -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            kind: self.kind.clone(),
            version: self.version,
            queue: self.queue.clone(),
            input: self.input.clone(),
            parent_id: self.parent_id,
        }
    }
}

/// Outcome of an idempotent create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Uuid),
    /// An execution already existed under the same idempotency key
    Existing(Uuid),
}

impl CreateOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Created(id) | Self::Existing(id) => *id,
        }
    }
}

/// A task row to enqueue
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub kind: String,
    pub queue: String,
    pub input: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub max_retries: u32,
}

/// Task queue row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub kind: String,
    pub queue: String,
    pub input: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub status: TaskStatus,
    /// Executions started so far (1-based once claimed)
    pub attempt: u32,
    pub max_retries: u32,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub visible_at: DateTime<Utc>,
    pub cancel_requested: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// First execution plus the allowed retries
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts()
    }
}

/// Claim of a workflow execution
#[derive(Debug, Clone)]
pub struct WorkflowClaim {
    pub workflow: WorkflowRecord,
    pub worker_id: String,
    pub lease_expires_at: DateTime<Utc>,
}

/// Claim of a task
#[derive(Debug, Clone)]
pub struct TaskClaim {
    /// The task row after the claim (attempt already incremented)
    pub task: TaskRecord,
    pub worker_id: String,
    pub lease_expires_at: DateTime<Utc>,
}

/// Response from heartbeat operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// Whether the heartbeat was accepted (the claim is still held)
    pub accepted: bool,

    /// Whether cancellation was requested
    pub should_cancel: bool,
}

impl HeartbeatResponse {
    pub fn rejected() -> Self {
        Self {
            accepted: false,
            should_cancel: true,
        }
    }
}

/// Final state written to a claimed task row
#[derive(Debug, Clone)]
pub struct TaskSettlement {
    pub task_id: Uuid,
    pub worker_id: String,
    pub attempt: u32,
    pub status: TaskStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<TaskError>,
}

/// What a due wakeup refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeupKind {
    Timer,
    PromiseTimeout,
    ChildTimeout,
    CancellationDeadline,
}

impl WakeupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::PromiseTimeout => "promise_timeout",
            Self::ChildTimeout => "child_timeout",
            Self::CancellationDeadline => "cancellation_deadline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timer" => Some(Self::Timer),
            "promise_timeout" => Some(Self::PromiseTimeout),
            "child_timeout" => Some(Self::ChildTimeout),
            "cancellation_deadline" => Some(Self::CancellationDeadline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WakeupKey {
    pub workflow_id: Uuid,
    pub kind: WakeupKind,
    /// Timer id, promise id, child id or empty for deadlines
    pub target: String,
}

/// Index entry for time-based work
#[derive(Debug, Clone, PartialEq)]
pub struct Wakeup {
    pub key: WakeupKey,
    pub due_at: DateTime<Utc>,
}

/// Global promise idempotency key entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromiseKey {
    pub key: String,
    pub workflow_id: Uuid,
    pub promise_id: String,
}

/// Work class of a claim candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Workflow,
    Task,
}

/// Something a worker polling a queue could claim right now
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimCandidate {
    pub work: WorkKind,
    pub id: Uuid,
    pub kind: String,
    pub ready_at: DateTime<Utc>,
}

/// Everything one atomic append writes
///
/// The event append is sequence-checked; every other change in the batch
/// commits only if the append does.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub workflow_id: Uuid,
    pub expected_sequence: i64,
    pub events: Vec<WorkflowEvent>,

    /// New projected status for the summary row
    pub status: Option<WorkflowStatus>,

    /// Require the workflow claim to be held by this worker
    pub claimed_by: Option<String>,
    pub release_claim: bool,

    pub new_workflows: Vec<NewWorkflow>,
    pub new_tasks: Vec<NewTask>,
    /// Pending rows are cancelled; running rows get `cancel_requested`
    pub cancel_tasks: Vec<Uuid>,
    pub settle_task: Option<TaskSettlement>,

    pub promise_keys: Vec<PromiseKey>,
    pub wakeups: Vec<Wakeup>,
    pub cleared_wakeups: Vec<WakeupKey>,
}

impl CommitBatch {
    pub fn new(workflow_id: Uuid, expected_sequence: i64, events: Vec<WorkflowEvent>) -> Self {
        Self {
            workflow_id,
            expected_sequence,
            events,
            ..Default::default()
        }
    }
}

/// Store for workflow logs, execution rows, the task queue and indexes
///
/// Implementations must make [`commit`](Self::commit) all-or-nothing and
/// serialize claims so that one row is never handed to two workers.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Executions and event log
    // =========================================================================

    /// Create an execution with its `WorkflowStarted` event at sequence 1
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<CreateOutcome, StoreError>;

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError>;

    /// Atomically apply a batch
    ///
    /// Returns the new last sequence number, or `ConcurrencyConflict` when
    /// `expected_sequence` is stale.
    async fn commit(&self, batch: CommitBatch) -> Result<i64, StoreError>;

    /// Append events with an optimistic sequence check
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError> {
        self.commit(CommitBatch::new(workflow_id, expected_sequence, events))
            .await
    }

    /// Events with `sequence >= from_sequence`, in order
    async fn read_events(
        &self,
        workflow_id: Uuid,
        from_sequence: i64,
    ) -> Result<Vec<EventEnvelope>, StoreError>;

    async fn find_child(&self, parent_id: Uuid, key: &str) -> Result<Option<Uuid>, StoreError>;

    async fn find_promise(&self, key: &str) -> Result<Option<PromiseKey>, StoreError>;

    // =========================================================================
    // Workflow claims
    // =========================================================================

    /// Claim the oldest claimable execution on a queue, skipping locked rows
    async fn claim_workflow(
        &self,
        worker_id: &str,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<WorkflowClaim>, StoreError>;

    async fn heartbeat_workflow(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatResponse, StoreError>;

    async fn release_workflow(&self, workflow_id: Uuid, worker_id: &str)
        -> Result<(), StoreError>;

    // =========================================================================
    // Task queue
    // =========================================================================

    /// Enqueue a standalone task, deduplicated by idempotency key
    async fn enqueue_task(&self, task: NewTask) -> Result<CreateOutcome, StoreError>;

    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError>;

    /// Standalone task registered under an idempotency key
    async fn find_task_by_key(&self, key: &str) -> Result<Option<Uuid>, StoreError>;

    /// Claim the oldest visible pending task on a queue, skipping locked rows
    async fn claim_task(
        &self,
        worker_id: &str,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<TaskClaim>, StoreError>;

    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatResponse, StoreError>;

    /// Settle a claimed task without touching any workflow log
    async fn settle_task(&self, settlement: TaskSettlement) -> Result<(), StoreError>;

    /// Put a claimed task back in the queue after a failed attempt
    async fn retry_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        visible_at: DateTime<Utc>,
        error: &TaskError,
    ) -> Result<(), StoreError>;

    /// Running tasks whose lease ran out
    async fn expired_task_claims(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Return a claim to the queue if it is still at `attempt` and has
    /// attempts left
    async fn requeue_task(&self, task_id: Uuid, attempt: u32) -> Result<bool, StoreError>;

    async fn list_claimable(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>, StoreError>;

    // =========================================================================
    // Maintenance
    // =========================================================================

    async fn due_wakeups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Wakeup>, StoreError>;

    async fn cancelling_workflows(&self, limit: usize) -> Result<Vec<Uuid>, StoreError>;

    /// Terminal children whose parent has not been told yet
    async fn pending_parent_notifications(
        &self,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, StoreError>;

    async fn mark_parent_notified(&self, child_id: Uuid) -> Result<(), StoreError>;
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(30))
}
