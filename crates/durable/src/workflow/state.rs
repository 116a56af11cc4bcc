//! Execution state projected from the event log
//!
//! [`project`] is a pure fold over an ordered event sequence. Applying the
//! same events one at a time through [`ExecutionState::apply`] yields an
//! identical state; the engine relies on that for dispatch decisions and
//! the worker-side replay relies on it to rebuild local state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{
    ChildStatus, CommandKind, CommandOrigin, CommandSignature, EventEnvelope, PromiseStatus,
    TaskStatus, TimerStatus, WorkflowError, WorkflowEvent, WorkflowStatus,
};
use crate::task::TaskError;

/// Task as seen from its owning workflow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEntry {
    pub task_id: Uuid,
    pub kind: String,
    pub queue: String,
    pub input: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub max_retries: u32,
    pub status: TaskStatus,
    pub attempt: u32,
    pub output: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub settled_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerEntry {
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
    pub status: TimerStatus,
    pub settled_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromiseEntry {
    pub promise_id: String,
    pub idempotency_key: Option<String>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub status: PromiseStatus,
    pub value: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub settled_at: Option<i64>,
}

/// Parent-side link to a child execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildEntry {
    pub child_id: Uuid,
    pub kind: String,
    pub idempotency_key: String,
    pub origin: CommandOrigin,
    pub timeout_at: Option<DateTime<Utc>>,
    pub status: ChildStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub settled_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationInfo {
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Identity assigned to a recorded command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RecordedTarget {
    Task(Uuid),
    Timer(String),
    Promise(String),
    Child { child_id: Uuid, idempotency_key: String },
    State(String),
}

/// A workflow-issued command as recorded in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedCommand {
    /// Position among the workflow's recorded commands (0-based)
    pub position: usize,
    /// Sequence of the event that recorded it
    pub sequence: i64,
    pub signature: CommandSignature,
    pub target: RecordedTarget,
}

/// Current state of a workflow execution
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ExecutionState {
    pub workflow_id: Option<Uuid>,
    pub kind: String,
    pub version: u32,
    pub queue: String,
    pub input: serde_json::Value,
    pub parent_id: Option<Uuid>,
    pub status: WorkflowStatus,
    pub last_sequence: i64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub resumptions: u32,
    pub tasks: BTreeMap<Uuid, TaskEntry>,
    pub timers: BTreeMap<String, TimerEntry>,
    pub promises: BTreeMap<String, PromiseEntry>,
    pub children: BTreeMap<Uuid, ChildEntry>,
    pub values: BTreeMap<String, serde_json::Value>,
    pub commands: Vec<RecordedCommand>,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub cancellation: Option<CancellationInfo>,
}

/// Project an ordered event sequence into execution state
pub fn project(events: &[EventEnvelope]) -> ExecutionState {
    let mut state = ExecutionState::default();
    for envelope in events {
        state.apply(envelope);
    }
    state
}

impl ExecutionState {
    /// Fold one event into the state
    ///
    /// Total over any input: events that make no sense in the current state
    /// (stale settlements, unknown types) leave it unchanged apart from the
    /// sequence bookkeeping.
    pub fn apply(&mut self, envelope: &EventEnvelope) {
        self.last_sequence = self.last_sequence.max(envelope.sequence);
        self.last_event_at = Some(envelope.recorded_at);

        if self.status.is_terminal() {
            return;
        }

        let seq = envelope.sequence;
        match &envelope.event {
            WorkflowEvent::WorkflowStarted {
                kind,
                version,
                queue,
                input,
                parent_id,
            } => {
                if self.workflow_id.is_none() {
                    self.workflow_id = Some(envelope.workflow_id);
                    self.kind = kind.clone();
                    self.version = *version;
                    self.queue = queue.clone();
                    self.input = input.clone();
                    self.parent_id = *parent_id;
                    self.status = WorkflowStatus::Pending;
                }
            }
            WorkflowEvent::WorkflowResumed { .. } => {
                if self.status.is_claimable() {
                    self.status = WorkflowStatus::Running;
                    self.resumptions += 1;
                }
            }
            WorkflowEvent::WorkflowSuspended { .. } => {
                if self.status == WorkflowStatus::Running {
                    self.status = WorkflowStatus::Waiting;
                }
            }
            WorkflowEvent::CancellationRequested { reason, deadline } => {
                self.status = WorkflowStatus::Cancelling;
                if self.cancellation.is_none() {
                    self.cancellation = Some(CancellationInfo {
                        reason: reason.clone(),
                        requested_at: envelope.recorded_at,
                        deadline: *deadline,
                    });
                }
            }
            WorkflowEvent::WorkflowCompleted { result } => {
                self.status = WorkflowStatus::Completed;
                self.result = Some(result.clone());
            }
            WorkflowEvent::WorkflowFailed { error } => {
                self.status = WorkflowStatus::Failed;
                self.error = Some(error.clone());
            }
            WorkflowEvent::WorkflowCancelled { .. } => {
                self.status = WorkflowStatus::Cancelled;
            }

            WorkflowEvent::TaskScheduled {
                task_id,
                kind,
                queue,
                input,
                idempotency_key,
                max_retries,
            } => {
                if self.tasks.contains_key(task_id) {
                    return;
                }
                self.tasks.insert(
                    *task_id,
                    TaskEntry {
                        task_id: *task_id,
                        kind: kind.clone(),
                        queue: queue.clone(),
                        input: input.clone(),
                        idempotency_key: idempotency_key.clone(),
                        max_retries: *max_retries,
                        status: TaskStatus::Pending,
                        attempt: 0,
                        output: None,
                        error: None,
                        settled_at: None,
                    },
                );
                self.record(
                    seq,
                    CommandKind::ScheduleTask,
                    kind,
                    RecordedTarget::Task(*task_id),
                );
            }
            WorkflowEvent::TaskCompleted {
                task_id,
                output,
                attempt,
            } => {
                if let Some(task) = self.tasks.get_mut(task_id).filter(|t| !t.status.is_terminal())
                {
                    task.status = TaskStatus::Completed;
                    task.output = Some(output.clone());
                    task.attempt = *attempt;
                    task.settled_at = Some(seq);
                    self.wake();
                }
            }
            WorkflowEvent::TaskFailed {
                task_id,
                error,
                attempt,
            } => {
                if let Some(task) = self.tasks.get_mut(task_id).filter(|t| !t.status.is_terminal())
                {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error.clone());
                    task.attempt = *attempt;
                    task.settled_at = Some(seq);
                    self.wake();
                }
            }
            WorkflowEvent::TaskCancelled { task_id, .. } => {
                if let Some(task) = self.tasks.get_mut(task_id).filter(|t| !t.status.is_terminal())
                {
                    task.status = TaskStatus::Cancelled;
                    task.settled_at = Some(seq);
                    self.wake();
                }
            }

            WorkflowEvent::TimerStarted { timer_id, fire_at } => {
                if self.timers.contains_key(timer_id) {
                    return;
                }
                self.timers.insert(
                    timer_id.clone(),
                    TimerEntry {
                        timer_id: timer_id.clone(),
                        fire_at: *fire_at,
                        status: TimerStatus::Started,
                        settled_at: None,
                    },
                );
                self.record(
                    seq,
                    CommandKind::StartTimer,
                    timer_id,
                    RecordedTarget::Timer(timer_id.clone()),
                );
            }
            WorkflowEvent::TimerFired { timer_id } => {
                if let Some(timer) = self.timers.get_mut(timer_id).filter(|t| !t.status.is_terminal())
                {
                    timer.status = TimerStatus::Fired;
                    timer.settled_at = Some(seq);
                    self.wake();
                }
            }
            WorkflowEvent::TimerCancelled { timer_id, origin } => {
                if let Some(timer) = self.timers.get_mut(timer_id).filter(|t| !t.status.is_terminal())
                {
                    timer.status = TimerStatus::Cancelled;
                    timer.settled_at = Some(seq);
                    if *origin == CommandOrigin::Workflow {
                        self.record(
                            seq,
                            CommandKind::CancelTimer,
                            timer_id,
                            RecordedTarget::Timer(timer_id.clone()),
                        );
                    }
                    self.wake();
                }
            }

            WorkflowEvent::PromiseCreated {
                promise_id,
                idempotency_key,
                timeout_at,
            } => {
                if self.promises.contains_key(promise_id) {
                    return;
                }
                self.promises.insert(
                    promise_id.clone(),
                    PromiseEntry {
                        promise_id: promise_id.clone(),
                        idempotency_key: idempotency_key.clone(),
                        timeout_at: *timeout_at,
                        status: PromiseStatus::Created,
                        value: None,
                        error: None,
                        settled_at: None,
                    },
                );
                self.record(
                    seq,
                    CommandKind::CreatePromise,
                    promise_id,
                    RecordedTarget::Promise(promise_id.clone()),
                );
            }
            WorkflowEvent::PromiseResolved {
                promise_id,
                value,
                origin,
            } => {
                if let Some(promise) = self
                    .promises
                    .get_mut(promise_id)
                    .filter(|p| !p.status.is_terminal())
                {
                    promise.status = PromiseStatus::Resolved;
                    promise.value = Some(value.clone());
                    promise.settled_at = Some(seq);
                    if *origin == CommandOrigin::Workflow {
                        self.record(
                            seq,
                            CommandKind::ResolvePromise,
                            promise_id,
                            RecordedTarget::Promise(promise_id.clone()),
                        );
                    }
                    self.wake();
                }
            }
            WorkflowEvent::PromiseRejected {
                promise_id,
                error,
                origin,
            } => {
                if let Some(promise) = self
                    .promises
                    .get_mut(promise_id)
                    .filter(|p| !p.status.is_terminal())
                {
                    promise.status = PromiseStatus::Rejected;
                    promise.error = Some(error.clone());
                    promise.settled_at = Some(seq);
                    if *origin == CommandOrigin::Workflow {
                        self.record(
                            seq,
                            CommandKind::RejectPromise,
                            promise_id,
                            RecordedTarget::Promise(promise_id.clone()),
                        );
                    }
                    self.wake();
                }
            }
            WorkflowEvent::PromiseTimedOut { promise_id } => {
                if let Some(promise) = self
                    .promises
                    .get_mut(promise_id)
                    .filter(|p| !p.status.is_terminal())
                {
                    promise.status = PromiseStatus::TimedOut;
                    promise.settled_at = Some(seq);
                    self.wake();
                }
            }

            WorkflowEvent::ChildWorkflowStarted {
                child_id,
                kind,
                idempotency_key,
                origin,
                timeout_at,
                ..
            } => {
                if self.children.contains_key(child_id) {
                    return;
                }
                self.children.insert(
                    *child_id,
                    ChildEntry {
                        child_id: *child_id,
                        kind: kind.clone(),
                        idempotency_key: idempotency_key.clone(),
                        origin: *origin,
                        timeout_at: *timeout_at,
                        status: ChildStatus::Running,
                        result: None,
                        error: None,
                        settled_at: None,
                    },
                );
                if *origin == CommandOrigin::Workflow {
                    self.record(
                        seq,
                        CommandKind::ScheduleChildWorkflow,
                        kind,
                        RecordedTarget::Child {
                            child_id: *child_id,
                            idempotency_key: idempotency_key.clone(),
                        },
                    );
                }
            }
            WorkflowEvent::ChildWorkflowCompleted { child_id, result } => {
                if let Some(child) = self.open_child(child_id) {
                    child.status = ChildStatus::Completed;
                    child.result = Some(result.clone());
                    child.settled_at = Some(seq);
                    self.wake();
                }
            }
            WorkflowEvent::ChildWorkflowFailed { child_id, error } => {
                if let Some(child) = self.open_child(child_id) {
                    child.status = ChildStatus::Failed;
                    child.error = Some(error.clone());
                    child.settled_at = Some(seq);
                    self.wake();
                }
            }
            WorkflowEvent::ChildWorkflowCancelled { child_id, .. } => {
                if let Some(child) = self.open_child(child_id) {
                    child.status = ChildStatus::Cancelled;
                    child.settled_at = Some(seq);
                    self.wake();
                }
            }
            WorkflowEvent::ChildWorkflowTimedOut { child_id } => {
                if let Some(child) = self.open_child(child_id) {
                    child.status = ChildStatus::TimedOut;
                    child.settled_at = Some(seq);
                    self.wake();
                }
            }

            WorkflowEvent::StateSet { key, value } => {
                self.values.insert(key.clone(), value.clone());
                self.record(seq, CommandKind::SetState, key, RecordedTarget::State(key.clone()));
            }
            WorkflowEvent::StateCleared { key } => {
                self.values.remove(key);
                self.record(
                    seq,
                    CommandKind::ClearState,
                    key,
                    RecordedTarget::State(key.clone()),
                );
            }

            WorkflowEvent::Unknown => {}
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of non-terminal tasks, timers, promises and children
    pub fn outstanding(&self) -> usize {
        self.tasks.values().filter(|t| !t.status.is_terminal()).count()
            + self.timers.values().filter(|t| !t.status.is_terminal()).count()
            + self.promises.values().filter(|p| !p.status.is_terminal()).count()
            + self.open_children().count()
    }

    /// Children that have not reached a terminal state
    pub fn open_children(&self) -> impl Iterator<Item = &ChildEntry> {
        self.children.values().filter(|c| !c.status.is_terminal())
    }

    pub fn child_by_key(&self, key: &str) -> Option<&ChildEntry> {
        self.children.values().find(|c| c.idempotency_key == key)
    }

    /// Look up an owned promise by name, then by idempotency key
    pub fn promise_by_id_or_key(&self, id_or_key: &str) -> Option<&PromiseEntry> {
        self.promises.get(id_or_key).or_else(|| {
            self.promises
                .values()
                .find(|p| p.idempotency_key.as_deref() == Some(id_or_key))
        })
    }

    /// Count of children scheduled by workflow logic
    pub fn workflow_child_count(&self) -> usize {
        self.children
            .values()
            .filter(|c| c.origin == CommandOrigin::Workflow)
            .count()
    }

    fn open_child(&mut self, child_id: &Uuid) -> Option<&mut ChildEntry> {
        self.children
            .get_mut(child_id)
            .filter(|c| !c.status.is_terminal())
    }

    fn wake(&mut self) {
        if self.status == WorkflowStatus::Waiting {
            self.status = WorkflowStatus::Running;
        }
    }

    fn record(&mut self, sequence: i64, kind: CommandKind, name: &str, target: RecordedTarget) {
        self.commands.push(RecordedCommand {
            position: self.commands.len(),
            sequence,
            signature: CommandSignature::new(kind, name),
            target,
        });
    }
}
