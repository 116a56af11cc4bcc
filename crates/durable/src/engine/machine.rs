//! Composite workflow state machine
//!
//! Planning functions turn a request (a command batch, a task result, a due
//! timer, a cancellation) into the events and side tables one commit will
//! write. Planning is pure: it works on a scratch copy of the projected
//! state, so every event is validated against the state produced by the
//! events before it.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::persistence::{
    CommitBatch, NewTask, NewWorkflow, PromiseKey, TaskSettlement, Wakeup, WakeupKey, WakeupKind,
};
use crate::replay::Outcome;
use crate::task::TaskError;
use crate::workflow::{
    ChildStatus, CommandOrigin, EventEnvelope, ExecutionState, PromiseEntry, PromiseStatus,
    TaskStatus, WorkflowCommand, WorkflowError, WorkflowEvent, WorkflowStatus,
};

/// A request the current state does not allow
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct InvalidTransition(pub String);

impl InvalidTransition {
    fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Work triggered by a commit that belongs to another execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// Request cancellation of a child
    Cancel { workflow_id: Uuid, reason: String },
    /// Deliver a terminal child's outcome to its parent
    NotifyParent { child_id: Uuid },
    /// Try to move a cancelling execution to CANCELLED
    FinalizeCancellation { workflow_id: Uuid },
}

/// Everything one commit writes for a single execution
#[derive(Debug, Default)]
pub struct Transition {
    pub events: Vec<WorkflowEvent>,
    pub status: Option<WorkflowStatus>,
    pub claimed_by: Option<String>,
    pub release_claim: bool,
    pub new_workflows: Vec<NewWorkflow>,
    pub new_tasks: Vec<NewTask>,
    pub cancel_tasks: Vec<Uuid>,
    pub settle_task: Option<TaskSettlement>,
    pub promise_keys: Vec<PromiseKey>,
    pub wakeups: Vec<Wakeup>,
    pub cleared_wakeups: Vec<WakeupKey>,
    pub follow_ups: Vec<FollowUp>,
}

impl Transition {
    pub fn into_batch(self, workflow_id: Uuid, expected_sequence: i64) -> (CommitBatch, Vec<FollowUp>) {
        let batch = CommitBatch {
            workflow_id,
            expected_sequence,
            events: self.events,
            status: self.status,
            claimed_by: self.claimed_by,
            release_claim: self.release_claim,
            new_workflows: self.new_workflows,
            new_tasks: self.new_tasks,
            cancel_tasks: self.cancel_tasks,
            settle_task: self.settle_task,
            promise_keys: self.promise_keys,
            wakeups: self.wakeups,
            cleared_wakeups: self.cleared_wakeups,
        };
        (batch, self.follow_ups)
    }
}

/// Result of a task attempt as reported by a worker
#[derive(Debug, Clone)]
pub enum TaskResult {
    Completed(serde_json::Value),
    Failed(TaskError),
    /// The owning workflow asked for the task to stop
    Cancelled,
}

/// Accumulates a transition against a scratch projection
struct Planner {
    workflow_id: Uuid,
    initial_status: WorkflowStatus,
    state: ExecutionState,
    now: DateTime<Utc>,
    transition: Transition,
}

impl Planner {
    fn new(workflow_id: Uuid, state: &ExecutionState, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id,
            initial_status: state.status,
            state: state.clone(),
            now,
            transition: Transition::default(),
        }
    }

    fn push(&mut self, event: WorkflowEvent) {
        let envelope = EventEnvelope {
            workflow_id: self.workflow_id,
            sequence: self.state.last_sequence + 1,
            event,
            recorded_at: self.now,
        };
        self.state.apply(&envelope);
        self.transition.events.push(envelope.event);
    }

    fn wakeup(&mut self, kind: WakeupKind, target: impl Into<String>, due_at: DateTime<Utc>) {
        self.transition.wakeups.push(Wakeup {
            key: self.wakeup_key(kind, target),
            due_at,
        });
    }

    fn clear_wakeup(&mut self, kind: WakeupKind, target: impl Into<String>) {
        let key = self.wakeup_key(kind, target);
        self.transition.cleared_wakeups.push(key);
    }

    fn wakeup_key(&self, kind: WakeupKind, target: impl Into<String>) -> WakeupKey {
        WakeupKey {
            workflow_id: self.workflow_id,
            kind,
            target: target.into(),
        }
    }

    /// Cancel task rows and ask open children to cancel
    fn abandon_outstanding(&mut self, reason: &str) {
        let tasks: Vec<Uuid> = self
            .state
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.task_id)
            .filter(|id| !self.transition.cancel_tasks.contains(id))
            .collect();
        self.transition.cancel_tasks.extend(tasks);

        let children: Vec<Uuid> = self.state.open_children().map(|c| c.child_id).collect();
        for child_id in children {
            let already = self.transition.follow_ups.iter().any(
                |f| matches!(f, FollowUp::Cancel { workflow_id, .. } if *workflow_id == child_id),
            );
            if !already {
                self.transition.follow_ups.push(FollowUp::Cancel {
                    workflow_id: child_id,
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn finish(mut self) -> Transition {
        let status = self.state.status;
        if status.is_terminal() && !self.initial_status.is_terminal() {
            self.abandon_outstanding("parent workflow finished");
            if self.state.parent_id.is_some() {
                self.transition.follow_ups.push(FollowUp::NotifyParent {
                    child_id: self.workflow_id,
                });
            }
        }
        self.transition.status = Some(status);
        self.transition
    }
}

// =============================================================================
// Resumptions
// =============================================================================

/// Plan a claim holder's command batch
///
/// The batch opens with `WorkflowResumed` and ends either with the terminal
/// command's event or with `WorkflowSuspended`.
pub fn plan_resumption(
    state: &ExecutionState,
    workflow_id: Uuid,
    worker_id: &str,
    commands: Vec<WorkflowCommand>,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<Transition, InvalidTransition> {
    if !state.status.is_claimable() {
        return Err(InvalidTransition::new(format!(
            "cannot resume a {} workflow",
            state.status
        )));
    }
    if let Some(pos) = commands.iter().position(WorkflowCommand::is_terminal) {
        if pos + 1 != commands.len() {
            return Err(InvalidTransition::new(format!(
                "terminal command at position {pos} is not last"
            )));
        }
    }

    let mut planner = Planner::new(workflow_id, state, now);
    planner.push(WorkflowEvent::WorkflowResumed {
        worker_id: worker_id.to_string(),
    });

    let mut terminal = false;
    for command in commands {
        terminal |= command.is_terminal();
        apply_command(&mut planner, command, config)?;
    }

    if !terminal {
        let outstanding = planner.state.outstanding();
        if outstanding == 0 {
            return Err(InvalidTransition::new(
                "cannot suspend without outstanding work",
            ));
        }
        planner.push(WorkflowEvent::WorkflowSuspended { outstanding });
    }

    planner.transition.claimed_by = Some(worker_id.to_string());
    planner.transition.release_claim = true;
    Ok(planner.finish())
}

fn apply_command(
    planner: &mut Planner,
    command: WorkflowCommand,
    config: &EngineConfig,
) -> Result<(), InvalidTransition> {
    let workflow_id = planner.workflow_id;
    match command {
        WorkflowCommand::ScheduleTask {
            kind,
            queue,
            input,
            idempotency_key,
            max_retries,
        } => {
            let task = NewTask {
                id: Uuid::now_v7(),
                workflow_id: Some(workflow_id),
                kind,
                queue: queue.unwrap_or_else(|| planner.state.queue.clone()),
                input,
                idempotency_key,
                max_retries: max_retries.unwrap_or(config.default_max_retries),
            };
            planner.push(WorkflowEvent::TaskScheduled {
                task_id: task.id,
                kind: task.kind.clone(),
                queue: task.queue.clone(),
                input: task.input.clone(),
                idempotency_key: task.idempotency_key.clone(),
                max_retries: task.max_retries,
            });
            planner.transition.new_tasks.push(task);
        }

        WorkflowCommand::StartTimer { id, fire_at } => {
            if planner.state.timers.contains_key(&id) {
                return Err(InvalidTransition::new(format!("timer {id} already exists")));
            }
            planner.push(WorkflowEvent::TimerStarted {
                timer_id: id.clone(),
                fire_at,
            });
            planner.wakeup(WakeupKind::Timer, id, fire_at);
        }

        WorkflowCommand::CancelTimer { id } => {
            match planner.state.timers.get(&id) {
                None => return Err(InvalidTransition::new(format!("timer {id} was never started"))),
                Some(timer) if timer.status.is_terminal() => {
                    return Err(InvalidTransition::new(format!(
                        "timer {id} is already {:?}",
                        timer.status
                    )))
                }
                Some(_) => {}
            }
            planner.push(WorkflowEvent::TimerCancelled {
                timer_id: id.clone(),
                origin: CommandOrigin::Workflow,
            });
            planner.clear_wakeup(WakeupKind::Timer, id);
        }

        WorkflowCommand::CreatePromise {
            name,
            idempotency_key,
            timeout_at,
        } => {
            if planner.state.promises.contains_key(&name) {
                return Err(InvalidTransition::new(format!("promise {name} already exists")));
            }
            planner.push(WorkflowEvent::PromiseCreated {
                promise_id: name.clone(),
                idempotency_key: idempotency_key.clone(),
                timeout_at,
            });
            if let Some(key) = idempotency_key {
                planner.transition.promise_keys.push(PromiseKey {
                    key,
                    workflow_id,
                    promise_id: name.clone(),
                });
            }
            if let Some(due_at) = timeout_at {
                planner.wakeup(WakeupKind::PromiseTimeout, name, due_at);
            }
        }

        WorkflowCommand::ResolvePromise { id_or_key, value } => {
            let promise_id = owned_open_promise(&planner.state, &id_or_key)?;
            planner.push(WorkflowEvent::PromiseResolved {
                promise_id: promise_id.clone(),
                value,
                origin: CommandOrigin::Workflow,
            });
            planner.clear_wakeup(WakeupKind::PromiseTimeout, promise_id);
        }

        WorkflowCommand::RejectPromise { id_or_key, error } => {
            let promise_id = owned_open_promise(&planner.state, &id_or_key)?;
            planner.push(WorkflowEvent::PromiseRejected {
                promise_id: promise_id.clone(),
                error,
                origin: CommandOrigin::Workflow,
            });
            planner.clear_wakeup(WakeupKind::PromiseTimeout, promise_id);
        }

        WorkflowCommand::ScheduleChildWorkflow {
            kind,
            input,
            idempotency_key,
            queue,
            timeout_at,
        } => {
            // Implicit keys follow the command ordinal so retried batches
            // always produce the same key
            let key = idempotency_key
                .unwrap_or_else(|| format!("child-{}", planner.state.workflow_child_count()));
            if planner.state.child_by_key(&key).is_some() {
                return Err(InvalidTransition::new(format!(
                    "child key {key} is already in use"
                )));
            }
            let queue = queue.unwrap_or_else(|| planner.state.queue.clone());
            add_child(planner, kind, input, key, queue, timeout_at, CommandOrigin::Workflow);
        }

        WorkflowCommand::SetState { key, value } => {
            planner.push(WorkflowEvent::StateSet { key, value });
        }

        WorkflowCommand::ClearState { key } => {
            planner.push(WorkflowEvent::StateCleared { key });
        }

        WorkflowCommand::Complete { result } => {
            let outstanding = planner.state.outstanding();
            if outstanding > 0 {
                return Err(InvalidTransition::new(format!(
                    "cannot complete with {outstanding} outstanding items"
                )));
            }
            planner.push(WorkflowEvent::WorkflowCompleted { result });
        }

        WorkflowCommand::Fail { error } => {
            planner.push(WorkflowEvent::WorkflowFailed { error });
        }

        WorkflowCommand::RequestCancellation { reason } => {
            // The submitting worker gives up its claim in this same commit
            request_cancellation(planner, reason, config, false);
        }
    }
    Ok(())
}

fn owned_open_promise(state: &ExecutionState, id_or_key: &str) -> Result<String, InvalidTransition> {
    let promise = state.promise_by_id_or_key(id_or_key).ok_or_else(|| {
        InvalidTransition::new(format!(
            "promise {id_or_key} is not owned by this workflow"
        ))
    })?;
    if promise.status.is_terminal() {
        return Err(InvalidTransition::new(format!(
            "promise {} is already {:?}",
            promise.promise_id, promise.status
        )));
    }
    Ok(promise.promise_id.clone())
}

fn add_child(
    planner: &mut Planner,
    kind: String,
    input: serde_json::Value,
    key: String,
    queue: String,
    timeout_at: Option<DateTime<Utc>>,
    origin: CommandOrigin,
) -> Uuid {
    let child = NewWorkflow {
        id: Uuid::now_v7(),
        kind,
        version: 1,
        queue,
        input,
        parent_id: Some(planner.workflow_id),
        idempotency_key: Some(key.clone()),
    };
    let child_id = child.id;
    planner.push(WorkflowEvent::ChildWorkflowStarted {
        child_id,
        kind: child.kind.clone(),
        queue: child.queue.clone(),
        input: child.input.clone(),
        idempotency_key: key,
        origin,
        timeout_at,
    });
    if let Some(due_at) = timeout_at {
        planner.wakeup(WakeupKind::ChildTimeout, child_id.to_string(), due_at);
    }
    planner.transition.new_workflows.push(child);
    child_id
}

// =============================================================================
// Cancellation
// =============================================================================

fn request_cancellation(
    planner: &mut Planner,
    reason: String,
    config: &EngineConfig,
    live_claim: bool,
) {
    let deadline = planner.now
        + chrono::Duration::from_std(config.cancellation_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
    planner.push(WorkflowEvent::CancellationRequested {
        reason: reason.clone(),
        deadline: Some(deadline),
    });
    planner.abandon_outstanding(&reason);

    if planner.state.open_children().next().is_none() && !live_claim {
        planner.push(WorkflowEvent::WorkflowCancelled { reason });
    } else {
        planner.wakeup(WakeupKind::CancellationDeadline, "", deadline);
    }
}

/// Plan a cancellation request from outside the workflow
///
/// Returns `None` when the execution is terminal or already cancelling.
/// The request finalizes at once when nothing holds it open.
pub fn plan_cancellation(
    state: &ExecutionState,
    workflow_id: Uuid,
    reason: &str,
    live_claim: bool,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Option<Transition> {
    if state.is_terminal() || state.status == WorkflowStatus::Cancelling {
        return None;
    }
    let mut planner = Planner::new(workflow_id, state, now);
    request_cancellation(&mut planner, reason.to_string(), config, live_claim);
    Some(planner.finish())
}

/// Plan CANCELLING -> CANCELLED
///
/// Allowed once no child is open (or the deadline has passed) and no worker
/// holds a live claim.
pub fn plan_finalize_cancellation(
    state: &ExecutionState,
    workflow_id: Uuid,
    live_claim: bool,
    now: DateTime<Utc>,
) -> Option<Transition> {
    if state.status != WorkflowStatus::Cancelling || live_claim {
        return None;
    }
    let cancellation = state.cancellation.as_ref()?;
    let deadline_passed = cancellation.deadline.is_some_and(|d| d <= now);
    if state.open_children().next().is_some() && !deadline_passed {
        return None;
    }
    let mut planner = Planner::new(workflow_id, state, now);
    planner.push(WorkflowEvent::WorkflowCancelled {
        reason: cancellation.reason.clone(),
    });
    Some(planner.finish())
}

/// Plan the claim holder's submission against a cancelling execution
///
/// The claim is released and the commands are dropped; the cancellation
/// finalizes in the same commit when it can.
pub fn plan_observed_cancellation(
    state: &ExecutionState,
    workflow_id: Uuid,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Transition {
    let mut transition = plan_finalize_cancellation(state, workflow_id, false, now)
        .unwrap_or_default();
    transition.claimed_by = Some(worker_id.to_string());
    transition.release_claim = true;
    transition
}

// =============================================================================
// Settlements
// =============================================================================

/// Plan the events for a task's final result
///
/// Returns `None` when the result must be discarded: the workflow is
/// terminal or the task already settled.
pub fn plan_task_result(
    state: &ExecutionState,
    workflow_id: Uuid,
    task_id: Uuid,
    attempt: u32,
    result: &TaskResult,
    now: DateTime<Utc>,
) -> Option<Transition> {
    if state.is_terminal() {
        return None;
    }
    let task = state.tasks.get(&task_id)?;
    if task.status.is_terminal() {
        return None;
    }
    let mut planner = Planner::new(workflow_id, state, now);
    planner.push(match result {
        TaskResult::Completed(output) => WorkflowEvent::TaskCompleted {
            task_id,
            output: output.clone(),
            attempt,
        },
        TaskResult::Failed(error) => WorkflowEvent::TaskFailed {
            task_id,
            error: error.clone(),
            attempt,
        },
        TaskResult::Cancelled => WorkflowEvent::TaskCancelled {
            task_id,
            reason: "cancelled by workflow".to_string(),
        },
    });
    Some(planner.finish())
}

/// Status a task row settles with for a result
pub fn settled_status(result: &TaskResult) -> TaskStatus {
    match result {
        TaskResult::Completed(_) => TaskStatus::Completed,
        TaskResult::Failed(_) => TaskStatus::Failed,
        TaskResult::Cancelled => TaskStatus::Cancelled,
    }
}

/// Outcome of a settled promise
pub fn promise_outcome(promise: &PromiseEntry) -> Option<Outcome> {
    match promise.status {
        PromiseStatus::Created => None,
        PromiseStatus::Resolved => Some(Outcome::Completed(
            promise.value.clone().unwrap_or_default(),
        )),
        PromiseStatus::Rejected => Some(Outcome::Failed(
            promise
                .error
                .clone()
                .unwrap_or_else(|| WorkflowError::new("promise rejected")),
        )),
        PromiseStatus::TimedOut => Some(Outcome::TimedOut),
    }
}

/// First-wins promise settlement from outside the workflow
pub enum PromisePlan {
    /// Already settled: the original outcome, nothing to write
    Settled(Outcome),
    Settle(Transition, Outcome),
}

pub fn plan_promise_settlement(
    state: &ExecutionState,
    workflow_id: Uuid,
    promise_id: &str,
    outcome: Outcome,
    now: DateTime<Utc>,
) -> Result<PromisePlan, InvalidTransition> {
    let promise = state.promises.get(promise_id).ok_or_else(|| {
        InvalidTransition::new(format!("promise {promise_id} does not exist"))
    })?;
    if let Some(existing) = promise_outcome(promise) {
        return Ok(PromisePlan::Settled(existing));
    }
    if state.is_terminal() {
        return Err(InvalidTransition::new(format!(
            "cannot settle promise {promise_id} of a {} workflow",
            state.status
        )));
    }

    let mut planner = Planner::new(workflow_id, state, now);
    planner.push(match &outcome {
        Outcome::Completed(value) => WorkflowEvent::PromiseResolved {
            promise_id: promise_id.to_string(),
            value: value.clone(),
            origin: CommandOrigin::External,
        },
        Outcome::Failed(error) => WorkflowEvent::PromiseRejected {
            promise_id: promise_id.to_string(),
            error: error.clone(),
            origin: CommandOrigin::External,
        },
        Outcome::Cancelled | Outcome::TimedOut => {
            return Err(InvalidTransition::new(
                "promises settle only by resolution or rejection",
            ))
        }
    });
    planner.clear_wakeup(WakeupKind::PromiseTimeout, promise_id);
    Ok(PromisePlan::Settle(planner.finish(), outcome))
}

/// Child scheduling through the coordinator
pub enum ChildPlan {
    Existing(Uuid),
    Create(Transition, Uuid),
}

#[allow(clippy::too_many_arguments)]
pub fn plan_external_child(
    state: &ExecutionState,
    parent_id: Uuid,
    kind: &str,
    input: serde_json::Value,
    idempotency_key: Option<String>,
    queue: Option<String>,
    timeout_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<ChildPlan, InvalidTransition> {
    if let Some(existing) = idempotency_key
        .as_deref()
        .and_then(|key| state.child_by_key(key))
    {
        return Ok(ChildPlan::Existing(existing.child_id));
    }
    if state.is_terminal() || state.status == WorkflowStatus::Cancelling {
        return Err(InvalidTransition::new(format!(
            "cannot schedule a child of a {} workflow",
            state.status
        )));
    }

    let key = idempotency_key.unwrap_or_else(|| format!("external-{}", Uuid::now_v7()));
    let queue = queue.unwrap_or_else(|| state.queue.clone());
    let mut planner = Planner::new(parent_id, state, now);
    let child_id = add_child(
        &mut planner,
        kind.to_string(),
        input,
        key,
        queue,
        timeout_at,
        CommandOrigin::External,
    );
    Ok(ChildPlan::Create(planner.finish(), child_id))
}

/// Plan the parent-side event for a terminal child
///
/// `child` is the child's own projected state.
pub fn plan_child_result(
    parent: &ExecutionState,
    parent_id: Uuid,
    child_id: Uuid,
    child: &ExecutionState,
    now: DateTime<Utc>,
) -> Option<Transition> {
    if parent.is_terminal() {
        return None;
    }
    let link = parent.children.get(&child_id)?;
    if link.status != ChildStatus::Running {
        return None;
    }

    let event = match child.status {
        WorkflowStatus::Completed => WorkflowEvent::ChildWorkflowCompleted {
            child_id,
            result: child.result.clone().unwrap_or_default(),
        },
        WorkflowStatus::Failed => WorkflowEvent::ChildWorkflowFailed {
            child_id,
            error: child
                .error
                .clone()
                .unwrap_or_else(|| WorkflowError::new("child workflow failed")),
        },
        WorkflowStatus::Cancelled => WorkflowEvent::ChildWorkflowCancelled {
            child_id,
            reason: child
                .cancellation
                .as_ref()
                .map(|c| c.reason.clone())
                .unwrap_or_else(|| "cancelled".to_string()),
        },
        _ => return None,
    };

    let mut planner = Planner::new(parent_id, parent, now);
    planner.push(event);
    planner.clear_wakeup(WakeupKind::ChildTimeout, child_id.to_string());
    if planner.state.status == WorkflowStatus::Cancelling {
        planner
            .transition
            .follow_ups
            .push(FollowUp::FinalizeCancellation {
                workflow_id: parent_id,
            });
    }
    Some(planner.finish())
}

// =============================================================================
// Wakeups
// =============================================================================

/// Plan a due wakeup
///
/// Always returns a transition: when nothing is left to fire, it only
/// clears the index entry.
pub fn plan_wakeup(
    state: &ExecutionState,
    key: &WakeupKey,
    live_claim: bool,
    now: DateTime<Utc>,
) -> Transition {
    let mut planner = Planner::new(key.workflow_id, state, now);
    planner.transition.cleared_wakeups.push(key.clone());
    if state.is_terminal() {
        return planner.transition;
    }

    match key.kind {
        WakeupKind::Timer => {
            let started = state
                .timers
                .get(&key.target)
                .is_some_and(|t| !t.status.is_terminal());
            if started {
                planner.push(WorkflowEvent::TimerFired {
                    timer_id: key.target.clone(),
                });
            }
        }
        WakeupKind::PromiseTimeout => {
            let open = state
                .promises
                .get(&key.target)
                .is_some_and(|p| !p.status.is_terminal());
            if open {
                planner.push(WorkflowEvent::PromiseTimedOut {
                    promise_id: key.target.clone(),
                });
            }
        }
        WakeupKind::ChildTimeout => {
            let open = key
                .target
                .parse::<Uuid>()
                .ok()
                .and_then(|id| state.children.get(&id))
                .filter(|c| !c.status.is_terminal())
                .map(|c| c.child_id);
            if let Some(child_id) = open {
                planner.push(WorkflowEvent::ChildWorkflowTimedOut { child_id });
                planner.transition.follow_ups.push(FollowUp::Cancel {
                    workflow_id: child_id,
                    reason: "child workflow timed out".to_string(),
                });
            }
        }
        WakeupKind::CancellationDeadline => {
            if let Some(finalize) = plan_finalize_cancellation(state, key.workflow_id, live_claim, now)
            {
                let mut transition = finalize;
                transition.cleared_wakeups.push(key.clone());
                return transition;
            }
            // Still claimed: try again on the next sweep
            if live_claim && state.status == WorkflowStatus::Cancelling {
                planner.transition.cleared_wakeups.clear();
            }
            return planner.transition;
        }
    }

    if planner.transition.events.is_empty() {
        planner.transition
    } else {
        planner.finish()
    }
}
