//! Replay-driven workflow context

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::{DeterminismValidator, DeterminismViolation};
use crate::workflow::{
    project, ChildStatus, CommandKind, CommandOrigin, CommandSignature, EventEnvelope,
    ExecutionState, PromiseStatus, RecordedCommand, RecordedTarget, TaskStatus, TimerStatus,
    WorkflowCommand, WorkflowError, WorkflowEvent, WorkflowInterrupt, WorkflowResult,
};

/// Reference to something a workflow can wait on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Handle {
    Task(Uuid),
    Timer(String),
    Promise(String),
    Child(Uuid),
    /// Issued during this run; it cannot have finished yet
    New(CommandSignature),
}

/// Terminal result of a task, timer, promise or child
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(serde_json::Value),
    Failed(WorkflowError),
    Cancelled,
    TimedOut,
}

impl Outcome {
    pub const CANCELLED: &'static str = "CANCELLED";
    pub const TIMED_OUT: &'static str = "TIMED_OUT";

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// The completion value, or the failure as a workflow error
    pub fn into_value(self) -> WorkflowResult<serde_json::Value> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(error) => Err(WorkflowInterrupt::Failed(error)),
            Self::Cancelled => Err(WorkflowInterrupt::Failed(
                WorkflowError::new("cancelled").with_code(Self::CANCELLED),
            )),
            Self::TimedOut => Err(WorkflowInterrupt::Failed(
                WorkflowError::new("timed out").with_code(Self::TIMED_OUT),
            )),
        }
    }

    pub fn into_typed<T: DeserializeOwned>(self) -> WorkflowResult<T> {
        Ok(serde_json::from_value(self.into_value()?)?)
    }
}

/// Options for [`WorkflowContext::schedule_task_with`]
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub queue: Option<String>,
    pub idempotency_key: Option<String>,
    pub max_retries: Option<u32>,
}

impl TaskOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// Options for [`WorkflowContext::schedule_child`]
#[derive(Debug, Clone, Default)]
pub struct ChildOptions {
    pub idempotency_key: Option<String>,
    pub queue: Option<String>,
    pub timeout: Option<Duration>,
}

impl ChildOptions {
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Settlement made by this run's own commands
#[derive(Debug, Clone)]
struct LocalSettlement {
    order: usize,
    outcome: Outcome,
}

/// Context a workflow runs against
///
/// Built from the full event history of an execution. As the workflow
/// re-issues its commands, the context matches them against the recorded
/// ones and hands back handles to the recorded items. Once the recorded
/// prefix is exhausted, commands are collected for submission.
///
/// Settlements are revealed in history order: while a recorded command is
/// still ahead, only events from before the resumption that issued it are
/// visible. That makes every branch the workflow takes during replay the
/// same one it took originally.
pub struct WorkflowContext {
    workflow_id: Uuid,
    history: Vec<EventEnvelope>,
    state: ExecutionState,
    validator: DeterminismValidator,
    /// Sequences of `WorkflowResumed` events, ascending
    resumptions: Vec<i64>,
    /// Child idempotency key -> (child id, sequence of its start event)
    child_starts: HashMap<String, (Uuid, i64)>,
    commands: Vec<WorkflowCommand>,
    values: BTreeMap<String, serde_json::Value>,
    new_timers: HashSet<String>,
    new_promises: HashMap<String, Option<String>>,
    new_child_keys: HashMap<String, Handle>,
    local: HashMap<Handle, LocalSettlement>,
    violation: Option<DeterminismViolation>,
}

impl WorkflowContext {
    /// Create a context from an execution's ordered event history
    pub fn new(workflow_id: Uuid, history: Vec<EventEnvelope>) -> Self {
        let state = project(&history);
        let mut resumptions = Vec::new();
        let mut child_starts = HashMap::new();
        for envelope in &history {
            match &envelope.event {
                WorkflowEvent::WorkflowResumed { .. } => resumptions.push(envelope.sequence),
                WorkflowEvent::ChildWorkflowStarted {
                    child_id,
                    idempotency_key,
                    ..
                } => {
                    child_starts
                        .entry(idempotency_key.clone())
                        .or_insert((*child_id, envelope.sequence));
                }
                _ => {}
            }
        }

        Self {
            workflow_id,
            validator: DeterminismValidator::new(state.commands.clone()),
            history,
            state,
            resumptions,
            child_starts,
            commands: Vec::new(),
            values: BTreeMap::new(),
            new_timers: HashSet::new(),
            new_promises: HashMap::new(),
            new_child_keys: HashMap::new(),
            local: HashMap::new(),
            violation: None,
        }
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Raw start input
    pub fn input(&self) -> &serde_json::Value {
        &self.state.input
    }

    /// Whether recorded commands are still being fast-forwarded
    pub fn is_replaying(&self) -> bool {
        self.validator.is_replaying()
    }

    /// Deterministic current time
    ///
    /// The timestamp of the latest event visible to the workflow.
    pub fn now(&self) -> DateTime<Utc> {
        let horizon = self.horizon();
        let visible = self.history.partition_point(|e| e.sequence < horizon);
        match visible {
            0 => self
                .history
                .first()
                .map(|e| e.recorded_at)
                .unwrap_or_default(),
            n => self.history[n - 1].recorded_at,
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub fn schedule_task(
        &mut self,
        kind: &str,
        input: impl Serialize,
    ) -> WorkflowResult<Handle> {
        self.schedule_task_with(kind, input, TaskOptions::default())
    }

    pub fn schedule_task_with(
        &mut self,
        kind: &str,
        input: impl Serialize,
        options: TaskOptions,
    ) -> WorkflowResult<Handle> {
        let command = WorkflowCommand::ScheduleTask {
            kind: kind.to_string(),
            queue: options.queue,
            input: serde_json::to_value(input)?,
            idempotency_key: options.idempotency_key,
            max_retries: options.max_retries,
        };
        Ok(match self.issue(command)? {
            Some(RecordedTarget::Task(task_id)) => Handle::Task(task_id),
            _ => Handle::New(CommandSignature::new(CommandKind::ScheduleTask, kind)),
        })
    }

    /// Start a timer with a workflow-chosen id
    pub fn start_timer(&mut self, id: &str, fire_at: DateTime<Utc>) -> WorkflowResult<Handle> {
        let command = WorkflowCommand::StartTimer {
            id: id.to_string(),
            fire_at,
        };
        if self.issue(command)?.is_none() {
            self.new_timers.insert(id.to_string());
        }
        Ok(Handle::Timer(id.to_string()))
    }

    /// Start a timer relative to [`now`](Self::now) and wait for it
    pub fn sleep(&mut self, id: &str, duration: Duration) -> WorkflowResult<()> {
        let fire_at = self.now() + to_chrono(duration);
        let timer = self.start_timer(id, fire_at)?;
        self.wait(&timer)?;
        Ok(())
    }

    /// Cancel a started timer
    ///
    /// A timer that already fired or was cancelled is left alone.
    pub fn cancel_timer(&mut self, id: &str) -> WorkflowResult<()> {
        let handle = Handle::Timer(id.to_string());
        if !self.new_timers.contains(id) && !self.state.timers.contains_key(id) {
            return Err(WorkflowError::new(format!("unknown timer: {id}")).into());
        }
        if self.outcome(&handle).is_some() {
            return Ok(());
        }
        self.issue(WorkflowCommand::CancelTimer { id: id.to_string() })?;
        self.settle_locally(handle, Outcome::Cancelled);
        Ok(())
    }

    pub fn create_promise(
        &mut self,
        name: &str,
        idempotency_key: Option<&str>,
    ) -> WorkflowResult<Handle> {
        self.create_promise_with_timeout(name, idempotency_key, None)
    }

    /// Create a promise that times out after `timeout`
    pub fn create_promise_with_timeout(
        &mut self,
        name: &str,
        idempotency_key: Option<&str>,
        timeout: Option<Duration>,
    ) -> WorkflowResult<Handle> {
        let command = WorkflowCommand::CreatePromise {
            name: name.to_string(),
            idempotency_key: idempotency_key.map(str::to_string),
            timeout_at: timeout.map(|t| self.now() + to_chrono(t)),
        };
        if self.issue(command)?.is_none() {
            self.new_promises
                .insert(name.to_string(), idempotency_key.map(str::to_string));
        }
        Ok(Handle::Promise(name.to_string()))
    }

    /// Resolve one of this execution's promises, by name or idempotency key
    pub fn resolve_promise(
        &mut self,
        id_or_key: &str,
        value: impl Serialize,
    ) -> WorkflowResult<()> {
        let value = serde_json::to_value(value)?;
        let Some(name) = self.open_promise(id_or_key)? else {
            return Ok(());
        };
        // Recorded under the name whichever way the caller addressed it
        self.issue(WorkflowCommand::ResolvePromise {
            id_or_key: name.clone(),
            value: value.clone(),
        })?;
        let handle = Handle::Promise(name);
        self.settle_locally(handle, Outcome::Completed(value));
        Ok(())
    }

    pub fn reject_promise(&mut self, id_or_key: &str, error: WorkflowError) -> WorkflowResult<()> {
        let Some(name) = self.open_promise(id_or_key)? else {
            return Ok(());
        };
        self.issue(WorkflowCommand::RejectPromise {
            id_or_key: name.clone(),
            error: error.clone(),
        })?;
        let handle = Handle::Promise(name);
        self.settle_locally(handle, Outcome::Failed(error));
        Ok(())
    }

    /// Schedule a child workflow
    ///
    /// With an idempotency key that already names a child of this
    /// execution, the existing child is returned and no command is issued.
    pub fn schedule_child(
        &mut self,
        kind: &str,
        input: impl Serialize,
        options: ChildOptions,
    ) -> WorkflowResult<Handle> {
        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = self.existing_child(key) {
                return Ok(existing);
            }
        }

        let key = options.idempotency_key.clone();
        let command = WorkflowCommand::ScheduleChildWorkflow {
            kind: kind.to_string(),
            input: serde_json::to_value(input)?,
            idempotency_key: options.idempotency_key,
            queue: options.queue,
            timeout_at: options.timeout.map(|t| self.now() + to_chrono(t)),
        };
        let handle = match self.issue(command)? {
            Some(RecordedTarget::Child { child_id, .. }) => Handle::Child(child_id),
            _ => Handle::New(CommandSignature::new(
                CommandKind::ScheduleChildWorkflow,
                kind,
            )),
        };
        if let Some(key) = key {
            self.new_child_keys.insert(key, handle.clone());
        }
        Ok(handle)
    }

    /// Set a workflow-local state value
    pub fn set_state(&mut self, key: &str, value: impl Serialize) -> WorkflowResult<()> {
        let value = serde_json::to_value(value)?;
        self.issue(WorkflowCommand::SetState {
            key: key.to_string(),
            value: value.clone(),
        })?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn clear_state(&mut self, key: &str) -> WorkflowResult<()> {
        self.issue(WorkflowCommand::ClearState {
            key: key.to_string(),
        })?;
        self.values.remove(key);
        Ok(())
    }

    /// Read a workflow-local state value set earlier in the run
    pub fn get_state<T: DeserializeOwned>(&self, key: &str) -> WorkflowResult<Option<T>> {
        self.values
            .get(key)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// The outcome of a handle, if it has finished
    pub fn outcome(&self, handle: &Handle) -> Option<Outcome> {
        self.settlement(handle).map(|(_, outcome)| outcome)
    }

    /// Wait for one handle; suspends the run while it is outstanding
    pub fn wait(&self, handle: &Handle) -> WorkflowResult<Outcome> {
        self.outcome(handle).ok_or(WorkflowInterrupt::Suspended)
    }

    /// Wait for every handle
    pub fn wait_all(&self, handles: &[Handle]) -> WorkflowResult<Vec<Outcome>> {
        handles.iter().map(|h| self.wait(h)).collect()
    }

    /// Wait for the first handle to finish
    ///
    /// "First" is decided by log order, so replay always picks the same one.
    /// Returns the index of the winning handle and its outcome.
    pub fn wait_any(&self, handles: &[Handle]) -> WorkflowResult<(usize, Outcome)> {
        handles
            .iter()
            .enumerate()
            .filter_map(|(index, h)| self.settlement(h).map(|(order, o)| (order, index, o)))
            .min_by_key(|(order, index, _)| (*order, *index))
            .map(|(_, index, outcome)| (index, outcome))
            .ok_or(WorkflowInterrupt::Suspended)
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Commands issued beyond the recorded history so far
    pub fn commands(&self) -> &[WorkflowCommand] {
        &self.commands
    }

    /// Turn a finished run into the batch to submit
    ///
    /// Returns the violation instead when replay diverged anywhere in the
    /// run, even if the workflow swallowed the error.
    pub fn into_commands(
        self,
        result: WorkflowResult<serde_json::Value>,
    ) -> Result<Vec<WorkflowCommand>, DeterminismViolation> {
        if let Some(violation) = self.violation {
            return Err(violation);
        }
        let terminal = match result {
            Err(WorkflowInterrupt::Nondeterminism(violation)) => return Err(violation),
            Ok(result) => Some(WorkflowCommand::Complete { result }),
            Err(WorkflowInterrupt::Suspended) => None,
            Err(WorkflowInterrupt::Failed(error)) => Some(WorkflowCommand::Fail { error }),
            Err(WorkflowInterrupt::Cancelled(reason)) => {
                Some(WorkflowCommand::RequestCancellation { reason })
            }
        };
        self.validator.finish()?;

        let mut commands = self.commands;
        commands.extend(terminal);
        Ok(commands)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Run a command through the validator
    ///
    /// Returns the recorded target when the command was fast-forwarded.
    fn issue(
        &mut self,
        command: WorkflowCommand,
    ) -> Result<Option<RecordedTarget>, WorkflowInterrupt> {
        let Some(signature) = command.signature() else {
            return Ok(None);
        };
        match self.validator.advance(&signature) {
            Ok(Some(RecordedCommand { target, .. })) => Ok(Some(target)),
            Ok(None) => {
                self.commands.push(command);
                Ok(None)
            }
            Err(violation) => {
                self.violation.get_or_insert_with(|| violation.clone());
                Err(WorkflowInterrupt::Nondeterminism(violation))
            }
        }
    }

    /// Everything with a sequence below this is visible to the workflow
    fn horizon(&self) -> i64 {
        let Some(next) = self.validator.peek() else {
            return i64::MAX;
        };
        let started = self.resumptions.partition_point(|s| *s < next.sequence);
        match started {
            0 => 0,
            n => self.resumptions[n - 1],
        }
    }

    fn visible(&self, settled_at: Option<i64>) -> Option<i64> {
        settled_at.filter(|s| *s < self.horizon())
    }

    fn settle_locally(&mut self, handle: Handle, outcome: Outcome) {
        let order = self.local.len();
        self.local.insert(handle, LocalSettlement { order, outcome });
    }

    /// Sort key and outcome of a finished handle
    fn settlement(&self, handle: &Handle) -> Option<(i64, Outcome)> {
        if let Some(local) = self.local.get(handle) {
            // After everything in the log
            return Some((i64::MAX - 1_000_000 + local.order as i64, local.outcome.clone()));
        }

        match handle {
            Handle::New(_) => None,
            Handle::Task(task_id) => {
                let task = self.state.tasks.get(task_id)?;
                let at = self.visible(task.settled_at)?;
                let outcome = match task.status {
                    TaskStatus::Completed => {
                        Outcome::Completed(task.output.clone().unwrap_or_default())
                    }
                    TaskStatus::Failed => Outcome::Failed(
                        task.error
                            .clone()
                            .map(WorkflowError::from)
                            .unwrap_or_else(|| WorkflowError::new("task failed")),
                    ),
                    TaskStatus::Cancelled => Outcome::Cancelled,
                    TaskStatus::Pending | TaskStatus::Running => return None,
                };
                Some((at, outcome))
            }
            Handle::Timer(id) => {
                if self.new_timers.contains(id) {
                    return None;
                }
                let timer = self.state.timers.get(id)?;
                let at = self.visible(timer.settled_at)?;
                let outcome = match timer.status {
                    TimerStatus::Fired => Outcome::Completed(serde_json::Value::Null),
                    TimerStatus::Cancelled => Outcome::Cancelled,
                    TimerStatus::Started => return None,
                };
                Some((at, outcome))
            }
            Handle::Promise(name) => {
                if self.new_promises.contains_key(name) {
                    return None;
                }
                let promise = self.state.promises.get(name)?;
                let at = self.visible(promise.settled_at)?;
                let outcome = match promise.status {
                    PromiseStatus::Resolved => {
                        Outcome::Completed(promise.value.clone().unwrap_or_default())
                    }
                    PromiseStatus::Rejected => Outcome::Failed(
                        promise
                            .error
                            .clone()
                            .unwrap_or_else(|| WorkflowError::new("promise rejected")),
                    ),
                    PromiseStatus::TimedOut => Outcome::TimedOut,
                    PromiseStatus::Created => return None,
                };
                Some((at, outcome))
            }
            Handle::Child(child_id) => {
                let child = self.state.children.get(child_id)?;
                let at = self.visible(child.settled_at)?;
                let outcome = match child.status {
                    ChildStatus::Completed => {
                        Outcome::Completed(child.result.clone().unwrap_or_default())
                    }
                    ChildStatus::Failed => Outcome::Failed(
                        child
                            .error
                            .clone()
                            .unwrap_or_else(|| WorkflowError::new("child workflow failed")),
                    ),
                    ChildStatus::Cancelled => Outcome::Cancelled,
                    ChildStatus::TimedOut => Outcome::TimedOut,
                    ChildStatus::Running => return None,
                };
                Some((at, outcome))
            }
        }
    }

    /// Handle of an unsettled promise owned by this execution
    ///
    /// `Ok(None)` when the promise already finished.
    /// Name of an owned, still open promise addressed by name or key
    fn open_promise(&self, id_or_key: &str) -> WorkflowResult<Option<String>> {
        let new = self.new_promises.iter().find(|(name, key)| {
            name.as_str() == id_or_key || key.as_deref() == Some(id_or_key)
        });
        let name = match new {
            Some((name, _)) => name.clone(),
            None => match self.state.promise_by_id_or_key(id_or_key) {
                Some(promise) => promise.promise_id.clone(),
                None => {
                    return Err(WorkflowError::new(format!(
                        "no promise of this workflow matches: {id_or_key}"
                    ))
                    .into())
                }
            },
        };
        let open = self.outcome(&Handle::Promise(name.clone())).is_none();
        Ok(open.then_some(name))
    }

    fn existing_child(&self, key: &str) -> Option<Handle> {
        if let Some(handle) = self.new_child_keys.get(key) {
            return Some(handle.clone());
        }
        let (child_id, started_at) = self.child_starts.get(key)?;
        if *started_at >= self.horizon() {
            return None;
        }
        // A child this run is about to re-issue is replayed, not looked up
        let entry = self.state.children.get(child_id)?;
        if entry.origin == CommandOrigin::Workflow
            && self.validator.peek().is_some_and(|next| {
                next.target
                    == RecordedTarget::Child {
                        child_id: *child_id,
                        idempotency_key: key.to_string(),
                    }
            })
        {
            return None;
        }
        Some(Handle::Child(*child_id))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
