//! Workflow engine
//!
//! The `WorkflowEngine` is the write path for execution logs. It is
//! responsible for:
//! - Starting executions
//! - Applying claim holders' command batches
//! - Recording task, timer, promise and child outcomes
//! - Cancellation and its cascade to children
//!
//! Every write loads the log, plans a transition against the projected
//! state and commits it with an optimistic sequence check. A conflicted
//! commit is re-planned against the fresh log.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::machine::{
    plan_cancellation, plan_child_result, plan_finalize_cancellation, plan_observed_cancellation,
    plan_resumption, FollowUp, InvalidTransition, Transition,
};
use super::registry::RegistryError;
use crate::config::EngineConfig;
use crate::persistence::{
    CreateOutcome, NewWorkflow, StoreError, WorkflowClaim, WorkflowEventStore, WorkflowRecord,
};
use crate::reliability::retry_transient;
use crate::replay::DeterminismViolation;
use crate::scheduler::Scheduler;
use crate::workflow::{
    project, EventEnvelope, ExecutionState, Workflow, WorkflowCommand, WorkflowStatus,
};

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(StoreError),

    /// The log kept moving under the operation
    #[error("workflow {workflow_id} conflicted after {attempts} attempts")]
    Conflict { workflow_id: Uuid, attempts: u32 },

    /// Rejected by the state machine; nothing was written
    #[error("invalid transition for workflow {workflow_id}: {reason}")]
    InvalidTransition { workflow_id: Uuid, reason: String },

    #[error("determinism violation: {0}")]
    DeterminismViolation(#[from] DeterminismViolation),

    #[error("claim lease expired: {0}")]
    ClaimLeaseExpired(Uuid),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("promise not found: {0}")]
    PromiseNotFound(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(id) => Self::WorkflowNotFound(id),
            StoreError::TaskNotFound(id) => Self::TaskNotFound(id),
            StoreError::LeaseExpired(id) => Self::ClaimLeaseExpired(id),
            other => Self::Store(other),
        }
    }
}

impl EngineError {
    pub(crate) fn invalid(workflow_id: Uuid, err: InvalidTransition) -> Self {
        Self::InvalidTransition {
            workflow_id,
            reason: err.0,
        }
    }

    /// Whether re-running against fresh history may succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result of planning against the current log
pub(crate) enum Plan<T> {
    /// Nothing to write
    Done(T),
    Commit(Transition, T),
}

/// A planned operation after its commit
pub(crate) struct Applied<T> {
    pub value: T,
    pub follow_ups: Vec<FollowUp>,
}

/// Accepted command batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub last_sequence: i64,
    pub status: WorkflowStatus,
}

/// Durable workflow engine
///
/// Cheap to clone; clones share the store.
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowEventStore::new());
/// let engine = WorkflowEngine::new(store);
///
/// let workflow_id = engine.start::<OrderWorkflow>(input).await?;
/// engine.request_cancellation(workflow_id, "customer cancelled").await?;
/// ```
#[derive(Clone)]
pub struct WorkflowEngine {
    pub(crate) store: Arc<dyn WorkflowEventStore>,
    pub(crate) config: EngineConfig,
    scheduler: Scheduler,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowEventStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn WorkflowEventStore>, config: EngineConfig) -> Self {
        let scheduler = Scheduler::new(store.clone(), &config);
        Self {
            store,
            config,
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowEventStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // =========================================================================
    // Starting and resuming
    // =========================================================================

    /// Start a typed workflow on the default queue
    #[instrument(skip(self, input), fields(kind = W::KIND))]
    pub async fn start<W: Workflow>(&self, input: W::Input) -> Result<Uuid, EngineError> {
        let workflow = NewWorkflow::new(W::KIND, serde_json::to_value(input)?)
            .with_version(W::VERSION)
            .with_queue(self.config.default_queue.clone());
        Ok(self.start_workflow(workflow).await?.id())
    }

    /// Create an execution; with an idempotency key an existing one is returned
    ///
    /// Children are created through [`schedule_child`](Self::schedule_child)
    /// or workflow commands, never here.
    #[instrument(skip(self, workflow), fields(kind = %workflow.kind, workflow_id = %workflow.id))]
    pub async fn start_workflow(&self, workflow: NewWorkflow) -> Result<CreateOutcome, EngineError> {
        if workflow.parent_id.is_some() {
            return Err(EngineError::invalid(
                workflow.id,
                InvalidTransition("child executions are started by their parent".to_string()),
            ));
        }
        let outcome = self
            .store_call("create_workflow", || {
                self.store.create_workflow(workflow.clone())
            })
            .await?;
        match outcome {
            CreateOutcome::Created(id) => info!(workflow_id = %id, "Started workflow"),
            CreateOutcome::Existing(id) => {
                debug!(workflow_id = %id, "Workflow already exists for idempotency key")
            }
        }
        Ok(outcome)
    }

    /// Apply the command batch produced by a resumption
    ///
    /// `expected_sequence` is the last sequence of the history the workflow
    /// logic ran against. If the log has moved since, nothing is written and
    /// [`EngineError::Conflict`] tells the caller to re-run the logic.
    ///
    /// A cancelling execution is not resumed: the claim is released, the
    /// cancellation finalizes when it can, and the batch is rejected.
    #[instrument(skip(self, commands), fields(commands = commands.len()))]
    pub async fn submit_commands(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
        expected_sequence: i64,
        commands: Vec<WorkflowCommand>,
    ) -> Result<Submitted, EngineError> {
        let (record, state) = self.load(workflow_id).await?;
        if state.last_sequence != expected_sequence {
            debug!(
                %workflow_id,
                expected_sequence,
                actual = state.last_sequence,
                "History moved during resumption"
            );
            return Err(EngineError::Conflict {
                workflow_id,
                attempts: 1,
            });
        }
        if !record.is_claimed_by(worker_id) {
            return Err(EngineError::ClaimLeaseExpired(workflow_id));
        }

        let now = Utc::now();
        if state.status == WorkflowStatus::Cancelling {
            let transition = plan_observed_cancellation(&state, workflow_id, worker_id, now);
            let (_, follow_ups) = self.commit_once(workflow_id, &state, transition).await?;
            self.drive(follow_ups).await;
            info!(%workflow_id, worker_id, "Cancellation observed on resumption");
            return Err(EngineError::invalid(
                workflow_id,
                InvalidTransition("workflow is cancelling".to_string()),
            ));
        }

        let transition = plan_resumption(&state, workflow_id, worker_id, commands, &self.config, now)
            .map_err(|e| EngineError::invalid(workflow_id, e))?;
        let status = transition.status.unwrap_or(state.status);
        let (last_sequence, follow_ups) = self.commit_once(workflow_id, &state, transition).await?;

        debug!(%workflow_id, worker_id, last_sequence, %status, "Applied resumption");
        self.drive(follow_ups).await;
        Ok(Submitted {
            last_sequence,
            status,
        })
    }

    /// [`submit_commands`](Self::submit_commands) for a claim and its history
    pub async fn submit_for_claim(
        &self,
        claim: &WorkflowClaim,
        history: &[EventEnvelope],
        commands: Vec<WorkflowCommand>,
    ) -> Result<Submitted, EngineError> {
        let expected = history.last().map(|e| e.sequence).unwrap_or_default();
        self.submit_commands(claim.workflow.id, &claim.worker_id, expected, commands)
            .await
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Request cancellation of an execution and its open children
    ///
    /// Returns `false` when the execution was already terminal or
    /// cancelling.
    #[instrument(skip(self))]
    pub async fn request_cancellation(
        &self,
        workflow_id: Uuid,
        reason: &str,
    ) -> Result<bool, EngineError> {
        let applied = self.cancel_step(workflow_id, reason).await?;
        if applied.value {
            info!(%workflow_id, reason, "Cancellation requested");
        }
        self.drive(applied.follow_ups).await;
        Ok(applied.value)
    }

    async fn cancel_step(&self, workflow_id: Uuid, reason: &str) -> Result<Applied<bool>, EngineError> {
        self.apply(workflow_id, "request_cancellation", |record, state| {
            let now = Utc::now();
            Ok(
                match plan_cancellation(
                    state,
                    workflow_id,
                    reason,
                    record.has_live_claim(now),
                    &self.config,
                    now,
                ) {
                    Some(transition) => Plan::Commit(transition, true),
                    None => Plan::Done(false),
                },
            )
        })
        .await
    }

    /// Move a cancelling execution to CANCELLED if nothing holds it open
    pub(crate) async fn finalize_step(
        &self,
        workflow_id: Uuid,
        now: chrono::DateTime<Utc>,
    ) -> Result<Applied<bool>, EngineError> {
        self.apply(workflow_id, "finalize_cancellation", |record, state| {
            Ok(
                match plan_finalize_cancellation(state, workflow_id, record.has_live_claim(now), now) {
                    Some(transition) => Plan::Commit(transition, true),
                    None => Plan::Done(false),
                },
            )
        })
        .await
    }

    /// Deliver a terminal child's outcome to its parent's log
    pub(crate) async fn notify_parent_step(&self, child_id: Uuid) -> Result<Applied<bool>, EngineError> {
        let (child, child_state) = self.load(child_id).await?;
        let Some(parent_id) = child.parent_id.filter(|_| child.parent_notify_pending) else {
            return Ok(Applied {
                value: false,
                follow_ups: vec![],
            });
        };

        let applied = match self
            .apply(parent_id, "deliver_child_result", |_, parent| {
                Ok(
                    match plan_child_result(parent, parent_id, child_id, &child_state, Utc::now()) {
                        Some(transition) => Plan::Commit(transition, true),
                        None => Plan::Done(false),
                    },
                )
            })
            .await
        {
            Err(EngineError::WorkflowNotFound(_)) => {
                warn!(%child_id, %parent_id, "Parent of finished child is gone");
                Applied {
                    value: false,
                    follow_ups: vec![],
                }
            }
            other => other?,
        };

        self.store_call("mark_parent_notified", || {
            self.store.mark_parent_notified(child_id)
        })
        .await?;
        if applied.value {
            debug!(%child_id, %parent_id, status = %child_state.status, "Delivered child result to parent");
        }
        Ok(applied)
    }

    /// Run follow-up work on other executions until none is left
    ///
    /// Failures are logged; the maintenance sweeps repeat whatever was
    /// missed.
    pub(crate) async fn drive(&self, follow_ups: Vec<FollowUp>) {
        let mut queue: VecDeque<FollowUp> = follow_ups.into();
        while let Some(follow_up) = queue.pop_front() {
            let result = match &follow_up {
                FollowUp::Cancel {
                    workflow_id,
                    reason,
                } => self.cancel_step(*workflow_id, reason).await,
                FollowUp::NotifyParent { child_id } => self.notify_parent_step(*child_id).await,
                FollowUp::FinalizeCancellation { workflow_id } => {
                    self.finalize_step(*workflow_id, Utc::now()).await
                }
            };
            match result {
                Ok(applied) => queue.extend(applied.follow_ups),
                Err(e) => warn!(?follow_up, "Follow-up failed, maintenance will retry: {}", e),
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, EngineError> {
        Ok(self
            .store_call("get_workflow", || self.store.get_workflow(workflow_id))
            .await?)
    }

    /// Events with `sequence >= from_sequence`
    pub async fn read_events(
        &self,
        workflow_id: Uuid,
        from_sequence: i64,
    ) -> Result<Vec<EventEnvelope>, EngineError> {
        Ok(self
            .store_call("read_events", || {
                self.store.read_events(workflow_id, from_sequence)
            })
            .await?)
    }

    /// Current state projected from the full log
    pub async fn project(&self, workflow_id: Uuid) -> Result<ExecutionState, EngineError> {
        let events = self.read_events(workflow_id, 1).await?;
        if events.is_empty() {
            return Err(EngineError::WorkflowNotFound(workflow_id));
        }
        Ok(project(&events))
    }

    /// Decode a completed workflow's result
    pub async fn result<T: serde::de::DeserializeOwned>(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<T>, EngineError> {
        let state = self.project(workflow_id).await?;
        Ok(state
            .result
            .map(serde_json::from_value::<T>)
            .transpose()?)
    }

    // =========================================================================
    // Write path
    // =========================================================================

    pub(crate) async fn store_call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        retry_transient(&self.config.store_retry, operation, call).await
    }

    pub(crate) async fn load(
        &self,
        workflow_id: Uuid,
    ) -> Result<(WorkflowRecord, ExecutionState), EngineError> {
        let record = self.get_workflow(workflow_id).await?;
        let events = self.read_events(workflow_id, 1).await?;
        Ok((record, project(&events)))
    }

    /// Commit a transition planned against `state`, without re-planning
    async fn commit_once(
        &self,
        workflow_id: Uuid,
        state: &ExecutionState,
        transition: Transition,
    ) -> Result<(i64, Vec<FollowUp>), EngineError> {
        let (batch, follow_ups) = transition.into_batch(workflow_id, state.last_sequence);
        match self
            .store_call("commit", || self.store.commit(batch.clone()))
            .await
        {
            Ok(sequence) => Ok((sequence, follow_ups)),
            Err(StoreError::ConcurrencyConflict { .. }) => Err(EngineError::Conflict {
                workflow_id,
                attempts: 1,
            }),
            Err(StoreError::DuplicateKey(key)) => Err(EngineError::invalid(
                workflow_id,
                InvalidTransition(format!("idempotency key {key} is already in use")),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Plan and commit against the latest log, re-planning on conflict
    ///
    /// A taken idempotency key is treated as a conflict too: the writer that
    /// took it also moved the log, and re-planning finds its entry.
    pub(crate) async fn apply<T, F>(
        &self,
        workflow_id: Uuid,
        operation: &'static str,
        mut plan: F,
    ) -> Result<Applied<T>, EngineError>
    where
        F: FnMut(&WorkflowRecord, &ExecutionState) -> Result<Plan<T>, EngineError>,
    {
        let attempts = self.config.max_conflict_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let (record, state) = self.load(workflow_id).await?;
            let (transition, value) = match plan(&record, &state)? {
                Plan::Done(value) => {
                    return Ok(Applied {
                        value,
                        follow_ups: vec![],
                    })
                }
                Plan::Commit(transition, value) => (transition, value),
            };

            let (batch, follow_ups) = transition.into_batch(workflow_id, state.last_sequence);
            let events = batch.events.len();
            match self
                .store_call("commit", || self.store.commit(batch.clone()))
                .await
            {
                Ok(sequence) => {
                    debug!(%workflow_id, operation, sequence, events, "Appended events");
                    return Ok(Applied { value, follow_ups });
                }
                Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                    debug!(%workflow_id, operation, attempt, expected, actual, "Append conflicted, replanning");
                }
                Err(StoreError::DuplicateKey(key)) => {
                    debug!(%workflow_id, operation, attempt, key, "Idempotency key taken concurrently, replanning");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(%workflow_id, operation, attempts, "Giving up after repeated conflicts");
        Err(EngineError::Conflict {
            workflow_id,
            attempts,
        })
    }
}
