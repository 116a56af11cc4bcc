//! Workflow resumption and task execution for claimed work

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::{EngineError, Submitted, TaskDisposition, WorkflowEngine, WorkflowRegistry};
use crate::persistence::{TaskClaim, WorkflowClaim};
use crate::replay::WorkflowContext;
use crate::scheduler::{ClaimToken, Scheduler};
use crate::task::{HeartbeatPayload, TaskContext, TaskError, TaskRegistry};
use crate::workflow::{EventEnvelope, WorkflowCommand, WorkflowError, WorkflowStatus};

/// Error code for a batch the state machine refused
pub const INVALID_COMMAND: &str = "INVALID_COMMAND";

/// Error code for executions no registered workflow can run
pub const UNKNOWN_WORKFLOW_KIND: &str = "UNKNOWN_WORKFLOW_KIND";

/// Error type for tasks no registered handler can run
pub const UNKNOWN_TASK_KIND: &str = "UNKNOWN_TASK_KIND";

/// Run workflow logic against a history and collect the batch to submit
///
/// A determinism violation turns into a `Fail` command carrying the
/// violation, so the execution fails instead of looping.
pub fn evaluate(
    registry: &WorkflowRegistry,
    kind: &str,
    workflow_id: Uuid,
    history: &[EventEnvelope],
) -> Vec<WorkflowCommand> {
    let workflow = match registry.get(kind) {
        Ok(workflow) => workflow,
        Err(e) => {
            error!(%workflow_id, kind, "{}", e);
            return vec![WorkflowCommand::Fail {
                error: WorkflowError::new(e.to_string()).with_code(UNKNOWN_WORKFLOW_KIND),
            }];
        }
    };

    let mut ctx = WorkflowContext::new(workflow_id, history.to_vec());
    let input = ctx.input().clone();
    let result = workflow.run_json(&mut ctx, input);
    match ctx.into_commands(result) {
        Ok(commands) => commands,
        Err(violation) => {
            error!(%workflow_id, kind, "Determinism violation: {}", violation);
            vec![WorkflowCommand::Fail {
                error: WorkflowError::from(&violation),
            }]
        }
    }
}

/// How a resumption ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resumption {
    Submitted(Submitted),
    /// The execution was cancelling; the claim was released
    Cancelling,
    /// A rejected batch failed the execution
    Rejected(String),
    /// Someone else finished the execution first
    Finished,
}

/// Runs claimed work against the engine
#[derive(Clone)]
pub struct WorkflowRunner {
    engine: WorkflowEngine,
    workflows: WorkflowRegistry,
    tasks: Arc<TaskRegistry>,
}

impl WorkflowRunner {
    pub fn new(engine: WorkflowEngine, workflows: WorkflowRegistry, tasks: TaskRegistry) -> Self {
        Self {
            engine,
            workflows,
            tasks: Arc::new(tasks),
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Resume a claimed execution
    ///
    /// When the log moved while the logic ran, the logic runs again on the
    /// fresh history. The claim is released on every exit path.
    #[instrument(skip(self, claim, history), fields(workflow_id = %claim.workflow.id, kind = %claim.workflow.kind))]
    pub async fn resume(
        &self,
        claim: &WorkflowClaim,
        mut history: Vec<EventEnvelope>,
    ) -> Result<Resumption, EngineError> {
        let workflow_id = claim.workflow.id;
        let attempts = self.engine.config().max_conflict_retries.saturating_add(1);

        for _ in 0..attempts {
            let commands = evaluate(&self.workflows, &claim.workflow.kind, workflow_id, &history);
            match self
                .engine
                .submit_for_claim(claim, &history, commands)
                .await
            {
                Ok(submitted) => return Ok(Resumption::Submitted(submitted)),
                Err(EngineError::Conflict { .. }) => {
                    debug!(%workflow_id, "History moved during run, re-running");
                    history = self.engine.read_events(workflow_id, 1).await?;
                }
                Err(EngineError::InvalidTransition { reason, .. }) => {
                    return self.rejected(claim, &history, reason).await;
                }
                Err(e) => {
                    self.release(claim).await;
                    return Err(e);
                }
            }
        }

        self.release(claim).await;
        Err(EngineError::Conflict {
            workflow_id,
            attempts,
        })
    }

    async fn rejected(
        &self,
        claim: &WorkflowClaim,
        history: &[EventEnvelope],
        reason: String,
    ) -> Result<Resumption, EngineError> {
        let workflow_id = claim.workflow.id;
        let state = self.engine.project(workflow_id).await?;
        if state.is_terminal() {
            self.release(claim).await;
            return Ok(Resumption::Finished);
        }
        if state.status == WorkflowStatus::Cancelling {
            debug!(%workflow_id, "Execution is cancelling, claim released");
            return Ok(Resumption::Cancelling);
        }

        warn!(%workflow_id, "Rejected command batch, failing execution: {}", reason);
        let fail = vec![WorkflowCommand::Fail {
            error: WorkflowError::new(reason.clone()).with_code(INVALID_COMMAND),
        }];
        match self.engine.submit_for_claim(claim, history, fail).await {
            Ok(_) => Ok(Resumption::Rejected(reason)),
            Err(e) => {
                self.release(claim).await;
                Err(e)
            }
        }
    }

    async fn release(&self, claim: &WorkflowClaim) {
        let token = ClaimToken::Workflow {
            workflow_id: claim.workflow.id,
            worker_id: claim.worker_id.clone(),
        };
        if let Err(e) = self.engine.scheduler().release(&token).await {
            warn!(workflow_id = %claim.workflow.id, "Failed to release claim: {}", e);
        }
    }

    /// Execute a claimed task and report its result
    ///
    /// The claim is heartbeated while the handler runs. If the heartbeat
    /// reports cancellation or a lost claim, the handler's token is
    /// cancelled.
    #[instrument(skip(self, claim), fields(task_id = %claim.task.id, kind = %claim.task.kind, attempt = claim.task.attempt))]
    pub async fn execute_task(
        &self,
        claim: &TaskClaim,
        heartbeat_interval: Duration,
    ) -> Result<TaskDisposition, EngineError> {
        let task = &claim.task;
        let Some(handler) = self.tasks.get(&task.kind) else {
            let error = TaskError::non_retryable(format!("no handler for task kind {}", task.kind))
                .with_type(UNKNOWN_TASK_KIND);
            return self.engine.fail_task(claim, error).await;
        };

        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(8);
        let ctx = TaskContext::new(
            task.id,
            task.workflow_id,
            task.kind.clone(),
            task.attempt,
            task.max_attempts(),
        )
        .with_idempotency_key(task.idempotency_key.clone())
        .with_heartbeat(heartbeat_tx);

        let token = ClaimToken::Task {
            task_id: task.id,
            worker_id: claim.worker_id.clone(),
            attempt: task.attempt,
        };
        let cancellation = ctx.cancellation_token();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.engine.scheduler().clone(),
            token,
            heartbeat_interval,
            heartbeat_rx,
            cancellation,
        ));

        let result = handler.execute(&ctx, task.input.clone()).await;
        heartbeat.abort();

        let disposition = match result {
            Ok(output) => self.engine.complete_task(claim, output).await,
            Err(_) if ctx.is_cancelled() => self.engine.cancel_task(claim).await,
            Err(error) => self.engine.fail_task(claim, error).await,
        };
        match &disposition {
            Ok(TaskDisposition::Retrying { visible_at }) => {
                debug!(task_id = %task.id, %visible_at, "Task scheduled for retry")
            }
            Ok(TaskDisposition::Discarded) => {
                info!(task_id = %task.id, "Task result discarded")
            }
            Ok(TaskDisposition::Recorded) => {}
            Err(EngineError::ClaimLeaseExpired(_)) => {
                warn!(task_id = %task.id, "Task claim was lost before reporting")
            }
            Err(e) => error!(task_id = %task.id, "Failed to report task result: {}", e),
        }
        disposition
    }
}

/// Extend a claim until aborted
///
/// Handler heartbeats extend it right away; otherwise it is extended every
/// `interval`.
async fn heartbeat_loop(
    scheduler: Scheduler,
    token: ClaimToken,
    interval: Duration,
    mut requests: mpsc::Receiver<HeartbeatPayload>,
    cancellation: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Some(_) = requests.recv() => {}
        }
        match scheduler.heartbeat(&token).await {
            Ok(response) if !response.accepted => {
                warn!(?token, "Heartbeat rejected, claim lost");
                cancellation.cancel();
                return;
            }
            Ok(response) if response.should_cancel => {
                debug!(?token, "Cancellation requested");
                cancellation.cancel();
            }
            Ok(_) => {}
            Err(e) => warn!(?token, "Heartbeat failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowEventStore, NewWorkflow, WorkflowEventStore};
    use crate::replay::Handle;
    use crate::workflow::{Workflow, WorkflowResult};
    use serde_json::{json, Value};

    struct Greeting;

    impl Workflow for Greeting {
        const KIND: &'static str = "greeting";
        type Input = Value;
        type Output = Value;

        fn run(&self, ctx: &mut WorkflowContext, input: Value) -> WorkflowResult<Value> {
            let task: Handle = ctx.schedule_task("render", input)?;
            let text = ctx.wait(&task)?.into_value()?;
            Ok(json!({"text": text}))
        }
    }

    fn runner(store: Arc<InMemoryWorkflowEventStore>) -> WorkflowRunner {
        let mut workflows = WorkflowRegistry::new();
        workflows.register(Greeting);
        let mut tasks = TaskRegistry::new();
        tasks.register_fn("render", |_ctx, input| async move {
            Ok(json!(format!("hello {}", input["name"].as_str().unwrap_or("?"))))
        });
        WorkflowRunner::new(WorkflowEngine::new(store), workflows, tasks)
    }

    #[tokio::test]
    async fn test_resume_execute_resume() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let runner = runner(store.clone());
        let id = runner
            .engine()
            .start_workflow(NewWorkflow::new("greeting", json!({"name": "ada"})))
            .await
            .unwrap()
            .id();
        let scheduler = runner.engine().scheduler().clone();

        for _ in 0..3 {
            match scheduler.claim_next("w1", "default").await.unwrap() {
                Some(crate::scheduler::ClaimedWork::Workflow { claim, history }) => {
                    runner.resume(&claim, history).await.unwrap();
                }
                Some(crate::scheduler::ClaimedWork::Task(claim)) => {
                    runner
                        .execute_task(&claim, Duration::from_secs(1))
                        .await
                        .unwrap();
                }
                None => break,
            }
        }

        let state = runner.engine().project(id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.result, Some(json!({"text": "hello ada"})));
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_execution() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let runner = runner(store.clone());
        let id = runner
            .engine()
            .start_workflow(NewWorkflow::new("missing", json!({})))
            .await
            .unwrap()
            .id();
        let claim = store
            .claim_workflow("w1", "default", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let history = store.read_events(id, 1).await.unwrap();

        let outcome = runner.resume(&claim, history).await.unwrap();
        assert!(matches!(
            outcome,
            Resumption::Submitted(Submitted {
                status: WorkflowStatus::Failed,
                ..
            })
        ));
        let state = runner.engine().project(id).await.unwrap();
        assert_eq!(
            state.error.and_then(|e| e.code).as_deref(),
            Some(UNKNOWN_WORKFLOW_KIND)
        );
    }
}
