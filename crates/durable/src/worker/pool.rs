//! Worker pool
//!
//! Runs claimed workflows and tasks concurrently, up to a slot limit, with
//! an optional maintenance loop and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, WorkPoller};
use super::runner::{Resumption, WorkflowRunner};
use crate::config::{env_millis, env_parse};
use crate::engine::{WorkflowEngine, WorkflowRegistry};
use crate::scheduler::ClaimedWork;
use crate::task::TaskRegistry;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Queues this worker polls
    pub queues: Vec<String>,

    /// Maximum concurrently running workflows and tasks
    pub max_concurrency: usize,

    pub poller: PollerConfig,

    /// How often running tasks extend their lease
    #[serde(with = "crate::config::duration_millis")]
    pub heartbeat_interval: Duration,

    /// Whether this worker also runs the maintenance sweeps
    pub run_maintenance: bool,

    #[serde(with = "crate::config::duration_millis")]
    pub maintenance_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "crate::config::duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            queues: vec!["default".to_string()],
            max_concurrency: 10,
            poller: PollerConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            run_maintenance: true,
            maintenance_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(queues: Vec<String>) -> Self {
        Self {
            queues,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WORKER_ID`: worker identity (default: generated)
    /// - `DURABLE_QUEUES`: comma-separated queues (default: "default")
    /// - `DURABLE_MAX_CONCURRENCY`: concurrent executions (default: 10)
    /// - `DURABLE_MAINTENANCE_INTERVAL_MS`: sweep interval (default: 1000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let queues = std::env::var("DURABLE_QUEUES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|queues| !queues.is_empty())
            .unwrap_or(defaults.queues.clone());

        Self {
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id.clone()),
            queues,
            max_concurrency: env_parse::<usize>("DURABLE_MAX_CONCURRENCY")
                .unwrap_or(defaults.max_concurrency)
                .max(1),
            maintenance_interval: env_millis("DURABLE_MAINTENANCE_INTERVAL_MS")
                .unwrap_or(defaults.maintenance_interval),
            ..defaults
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_maintenance(mut self, enabled: bool, interval: Duration) -> Self {
        self.run_maintenance = enabled;
        self.maintenance_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Running,
    /// Finishing in-flight work, not claiming new work
    Draining,
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out with {0} executions in flight")]
    ShutdownTimeout(usize),
}

enum PoolState {
    Stopped,
    Running {
        shutdown: CancellationToken,
        loops: Vec<JoinHandle<()>>,
    },
    Draining,
}

/// Worker pool executing workflows and tasks
///
/// Each queue gets a claim loop that only claims while a concurrency slot
/// is free, since a claim is a lease the worker must then honour. Claimed
/// work runs on the pool's task tracker; shutdown stops the loops and waits
/// for the tracker to empty.
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::prelude::*;
///
/// let mut workflows = WorkflowRegistry::new();
/// workflows.register(OrderWorkflow);
///
/// let mut tasks = TaskRegistry::new();
/// tasks.register(ChargeCard);
///
/// let pool = WorkerPool::new(engine, workflows, tasks, WorkerPoolConfig::from_env());
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    runner: WorkflowRunner,
    config: WorkerPoolConfig,
    slots: Arc<Semaphore>,
    in_flight: TaskTracker,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(
        engine: WorkflowEngine,
        workflows: WorkflowRegistry,
        tasks: TaskRegistry,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            runner: WorkflowRunner::new(engine, workflows, tasks),
            slots: Arc::new(Semaphore::new(config.max_concurrency)),
            in_flight: TaskTracker::new(),
            config,
            state: Mutex::new(PoolState::Stopped),
        }
    }

    /// Start a claim loop per configured queue
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        let mut state = self.state.lock();
        if !matches!(*state, PoolState::Stopped) {
            return Err(WorkerPoolError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        self.in_flight.reopen();
        let mut loops: Vec<_> = self
            .config
            .queues
            .iter()
            .map(|queue| self.spawn_claim_loop(queue, shutdown.child_token()))
            .collect();
        if self.config.run_maintenance {
            loops.push(self.spawn_maintenance_loop(shutdown.child_token()));
        }
        *state = PoolState::Running { shutdown, loops };

        info!(
            worker_id = %self.config.worker_id,
            queues = ?self.config.queues,
            max_concurrency = self.config.max_concurrency,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop claiming and wait for in-flight work
    ///
    /// Work still running at the timeout keeps running; its claims lapse
    /// and other workers pick it up after the sweep.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        let (shutdown, loops) = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, PoolState::Draining) {
                PoolState::Running { shutdown, loops } => (shutdown, loops),
                previous => {
                    *state = previous;
                    return Ok(());
                }
            }
        };

        info!(in_flight = self.in_flight.len(), "Draining worker pool");
        shutdown.cancel();
        for result in join_all(loops).await {
            if let Err(e) = result {
                warn!("Worker loop ended abnormally: {}", e);
            }
        }

        self.in_flight.close();
        let drained = tokio::time::timeout(self.config.shutdown_timeout, self.in_flight.wait())
            .await
            .is_ok();
        *self.state.lock() = PoolState::Stopped;

        if !drained {
            let remaining = self.in_flight.len();
            warn!(remaining, "Shutdown timeout reached");
            return Err(WorkerPoolError::ShutdownTimeout(remaining));
        }
        info!("Worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        match *self.state.lock() {
            PoolState::Stopped => WorkerPoolStatus::Stopped,
            PoolState::Running { .. } => WorkerPoolStatus::Running,
            PoolState::Draining => WorkerPoolStatus::Draining,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Workflows and tasks currently running
    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn engine(&self) -> &WorkflowEngine {
        self.runner.engine()
    }

    fn spawn_claim_loop(&self, queue: &str, shutdown: CancellationToken) -> JoinHandle<()> {
        let runner = self.runner.clone();
        let slots = Arc::clone(&self.slots);
        let in_flight = self.in_flight.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let mut poller = WorkPoller::new(
            runner.engine().scheduler().clone(),
            self.config.worker_id.clone(),
            queue,
            self.config.poller.clone(),
            shutdown.clone(),
        );

        tokio::spawn(async move {
            loop {
                let slot = tokio::select! {
                    slot = slots.clone().acquire_owned() => match slot {
                        Ok(slot) => slot,
                        Err(_) => break,
                    },
                    _ = shutdown.cancelled() => break,
                };
                let Some(work) = poller.next().await else {
                    break;
                };
                let runner = runner.clone();
                in_flight.spawn(async move {
                    run_claimed(&runner, work, heartbeat_interval).await;
                    drop(slot);
                });
            }
            debug!(queue = poller.queue(), "Claim loop exited");
        })
    }

    fn spawn_maintenance_loop(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = self.runner.engine().clone();
        let interval = self.config.maintenance_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                // A pass in progress finishes before shutdown is observed
                if let Err(e) = engine.run_maintenance(Utc::now()).await {
                    error!("Maintenance pass failed: {}", e);
                }
            }
            debug!("Maintenance loop exited");
        })
    }
}

async fn run_claimed(runner: &WorkflowRunner, work: ClaimedWork, heartbeat_interval: Duration) {
    match work {
        ClaimedWork::Workflow { claim, history } => {
            let workflow_id = claim.workflow.id;
            match runner.resume(&claim, history).await {
                Ok(Resumption::Submitted(submitted)) => {
                    debug!(%workflow_id, status = %submitted.status, "Resumption submitted")
                }
                Ok(other) => debug!(%workflow_id, ?other, "Resumption ended"),
                Err(e) => error!(%workflow_id, "Resumption failed: {}", e),
            }
        }
        ClaimedWork::Task(claim) => {
            // Outcomes are logged by the runner
            let _ = runner.execute_task(&claim, heartbeat_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryWorkflowEventStore;
    use crate::replay::{TaskOptions, WorkflowContext};
    use crate::workflow::{TaskStatus, Workflow, WorkflowResult, WorkflowStatus};
    use serde_json::{json, Value};

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new(vec!["billing".to_string()])
            .with_worker_id("billing-1")
            .with_max_concurrency(0)
            .with_heartbeat_interval(Duration::from_secs(2));

        assert_eq!(config.worker_id, "billing-1");
        assert_eq!(config.queues, vec!["billing"]);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
    }

    struct Double;

    impl Workflow for Double {
        const KIND: &'static str = "double";
        type Input = i64;
        type Output = i64;

        fn run(&self, ctx: &mut WorkflowContext, input: i64) -> WorkflowResult<i64> {
            let task = ctx.schedule_task("double", input)?;
            ctx.wait(&task)?.into_typed()
        }
    }

    #[tokio::test]
    async fn test_pool_runs_workflow_to_completion() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = WorkflowEngine::new(store);
        let mut workflows = WorkflowRegistry::new();
        workflows.register(Double);
        let mut tasks = TaskRegistry::new();
        tasks.register_fn("double", |_ctx, input: Value| async move {
            Ok(json!(input.as_i64().unwrap_or_default() * 2))
        });

        let config = WorkerPoolConfig::default()
            .with_worker_id("pool-test")
            .with_poller(
                PollerConfig::new()
                    .with_min_interval(Duration::from_millis(5))
                    .with_max_interval(Duration::from_millis(20)),
            )
            .with_maintenance(true, Duration::from_millis(20));
        let pool = WorkerPool::new(engine.clone(), workflows, tasks, config);
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(WorkerPoolError::AlreadyRunning)));

        let id = engine.start::<Double>(21).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while engine.project(id).await.unwrap().status != WorkflowStatus::Completed {
            assert!(tokio::time::Instant::now() < deadline, "workflow did not complete");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.result::<i64>(id).await.unwrap(), Some(42));

        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
        assert_eq!(pool.active_count(), 0);

        // A stopped pool can be started again
        pool.start().unwrap();
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_task() {
        let engine = WorkflowEngine::new(Arc::new(InMemoryWorkflowEventStore::new()));
        let mut tasks = TaskRegistry::new();
        tasks.register_fn("stuck", |_ctx, _input: Value| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        });
        let task_id = engine
            .submit_task("stuck", json!({}), TaskOptions::default())
            .await
            .unwrap()
            .id();

        let config = WorkerPoolConfig::default()
            .with_poller(PollerConfig::new().with_min_interval(Duration::from_millis(5)))
            .with_maintenance(false, Duration::from_secs(1))
            .with_shutdown_timeout(Duration::from_millis(50));
        let pool = WorkerPool::new(engine.clone(), WorkflowRegistry::new(), tasks, config);
        pool.start().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while pool.active_count() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "task was never claimed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.get_task(task_id).await.unwrap().status, TaskStatus::Running);

        let result = pool.shutdown().await;
        assert!(matches!(result, Err(WorkerPoolError::ShutdownTimeout(1))));
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
    }
}
