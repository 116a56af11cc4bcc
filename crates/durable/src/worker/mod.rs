//! Workers
//!
//! This module provides:
//! - [`WorkerPool`] - Polls queues and runs claimed work concurrently
//! - [`WorkflowRunner`] - Resumes one claimed workflow or executes one task
//! - [`WorkPoller`] - Claiming with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │ WorkPoller   │  │ WorkPoller   │  │   Maintenance    │  │
//! │  │ (queue a)    │  │ (queue b)    │  │ timers, leases,  │  │
//! │  └──────┬───────┘  └──────┬───────┘  │ cancellations    │  │
//! │         └────────┬────────┘          └──────────────────┘  │
//! │                  ▼                                         │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │        WorkflowRunner (Semaphore-limited)            │  │
//! │  │  replay + submit  |  execute task + heartbeat        │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod poller;
mod pool;
mod runner;

pub use poller::{PollerConfig, WorkPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use runner::{
    evaluate, Resumption, WorkflowRunner, INVALID_COMMAND, UNKNOWN_TASK_KIND,
    UNKNOWN_WORKFLOW_KIND,
};
