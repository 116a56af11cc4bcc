//! # Durable Execution Engine
//!
//! An event-sourced workflow engine for long-running, crash-tolerant
//! business processes.
//!
//! ## Features
//!
//! - **Event-sourced executions**: every state change is an event in an
//!   append-only, sequence-checked log; current state is a pure projection
//! - **Replay**: workflow logic re-runs from the start on every resumption,
//!   with recorded commands fast-forwarded and divergence detected
//! - **Tasks with retries**: at-least-once task execution with leases,
//!   heartbeats and exponential backoff
//! - **Timers, promises and child workflows**, with timeouts
//! - **Cancellation** that cascades to children
//! - **Fair scheduling**: row-level claims that skip locked rows, with
//!   workflows and tasks interleaved
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                            │
//! │  (claims work, replays workflows, executes tasks)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowEngine                          │
//! │  (plans transitions with the state machine, commits them)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                        │
//! │  (PostgreSQL: executions, events, tasks, wakeups, promises) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use ledgerflow_durable::prelude::*;
//!
//! struct OrderWorkflow;
//!
//! impl Workflow for OrderWorkflow {
//!     const KIND: &'static str = "order";
//!     type Input = Order;
//!     type Output = Receipt;
//!
//!     fn run(&self, ctx: &mut WorkflowContext, order: Order) -> WorkflowResult<Receipt> {
//!         let charge = ctx.schedule_task("charge_card", &order)?;
//!         let payment: Payment = ctx.wait(&charge)?.into_typed()?;
//!         ctx.sleep("cooling-off", Duration::from_secs(3600))?;
//!         Ok(Receipt { payment })
//!     }
//! }
//! ```

pub mod config;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod replay;
pub mod scheduler;
pub mod task;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{EngineError, PromiseTarget, WorkflowEngine, WorkflowRegistry};
    pub use crate::persistence::{
        InMemoryWorkflowEventStore, NewWorkflow, PostgresWorkflowEventStore, StoreError,
        WorkflowEventStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::replay::{ChildOptions, Handle, Outcome, TaskOptions, WorkflowContext};
    pub use crate::task::{Task, TaskContext, TaskError, TaskRegistry};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        Workflow, WorkflowError, WorkflowEvent, WorkflowResult, WorkflowStatus,
    };
    pub use std::sync::Arc;
    pub use std::time::Duration;
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use engine::{EngineError, WorkflowEngine, WorkflowRegistry};
pub use persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError, WorkflowEventStore,
};
pub use reliability::RetryPolicy;
pub use replay::{Outcome, WorkflowContext};
pub use scheduler::Scheduler;
pub use task::{Task, TaskContext, TaskError};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{Workflow, WorkflowError, WorkflowEvent, WorkflowResult, WorkflowStatus};
