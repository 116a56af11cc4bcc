//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for event logs, execution rows, the task
//!   queue and the timer/promise/child indexes
//! - [`InMemoryWorkflowEventStore`] for testing
//! - [`PostgresWorkflowEventStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use postgres::PostgresWorkflowEventStore;
pub use store::{
    ClaimCandidate, CommitBatch, CreateOutcome, HeartbeatResponse, NewTask, NewWorkflow,
    PromiseKey, StoreError, TaskClaim, TaskRecord, TaskSettlement, Wakeup, WakeupKey, WakeupKind,
    WorkKind, WorkflowClaim, WorkflowEventStore, WorkflowRecord,
};
