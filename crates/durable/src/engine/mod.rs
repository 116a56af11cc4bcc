//! Workflow execution engine
//!
//! [`WorkflowEngine`] owns the write path: every change to an execution is
//! planned by the pure state machine in [`machine`] and committed to the
//! event store as one atomic, sequence-checked batch.

mod children;
mod executor;
pub mod machine;
mod maintenance;
mod promises;
mod registry;
mod tasks;
mod timers;

pub use executor::{EngineError, Submitted, WorkflowEngine};
pub use machine::{FollowUp, InvalidTransition, TaskResult, Transition};
pub use maintenance::MaintenanceReport;
pub use promises::{PromiseResolution, PromiseTarget};
pub use registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
pub use tasks::{ReclaimReport, TaskDisposition};
