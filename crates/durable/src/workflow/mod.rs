//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining replay-driven workflow logic
//! - [`WorkflowCommand`] enum for commands issued during a resumption
//! - [`WorkflowEvent`] enum for persisted events
//! - [`ExecutionState`] and [`project`] for rebuilding state from events

mod command;
mod definition;
mod event;
mod state;
mod status;

pub use command::{CommandKind, CommandSignature, WorkflowCommand};
pub use definition::{Workflow, WorkflowError, WorkflowInterrupt, WorkflowResult};
pub use event::{CommandOrigin, EventEnvelope, WorkflowEvent};
pub use state::{
    project, CancellationInfo, ChildEntry, ExecutionState, PromiseEntry, RecordedCommand,
    RecordedTarget, TaskEntry, TimerEntry,
};
pub use status::{
    ChildStatus, ParseStatusError, PromiseStatus, TaskStatus, TimerStatus, WorkflowStatus,
};
