//! Replay of workflow logic against recorded history
//!
//! - [`WorkflowContext`] fast-forwards recorded commands and collects new ones
//! - [`DeterminismValidator`] detects a run diverging from its history

mod context;
mod validator;

pub use context::{ChildOptions, Handle, Outcome, TaskOptions, WorkflowContext};
pub use validator::{DeterminismValidator, DeterminismViolation, ViolationKind};
