//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::replay::{DeterminismViolation, WorkflowContext};
use crate::task::TaskError;

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,
}

impl WorkflowError {
    /// Error code attached to failures caused by replay divergence
    pub const DETERMINISM_VIOLATION: &'static str = "DETERMINISM_VIOLATION";

    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

impl From<TaskError> for WorkflowError {
    fn from(err: TaskError) -> Self {
        Self {
            message: err.message,
            code: err.error_type,
            retryable: err.retryable,
        }
    }
}

impl From<&DeterminismViolation> for WorkflowError {
    fn from(violation: &DeterminismViolation) -> Self {
        Self::new(violation.to_string()).with_code(Self::DETERMINISM_VIOLATION)
    }
}

/// Why a workflow run stopped before producing its output
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowInterrupt {
    /// Waiting on work that has not finished yet
    Suspended,

    /// The workflow decided to fail
    Failed(WorkflowError),

    /// The workflow asked for its own cancellation
    Cancelled(String),

    /// Replay diverged from the recorded history
    Nondeterminism(DeterminismViolation),
}

impl From<WorkflowError> for WorkflowInterrupt {
    fn from(err: WorkflowError) -> Self {
        Self::Failed(err)
    }
}

impl From<serde_json::Error> for WorkflowInterrupt {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(WorkflowError::new(err.to_string()).with_code("SERIALIZATION"))
    }
}

impl From<DeterminismViolation> for WorkflowInterrupt {
    fn from(violation: DeterminismViolation) -> Self {
        Self::Nondeterminism(violation)
    }
}

/// Result of running workflow logic
pub type WorkflowResult<T> = Result<T, WorkflowInterrupt>;

/// A workflow is a deterministic, replay-driven computation
///
/// Every resumption runs [`Workflow::run`] from the beginning. Commands that
/// were already recorded are fast-forwarded by the [`WorkflowContext`], so
/// side effects happen once. Waiting on unfinished work returns
/// [`WorkflowInterrupt::Suspended`], which the `?` operator carries out of
/// `run`.
///
/// `run` takes `&self`: workflow logic must be a function of its input and
/// the history exposed through the context.
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::prelude::*;
///
/// struct OrderWorkflow;
///
/// impl Workflow for OrderWorkflow {
///     const KIND: &'static str = "order";
///     type Input = OrderInput;
///     type Output = OrderOutput;
///
///     fn run(&self, ctx: &mut WorkflowContext, input: OrderInput) -> WorkflowResult<OrderOutput> {
///         let charge = ctx.schedule_task("charge_card", json!({"order": input.id}))?;
///         let receipt = ctx.wait(&charge)?.into_value()?;
///         Ok(OrderOutput { receipt })
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique kind identifier, used to look up the workflow in the registry
    const KIND: &'static str;

    /// Version recorded in the start event
    const VERSION: u32 = 1;

    /// Input type for the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the workflow
    type Output: Serialize + DeserializeOwned + Send;

    /// Run the workflow logic against the replay context
    fn run(&self, ctx: &mut WorkflowContext, input: Self::Input) -> WorkflowResult<Self::Output>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_from_task_error() {
        let task_error = TaskError::non_retryable("card declined").with_type("DECLINED");
        let error = WorkflowError::from(task_error);

        assert_eq!(error.message, "card declined");
        assert_eq!(error.code.as_deref(), Some("DECLINED"));
        assert!(!error.retryable);
    }

    #[test]
    fn test_interrupt_from_error() {
        let interrupt: WorkflowInterrupt = WorkflowError::new("boom").into();
        assert!(matches!(interrupt, WorkflowInterrupt::Failed(e) if e.message == "boom"));
    }
}
