//! Workflow registry for kind-based dispatch
//!
//! The registry maps workflow kinds to type-erased workflow capabilities, so
//! a worker can replay any registered workflow from its stored kind and JSON
//! input without knowing the concrete type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::replay::WorkflowContext;
use crate::workflow::{Workflow, WorkflowResult};

/// Type-erased workflow interface
///
/// Input and output cross this boundary as JSON.
pub trait AnyWorkflow: Send + Sync {
    fn kind(&self) -> &'static str;

    fn version(&self) -> u32;

    /// Decode the input, run the workflow and encode its output
    fn run_json(&self, ctx: &mut WorkflowContext, input: Value) -> WorkflowResult<Value>;
}

struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn kind(&self) -> &'static str {
        W::KIND
    }

    fn version(&self) -> u32 {
        W::VERSION
    }

    fn run_json(&self, ctx: &mut WorkflowContext, input: Value) -> WorkflowResult<Value> {
        let input: W::Input = serde_json::from_value(input)?;
        let output = self.inner.run(ctx, input)?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Registry of workflow capabilities by kind
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn AnyWorkflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under its [`Workflow::KIND`]
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register(OrderWorkflow);
    /// ```
    pub fn register<W: Workflow>(&mut self, workflow: W) {
        self.workflows.insert(
            W::KIND.to_string(),
            Arc::new(WorkflowWrapper { inner: workflow }),
        );
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.workflows.contains_key(kind)
    }

    /// Look up the workflow registered for a kind
    pub fn get(&self, kind: &str) -> Result<Arc<dyn AnyWorkflow>, RegistryError> {
        self.workflows
            .get(kind)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflowKind(kind.to_string()))
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("kinds", &self.workflows.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow kind: {0}")]
    UnknownWorkflowKind(String),
}
