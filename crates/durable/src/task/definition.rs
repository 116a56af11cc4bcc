//! Task handler traits and registry

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::TaskContext;

/// Error type for task failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the task immediately, without
    /// using the remaining attempts.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    /// Error type recorded when a lease runs out on the final attempt
    pub const LEASE_EXPIRED: &'static str = "LEASE_EXPIRED";

    /// Error type recorded when a claim is released on the final attempt
    pub const RELEASED: &'static str = "RELEASED";

    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(err.to_string()).with_type("SERIALIZATION")
    }
}

/// Capability to execute one kind of task
///
/// Handlers receive raw JSON; [`TypedTask`] adapts a [`Task`] to this
/// interface. Delivery is at-least-once: a handler may run again for the
/// same task after a lease expiry, and should use
/// [`TaskContext::idempotency_key`] to guard external side effects.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn execute(
        &self,
        ctx: &TaskContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError>;
}

/// A strongly typed task
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::prelude::*;
///
/// struct SendEmail;
///
/// #[async_trait]
/// impl Task for SendEmail {
///     const KIND: &'static str = "send_email";
///     type Input = SendEmailInput;
///     type Output = SendEmailOutput;
///
///     async fn execute(
///         &self,
///         ctx: &TaskContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, TaskError> {
///         // Send email...
///         Ok(SendEmailOutput { message_id: "..." })
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Kind identifier, used to look up the handler in the registry
    const KIND: &'static str;

    type Input: Serialize + DeserializeOwned + Send;

    type Output: Serialize + DeserializeOwned + Send;

    /// Return `TaskError::retryable()` for transient failures and
    /// `TaskError::non_retryable()` for permanent ones.
    async fn execute(&self, ctx: &TaskContext, input: Self::Input)
        -> Result<Self::Output, TaskError>;
}

/// Adapter exposing a [`Task`] as a [`TaskHandler`]
pub struct TypedTask<T: Task> {
    task: T,
}

impl<T: Task> TypedTask<T> {
    pub fn new(task: T) -> Self {
        Self { task }
    }
}

#[async_trait]
impl<T: Task> TaskHandler for TypedTask<T> {
    async fn execute(
        &self,
        ctx: &TaskContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        let input: T::Input = serde_json::from_value(input)?;
        let output = self.task.execute(ctx, input).await?;
        Ok(serde_json::to_value(output)?)
    }
}

type BoxedTaskFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, TaskError>> + Send>>;

/// Handler built from an async closure
struct FnTask<F> {
    f: F,
}

#[async_trait]
impl<F> TaskHandler for FnTask<F>
where
    F: Fn(TaskContext, serde_json::Value) -> BoxedTaskFuture + Send + Sync + 'static,
{
    async fn execute(
        &self,
        ctx: &TaskContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        (self.f)(ctx.clone(), input).await
    }
}

/// Registry mapping task kinds to handlers
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed task under its kind
    pub fn register<T: Task>(&mut self, task: T) {
        self.handlers
            .insert(T::KIND.to_string(), Arc::new(TypedTask::new(task)));
    }

    /// Register a raw handler for a kind
    pub fn register_handler(&mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Register an async closure for a kind
    pub fn register_fn<F, Fut>(&mut self, kind: impl Into<String>, f: F)
    where
        F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
    {
        let f = move |ctx: TaskContext, input: serde_json::Value| -> BoxedTaskFuture {
            Box::pin(f(ctx, input))
        };
        self.handlers.insert(kind.into(), Arc::new(FnTask { f }));
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    struct Doubler;

    #[async_trait]
    impl Task for Doubler {
        const KIND: &'static str = "double";
        type Input = i64;
        type Output = i64;

        async fn execute(&self, _ctx: &TaskContext, input: i64) -> Result<i64, TaskError> {
            Ok(input * 2)
        }
    }

    fn ctx() -> TaskContext {
        TaskContext::new(Uuid::now_v7(), None, "double", 1, 3)
    }

    #[test]
    fn test_task_error_retryable() {
        let error = TaskError::retryable("timeout");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "timeout");
    }

    #[test]
    fn test_task_error_with_type() {
        let error = TaskError::non_retryable("connection failed").with_type("CONNECTION_ERROR");

        assert!(!error.retryable);
        assert_eq!(error.error_type, Some("CONNECTION_ERROR".to_string()));
    }

    #[test]
    fn test_task_error_serialization() {
        let error = TaskError::retryable("test error")
            .with_type("TEST")
            .with_details(json!({"key": "value"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: TaskError = serde_json::from_str(&json).unwrap();

        assert_eq!(error, parsed);
    }

    #[tokio::test]
    async fn test_typed_task_through_registry() {
        let mut registry = TaskRegistry::new();
        registry.register(Doubler);

        let handler = registry.get("double").unwrap();
        let output = handler.execute(&ctx(), json!(21)).await.unwrap();
        assert_eq!(output, json!(42));
    }

    #[tokio::test]
    async fn test_typed_task_rejects_bad_input() {
        let handler = TypedTask::new(Doubler);
        let err = handler.execute(&ctx(), json!("nope")).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("SERIALIZATION"));
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let mut registry = TaskRegistry::new();
        registry.register_fn("echo", |_ctx, input| async move { Ok(input) });

        assert!(registry.contains("echo"));
        assert_eq!(registry.len(), 1);
        let output = registry
            .get("echo")
            .unwrap()
            .execute(&ctx(), json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(output, json!({"a": 1}));
    }
}
