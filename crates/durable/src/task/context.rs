//! Task execution context

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (the worker stopped tracking this task)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// Task was cancelled
    #[error("task was cancelled")]
    Cancelled,
}

/// Context provided to task handlers during execution
///
/// Cancellation is cooperative: when the owning workflow is cancelled the
/// worker's heartbeat observes it and trips the token. Handlers that keep
/// running anyway have their result discarded.
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &TaskContext, input: Input) -> Result<Output, TaskError> {
///     for chunk in input.chunks() {
///         if ctx.is_cancelled() {
///             return Err(TaskError::non_retryable("cancelled"));
///         }
///         upload(chunk, ctx.idempotency_key()).await?;
///         ctx.heartbeat(Some(json!({"uploaded": chunk.index}))).await?;
///     }
///     Ok(Output { ... })
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,

    /// Owning workflow, `None` for standalone tasks
    pub workflow_id: Option<Uuid>,

    pub kind: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    idempotency_key: Option<String>,

    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,

    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(
        task_id: Uuid,
        workflow_id: Option<Uuid>,
        kind: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            task_id,
            workflow_id,
            kind: kind.into(),
            attempt,
            max_attempts,
            idempotency_key: None,
            heartbeat_tx: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Create a context with heartbeat support
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Key for guarding side effects against re-delivery
    ///
    /// Falls back to the task id when the scheduler supplied no key.
    pub fn idempotency_key(&self) -> String {
        self.idempotency_key
            .clone()
            .unwrap_or_else(|| self.task_id.to_string())
    }

    /// Token that is cancelled when the task should stop
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Record a heartbeat
    ///
    /// Extends the task's lease right away instead of waiting for the
    /// worker's next heartbeat tick.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(attempt: u32) -> TaskContext {
        TaskContext::new(Uuid::now_v7(), Some(Uuid::now_v7()), "upload", attempt, 3)
    }

    #[test]
    fn test_is_last_attempt() {
        assert!(ctx(3).is_last_attempt());
        assert!(!ctx(2).is_last_attempt());
    }

    #[test]
    fn test_idempotency_key_falls_back_to_task_id() {
        let context = ctx(1);
        assert_eq!(context.idempotency_key(), context.task_id.to_string());

        let context = ctx(1).with_idempotency_key(Some("upload-42".to_string()));
        assert_eq!(context.idempotency_key(), "upload-42");
    }

    #[tokio::test]
    async fn test_heartbeat_when_cancelled() {
        let context = ctx(1);
        context.cancellation_token().cancel();

        assert!(context.is_cancelled());
        let result = context.heartbeat(None).await;
        assert!(matches!(result, Err(HeartbeatError::Cancelled)));
    }

    #[tokio::test]
    async fn test_heartbeat_with_channel() {
        let (tx, mut rx) = mpsc::channel(10);
        let context = ctx(1).with_heartbeat(tx);

        context
            .heartbeat(Some(serde_json::json!({"progress": 50})))
            .await
            .unwrap();

        let payload = rx.recv().await.unwrap();
        assert!(payload.details.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let context = ctx(1);
        let token = context.cancellation_token();
        tokio::spawn(async move { token.cancel() });
        context.cancelled().await;
        assert!(context.is_cancelled());
    }
}
