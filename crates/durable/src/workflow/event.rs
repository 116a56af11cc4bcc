//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkflowError;
use crate::task::TaskError;

/// Who issued the change recorded by an event
///
/// Only `Workflow` entries take part in determinism checks. `External`
/// covers the engine itself and outside callers (promise resolution,
/// coordinator-scheduled children, cancellation bookkeeping).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandOrigin {
    #[default]
    Workflow,
    External,
}

/// Events stored in the durable_workflow_events table
///
/// These events form the append-only log for a workflow execution. The
/// execution state is reconstructed by projecting them in sequence order.
/// Event types this build does not know deserialize into
/// [`WorkflowEvent::Unknown`] and are skipped by the projector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow execution was created
    WorkflowStarted {
        kind: String,
        version: u32,
        queue: String,
        input: serde_json::Value,
        #[serde(default)]
        parent_id: Option<Uuid>,
    },

    /// A worker began a resumption cycle
    WorkflowResumed { worker_id: String },

    /// The resumption ended with outstanding work
    WorkflowSuspended { outstanding: usize },

    /// Cancellation was requested; children receive the same request
    CancellationRequested {
        reason: String,
        #[serde(default)]
        deadline: Option<DateTime<Utc>>,
    },

    /// Workflow completed successfully
    WorkflowCompleted { result: serde_json::Value },

    /// Workflow failed with an error
    WorkflowFailed { error: WorkflowError },

    /// Workflow was cancelled
    WorkflowCancelled { reason: String },

    // =========================================================================
    // Task Events
    // =========================================================================
    /// Task was scheduled and enqueued
    TaskScheduled {
        task_id: Uuid,
        kind: String,
        queue: String,
        input: serde_json::Value,
        #[serde(default)]
        idempotency_key: Option<String>,
        max_retries: u32,
    },

    /// Task completed successfully
    TaskCompleted {
        task_id: Uuid,
        output: serde_json::Value,
        attempt: u32,
    },

    /// Task failed after its final attempt
    TaskFailed {
        task_id: Uuid,
        error: TaskError,
        attempt: u32,
    },

    /// Task was cancelled before it finished
    TaskCancelled { task_id: Uuid, reason: String },

    // =========================================================================
    // Timer Events
    // =========================================================================
    TimerStarted {
        timer_id: String,
        fire_at: DateTime<Utc>,
    },

    TimerFired { timer_id: String },

    TimerCancelled {
        timer_id: String,
        #[serde(default)]
        origin: CommandOrigin,
    },

    // =========================================================================
    // Promise Events
    // =========================================================================
    PromiseCreated {
        promise_id: String,
        #[serde(default)]
        idempotency_key: Option<String>,
        #[serde(default)]
        timeout_at: Option<DateTime<Utc>>,
    },

    PromiseResolved {
        promise_id: String,
        value: serde_json::Value,
        #[serde(default)]
        origin: CommandOrigin,
    },

    PromiseRejected {
        promise_id: String,
        error: WorkflowError,
        #[serde(default)]
        origin: CommandOrigin,
    },

    PromiseTimedOut { promise_id: String },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    /// Child execution was created and linked to this parent
    ChildWorkflowStarted {
        child_id: Uuid,
        kind: String,
        queue: String,
        input: serde_json::Value,
        idempotency_key: String,
        #[serde(default)]
        origin: CommandOrigin,
        #[serde(default)]
        timeout_at: Option<DateTime<Utc>>,
    },

    ChildWorkflowCompleted {
        child_id: Uuid,
        result: serde_json::Value,
    },

    ChildWorkflowFailed {
        child_id: Uuid,
        error: WorkflowError,
    },

    ChildWorkflowCancelled { child_id: Uuid, reason: String },

    ChildWorkflowTimedOut { child_id: Uuid },

    // =========================================================================
    // Workflow-local State
    // =========================================================================
    StateSet {
        key: String,
        value: serde_json::Value,
    },

    StateCleared { key: String },

    /// Any event type this build does not understand
    #[serde(other)]
    Unknown,
}

impl WorkflowEvent {
    /// Stable type name, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowResumed { .. } => "workflow_resumed",
            Self::WorkflowSuspended { .. } => "workflow_suspended",
            Self::CancellationRequested { .. } => "cancellation_requested",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
            Self::TaskScheduled { .. } => "task_scheduled",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCancelled { .. } => "timer_cancelled",
            Self::PromiseCreated { .. } => "promise_created",
            Self::PromiseResolved { .. } => "promise_resolved",
            Self::PromiseRejected { .. } => "promise_rejected",
            Self::PromiseTimedOut { .. } => "promise_timed_out",
            Self::ChildWorkflowStarted { .. } => "child_workflow_started",
            Self::ChildWorkflowCompleted { .. } => "child_workflow_completed",
            Self::ChildWorkflowFailed { .. } => "child_workflow_failed",
            Self::ChildWorkflowCancelled { .. } => "child_workflow_cancelled",
            Self::ChildWorkflowTimedOut { .. } => "child_workflow_timed_out",
            Self::StateSet { .. } => "state_set",
            Self::StateCleared { .. } => "state_cleared",
            Self::Unknown => "unknown",
        }
    }

    /// Check if this event ends the workflow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }
}

/// An event together with its position in the log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub workflow_id: Uuid,

    /// 1-based, gap-free position within the workflow's log
    pub sequence: i64,

    pub event: WorkflowEvent,

    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = WorkflowEvent::TaskScheduled {
            task_id: Uuid::nil(),
            kind: "charge_card".to_string(),
            queue: "payments".to_string(),
            input: serde_json::json!({"amount": 10}),
            idempotency_key: None,
            max_retries: 3,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_scheduled");
        assert_eq!(json["kind"], "charge_card");

        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_unknown_event_type_is_tolerated() {
        let json = serde_json::json!({"type": "search_attributes_upserted", "attrs": {"a": 1}});
        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, WorkflowEvent::Unknown);
    }

    #[test]
    fn test_origin_defaults_to_workflow() {
        let json = serde_json::json!({"type": "timer_cancelled", "timer_id": "t1"});
        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(
            parsed,
            WorkflowEvent::TimerCancelled {
                timer_id: "t1".to_string(),
                origin: CommandOrigin::Workflow,
            }
        );
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowEvent::WorkflowCompleted {
            result: serde_json::json!(null)
        }
        .is_terminal());
        assert!(WorkflowEvent::WorkflowCancelled {
            reason: "user".to_string()
        }
        .is_terminal());
        assert!(!WorkflowEvent::CancellationRequested {
            reason: "user".to_string(),
            deadline: None,
        }
        .is_terminal());
    }
}
