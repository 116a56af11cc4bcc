//! Commands issued by workflow logic

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WorkflowError;

/// Commands a workflow can issue during a resumption
///
/// A resumption submits its new commands as one atomic batch. Each
/// non-terminal command becomes exactly one event in the workflow's log,
/// which is what lets replay line commands up with recorded history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowCommand {
    /// Schedule a task on a queue (defaults to the workflow's queue)
    ScheduleTask {
        kind: String,
        #[serde(default)]
        queue: Option<String>,
        input: serde_json::Value,
        #[serde(default)]
        idempotency_key: Option<String>,
        #[serde(default)]
        max_retries: Option<u32>,
    },

    StartTimer {
        id: String,
        fire_at: DateTime<Utc>,
    },

    CancelTimer { id: String },

    CreatePromise {
        name: String,
        #[serde(default)]
        idempotency_key: Option<String>,
        #[serde(default)]
        timeout_at: Option<DateTime<Utc>>,
    },

    /// Resolve one of this execution's own promises, by name or key
    ResolvePromise {
        id_or_key: String,
        value: serde_json::Value,
    },

    RejectPromise {
        id_or_key: String,
        error: WorkflowError,
    },

    ScheduleChildWorkflow {
        kind: String,
        input: serde_json::Value,
        #[serde(default)]
        idempotency_key: Option<String>,
        #[serde(default)]
        queue: Option<String>,
        #[serde(default)]
        timeout_at: Option<DateTime<Utc>>,
    },

    SetState {
        key: String,
        value: serde_json::Value,
    },

    ClearState { key: String },

    Complete { result: serde_json::Value },

    Fail { error: WorkflowError },

    RequestCancellation { reason: String },
}

impl WorkflowCommand {
    /// Terminal commands end the batch and the execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Fail { .. } | Self::RequestCancellation { .. }
        )
    }

    /// Identifying signature used for replay matching
    ///
    /// Terminal commands have no signature: they are never replayed.
    pub fn signature(&self) -> Option<CommandSignature> {
        let (kind, name) = match self {
            Self::ScheduleTask { kind, .. } => (CommandKind::ScheduleTask, kind),
            Self::StartTimer { id, .. } => (CommandKind::StartTimer, id),
            Self::CancelTimer { id } => (CommandKind::CancelTimer, id),
            Self::CreatePromise { name, .. } => (CommandKind::CreatePromise, name),
            Self::ResolvePromise { id_or_key, .. } => (CommandKind::ResolvePromise, id_or_key),
            Self::RejectPromise { id_or_key, .. } => (CommandKind::RejectPromise, id_or_key),
            Self::ScheduleChildWorkflow { kind, .. } => (CommandKind::ScheduleChildWorkflow, kind),
            Self::SetState { key, .. } => (CommandKind::SetState, key),
            Self::ClearState { key } => (CommandKind::ClearState, key),
            Self::Complete { .. } | Self::Fail { .. } | Self::RequestCancellation { .. } => {
                return None
            }
        };
        Some(CommandSignature::new(kind, name.clone()))
    }
}

/// Kinds of replayable commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ScheduleTask,
    StartTimer,
    CancelTimer,
    CreatePromise,
    ResolvePromise,
    RejectPromise,
    ScheduleChildWorkflow,
    SetState,
    ClearState,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduleTask => "schedule_task",
            Self::StartTimer => "start_timer",
            Self::CancelTimer => "cancel_timer",
            Self::CreatePromise => "create_promise",
            Self::ResolvePromise => "resolve_promise",
            Self::RejectPromise => "reject_promise",
            Self::ScheduleChildWorkflow => "schedule_child_workflow",
            Self::SetState => "set_state",
            Self::ClearState => "clear_state",
        }
    }
}

/// Kind plus identifying field of a command
///
/// The identifying field is the task kind, timer id, promise name, child
/// kind or state key, depending on the command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandSignature {
    pub kind: CommandKind,
    pub name: String,
}

impl CommandSignature {
    pub fn new(kind: CommandKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for CommandSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind.as_str(), self.name)
    }
}
