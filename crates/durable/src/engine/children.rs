//! Child workflow coordination
//!
//! Children are created in the same commit that records them in the
//! parent's log, keyed by (parent, idempotency key). When a child reaches a
//! terminal status its row is flagged until the outcome has been appended
//! to the parent; the flag survives crashes, so delivery is at least once
//! and the parent-side event is recorded exactly once.

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use super::executor::{EngineError, Plan, WorkflowEngine};
use super::machine::{plan_external_child, ChildPlan};
use crate::persistence::CreateOutcome;
use crate::replay::ChildOptions;
use crate::workflow::ChildEntry;

impl WorkflowEngine {
    /// Schedule a child of `parent_id` from outside the parent's logic
    ///
    /// With an idempotency key that is already used under the same parent,
    /// the existing child is returned.
    #[instrument(skip(self, input, options))]
    pub async fn schedule_child(
        &self,
        parent_id: Uuid,
        kind: &str,
        input: Value,
        options: ChildOptions,
    ) -> Result<CreateOutcome, EngineError> {
        let timeout_at = options.timeout.map(|timeout| {
            Utc::now()
                + chrono::Duration::from_std(timeout)
                    .unwrap_or_else(|_| chrono::Duration::days(36_500))
        });

        let applied = self
            .apply(parent_id, "schedule_child", |_, state| {
                let plan = plan_external_child(
                    state,
                    parent_id,
                    kind,
                    input.clone(),
                    options.idempotency_key.clone(),
                    options.queue.clone(),
                    timeout_at,
                    Utc::now(),
                )
                .map_err(|e| EngineError::invalid(parent_id, e))?;
                Ok(match plan {
                    ChildPlan::Existing(child_id) => Plan::Done(CreateOutcome::Existing(child_id)),
                    ChildPlan::Create(transition, child_id) => {
                        Plan::Commit(transition, CreateOutcome::Created(child_id))
                    }
                })
            })
            .await?;

        if let CreateOutcome::Created(child_id) = applied.value {
            info!(%parent_id, %child_id, kind, "Scheduled child workflow");
        }
        self.drive(applied.follow_ups).await;
        Ok(applied.value)
    }

    /// Children of an execution as recorded in its log
    pub async fn children(&self, parent_id: Uuid) -> Result<Vec<ChildEntry>, EngineError> {
        let state = self.project(parent_id).await?;
        let mut children: Vec<_> = state.children.into_values().collect();
        children.sort_by_key(|c| c.child_id);
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowEventStore, NewWorkflow, WorkflowEventStore};
    use crate::workflow::{ChildStatus, WorkflowCommand, WorkflowStatus};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_child_result_reaches_parent() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = WorkflowEngine::new(store.clone());
        let parent = engine
            .start_workflow(NewWorkflow::new("batch", json!({})))
            .await
            .unwrap()
            .id();

        let options = ChildOptions::default()
            .idempotency_key("shard-1")
            .queue("shards");
        let child = engine
            .schedule_child(parent, "shard", json!({"n": 1}), options.clone())
            .await
            .unwrap();
        let again = engine
            .schedule_child(parent, "shard", json!({"n": 1}), options)
            .await
            .unwrap();
        assert_eq!(again, CreateOutcome::Existing(child.id()));
        assert_eq!(store.children_of(parent).len(), 1);

        // Run the child to completion
        let claim = store
            .claim_workflow("w1", "shards", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.workflow.id, child.id());
        engine
            .submit_commands(
                child.id(),
                &claim.worker_id,
                1,
                vec![WorkflowCommand::Complete {
                    result: json!({"sum": 3}),
                }],
            )
            .await
            .unwrap();

        let children = engine.children(parent).await.unwrap();
        assert_eq!(children[0].status, ChildStatus::Completed);
        assert_eq!(children[0].result, Some(json!({"sum": 3})));
        assert!(!engine.get_workflow(child.id()).await.unwrap().parent_notify_pending);
        assert_eq!(engine.get_workflow(parent).await.unwrap().status, WorkflowStatus::Pending);
    }

    #[tokio::test]
    async fn test_terminal_parent_rejects_children() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = WorkflowEngine::new(store.clone());
        let parent = engine
            .start_workflow(NewWorkflow::new("batch", json!({})))
            .await
            .unwrap()
            .id();
        engine.request_cancellation(parent, "stop").await.unwrap();

        let result = engine
            .schedule_child(parent, "shard", json!({}), ChildOptions::default())
            .await;
        assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
    }
}
