//! External promise settlement

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::executor::{EngineError, Plan, WorkflowEngine};
use super::machine::{plan_promise_settlement, PromisePlan};
use crate::replay::Outcome;
use crate::workflow::WorkflowError;

/// How an external caller names a promise
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromiseTarget {
    /// Global idempotency key given at creation
    Key(String),
    /// Name within one execution
    Named { workflow_id: Uuid, name: String },
}

impl From<&str> for PromiseTarget {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for PromiseTarget {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

/// Result of a resolve or reject call
///
/// Settlement is first-wins: a later call gets the original outcome back
/// with `newly_settled == false`.
#[derive(Debug, Clone, PartialEq)]
pub struct PromiseResolution {
    pub workflow_id: Uuid,
    pub promise_id: String,
    pub outcome: Outcome,
    pub newly_settled: bool,
}

impl WorkflowEngine {
    /// Resolve a promise with a value
    #[instrument(skip(self, target, value))]
    pub async fn resolve_promise(
        &self,
        target: impl Into<PromiseTarget>,
        value: Value,
    ) -> Result<PromiseResolution, EngineError> {
        self.settle_promise(target.into(), Outcome::Completed(value))
            .await
    }

    /// Reject a promise with an error
    #[instrument(skip(self, target, error))]
    pub async fn reject_promise(
        &self,
        target: impl Into<PromiseTarget>,
        error: WorkflowError,
    ) -> Result<PromiseResolution, EngineError> {
        self.settle_promise(target.into(), Outcome::Failed(error))
            .await
    }

    async fn settle_promise(
        &self,
        target: PromiseTarget,
        outcome: Outcome,
    ) -> Result<PromiseResolution, EngineError> {
        let (workflow_id, promise_id) = match target {
            PromiseTarget::Named { workflow_id, name } => (workflow_id, name),
            PromiseTarget::Key(key) => {
                let entry = self
                    .store_call("find_promise", || self.store.find_promise(&key))
                    .await?
                    .ok_or_else(|| EngineError::PromiseNotFound(key.clone()))?;
                (entry.workflow_id, entry.promise_id)
            }
        };

        let applied = self
            .apply(workflow_id, "settle_promise", |_, state| {
                if !state.promises.contains_key(&promise_id) {
                    return Err(EngineError::PromiseNotFound(promise_id.clone()));
                }
                match plan_promise_settlement(
                    state,
                    workflow_id,
                    &promise_id,
                    outcome.clone(),
                    Utc::now(),
                ) {
                    Ok(PromisePlan::Settled(existing)) => Ok(Plan::Done((existing, false))),
                    Ok(PromisePlan::Settle(transition, outcome)) => {
                        Ok(Plan::Commit(transition, (outcome, true)))
                    }
                    Err(e) => Err(EngineError::invalid(workflow_id, e)),
                }
            })
            .await?;

        let (outcome, newly_settled) = applied.value;
        debug!(%workflow_id, promise_id, newly_settled, "Promise settlement");
        self.drive(applied.follow_ups).await;
        Ok(PromiseResolution {
            workflow_id,
            promise_id,
            outcome,
            newly_settled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowEventStore, NewWorkflow, WorkflowEventStore};
    use crate::workflow::{PromiseStatus, WorkflowCommand, WorkflowStatus};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn waiting_on_approval(engine: &WorkflowEngine, store: &InMemoryWorkflowEventStore) -> Uuid {
        let id = engine
            .start_workflow(NewWorkflow::new("refund", json!({})))
            .await
            .unwrap()
            .id();
        store.claim_workflow("w1", "default", Duration::from_secs(30)).await.unwrap();
        engine
            .submit_commands(
                id,
                "w1",
                1,
                vec![WorkflowCommand::CreatePromise {
                    name: "approval".to_string(),
                    idempotency_key: Some(format!("approval-{id}")),
                    timeout_at: None,
                }],
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_first_settlement_wins() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = WorkflowEngine::new(store.clone());
        let id = waiting_on_approval(&engine, &store).await;

        let first = engine
            .resolve_promise(format!("approval-{id}"), json!({"approved": true}))
            .await
            .unwrap();
        assert!(first.newly_settled);
        assert_eq!(first.promise_id, "approval");

        let second = engine
            .reject_promise(
                PromiseTarget::Named {
                    workflow_id: id,
                    name: "approval".to_string(),
                },
                WorkflowError::new("too late"),
            )
            .await
            .unwrap();
        assert!(!second.newly_settled);
        assert_eq!(second.outcome, Outcome::Completed(json!({"approved": true})));

        let state = engine.project(id).await.unwrap();
        assert_eq!(state.promises["approval"].status, PromiseStatus::Resolved);
        assert_eq!(state.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_unknown_promise() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let engine = WorkflowEngine::new(store.clone());
        let id = waiting_on_approval(&engine, &store).await;

        let missing = engine.resolve_promise("nope", json!(null)).await;
        assert!(matches!(missing, Err(EngineError::PromiseNotFound(_))));

        let missing = engine
            .resolve_promise(
                PromiseTarget::Named {
                    workflow_id: id,
                    name: "other".to_string(),
                },
                json!(null),
            )
            .await;
        assert!(matches!(missing, Err(EngineError::PromiseNotFound(_))));
    }
}
