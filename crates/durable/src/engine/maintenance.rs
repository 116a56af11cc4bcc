//! Periodic sweeps
//!
//! Everything the engine does as a side effect of a commit (cascading a
//! cancellation, telling a parent about a finished child) is also done here
//! from durable state, so a crash between the commit and the side effect
//! only delays it.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::executor::{EngineError, WorkflowEngine};

/// Counts from one [`WorkflowEngine::run_maintenance`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub wakeups_fired: usize,
    pub tasks_requeued: usize,
    pub tasks_failed: usize,
    pub parents_notified: usize,
    pub cancellations_finalized: usize,
}

impl MaintenanceReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

impl WorkflowEngine {
    /// Run every sweep once
    #[instrument(skip(self))]
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, EngineError> {
        let wakeups_fired = self.fire_due_timers(now).await?;
        let reclaimed = self.reclaim_expired_tasks(now).await?;
        let parents_notified = self.deliver_parent_notifications().await?;
        let cancellations_finalized = self.repair_cancellations(now).await?;

        let report = MaintenanceReport {
            wakeups_fired,
            tasks_requeued: reclaimed.requeued,
            tasks_failed: reclaimed.failed + reclaimed.cancelled,
            parents_notified,
            cancellations_finalized,
        };
        if !report.is_idle() {
            info!(?report, "Maintenance pass");
        }
        Ok(report)
    }

    /// Append finished children's outcomes that never reached their parent
    pub async fn deliver_parent_notifications(&self) -> Result<usize, EngineError> {
        let pending = self
            .store_call("pending_parent_notifications", || {
                self.store
                    .pending_parent_notifications(self.config.sweep_batch_size)
            })
            .await?;

        let mut delivered = 0;
        for child in pending {
            match self.notify_parent_step(child.id).await {
                Ok(applied) => {
                    delivered += usize::from(applied.value);
                    self.drive(applied.follow_ups).await;
                }
                Err(e) => warn!(child_id = %child.id, "Failed to notify parent: {}", e),
            }
        }
        Ok(delivered)
    }

    /// Push cancelling executions forward
    ///
    /// Re-sends the cancellation to children that are still open, then
    /// finalizes executions that nothing holds open any more.
    pub async fn repair_cancellations(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let cancelling = self
            .store_call("cancelling_workflows", || {
                self.store.cancelling_workflows(self.config.sweep_batch_size)
            })
            .await?;

        let mut finalized = 0;
        for workflow_id in cancelling {
            match self.repair_cancellation(workflow_id, now).await {
                Ok(true) => finalized += 1,
                Ok(false) => {}
                Err(e) => warn!(%workflow_id, "Failed to repair cancellation: {}", e),
            }
        }
        Ok(finalized)
    }

    async fn repair_cancellation(&self, workflow_id: Uuid, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let (_, state) = self.load(workflow_id).await?;
        let reason = state
            .cancellation
            .as_ref()
            .map(|c| c.reason.clone())
            .unwrap_or_else(|| "cancelled".to_string());
        for child in state.open_children() {
            // Already cancelling children report `false`
            if self.request_cancellation(child.child_id, &reason).await? {
                debug!(%workflow_id, child_id = %child.child_id, "Re-sent cancellation to child");
            }
        }

        let applied = self.finalize_step(workflow_id, now).await?;
        self.drive(applied.follow_ups).await;
        Ok(applied.value)
    }
}
