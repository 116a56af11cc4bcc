//! Due timers, promise timeouts, child timeouts and cancellation deadlines

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::executor::{EngineError, Plan, WorkflowEngine};
use super::machine::plan_wakeup;
use crate::persistence::Wakeup;

impl WorkflowEngine {
    /// Fire everything in the wakeup index that is due at `now`
    ///
    /// Returns how many wakeups appended events. Entries whose target has
    /// already settled are dropped without an event.
    #[instrument(skip(self))]
    pub async fn fire_due_timers(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let due = self
            .store_call("due_wakeups", || {
                self.store.due_wakeups(now, self.config.sweep_batch_size)
            })
            .await?;

        let mut fired = 0;
        for wakeup in due {
            match self.fire(&wakeup, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(EngineError::WorkflowNotFound(id)) => {
                    warn!(workflow_id = %id, "Wakeup for missing workflow")
                }
                Err(e) => warn!(key = ?wakeup.key, "Failed to fire wakeup: {}", e),
            }
        }
        if fired > 0 {
            debug!(fired, "Fired due wakeups");
        }
        Ok(fired)
    }

    async fn fire(&self, wakeup: &Wakeup, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let applied = self
            .apply(wakeup.key.workflow_id, "fire_wakeup", |record, state| {
                let transition =
                    plan_wakeup(state, &wakeup.key, record.has_live_claim(now), now);
                if transition.events.is_empty() && transition.cleared_wakeups.is_empty() {
                    return Ok(Plan::Done(false));
                }
                let fired = !transition.events.is_empty();
                Ok(Plan::Commit(transition, fired))
            })
            .await?;
        if applied.value {
            debug!(
                workflow_id = %wakeup.key.workflow_id,
                kind = wakeup.key.kind.as_str(),
                target = %wakeup.key.target,
                "Wakeup fired"
            );
        }
        self.drive(applied.follow_ups).await;
        Ok(applied.value)
    }
}
