//! Claim loop for one queue
//!
//! [`Scheduler::claim_next`] already tries both work classes, so an empty
//! answer means the queue is idle as a whole. The poller then sleeps, the
//! delay growing with each consecutive empty claim, and claims again without
//! sleeping as long as it keeps finding work. Store errors that outlived the
//! scheduler's own retries park the poller at the longest delay.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::persistence::StoreError;
use crate::scheduler::{ClaimedWork, Scheduler};

/// Idle backoff between empty claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Delay after the first empty claim
    #[serde(with = "crate::config::duration_millis")]
    pub min_interval: Duration,

    /// Cap on the delay, also used after a store error
    #[serde(with = "crate::config::duration_millis")]
    pub max_interval: Duration,

    /// Growth per further empty claim
    pub backoff_multiplier: f64,

    /// Fraction of each delay shaved off at random, so workers started
    /// together do not poll in lockstep
    pub jitter: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            jitter: 0.2,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier (at least 1.0)
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set jitter, clamped to `0.0..=1.0`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

/// Claims work for one worker on one queue
pub struct WorkPoller {
    scheduler: Scheduler,
    worker_id: String,
    queue: String,
    config: PollerConfig,
    /// Consecutive claims that came back empty; `u32::MAX` after an error
    empty_claims: u32,
    shutdown: CancellationToken,
}

impl WorkPoller {
    pub fn new(
        scheduler: Scheduler,
        worker_id: impl Into<String>,
        queue: impl Into<String>,
        config: PollerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            worker_id: worker_id.into(),
            queue: queue.into(),
            config,
            empty_claims: 0,
            shutdown,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next piece of work
    ///
    /// `None` once shutdown is requested, including while sleeping.
    pub async fn next(&mut self) -> Option<ClaimedWork> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            match self.try_claim().await {
                Ok(Some(work)) => return Some(work),
                Ok(None) => {}
                Err(e) => warn!(queue = %self.queue, "Claim failed, backing off: {}", e),
            }

            let delay = self.jittered(self.delay());
            trace!(queue = %self.queue, delay_ms = delay.as_millis() as u64, "Queue idle");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => {
                    debug!(queue = %self.queue, "Shutdown requested while idle");
                    return None;
                }
            }
        }
    }

    /// Claim once and record the answer for [`delay`](Self::delay)
    #[instrument(skip(self), fields(worker_id = %self.worker_id, queue = %self.queue))]
    pub async fn try_claim(&mut self) -> Result<Option<ClaimedWork>, StoreError> {
        let claimed = self
            .scheduler
            .claim_next(&self.worker_id, &self.queue)
            .await;
        self.empty_claims = match &claimed {
            Ok(Some(_)) => 0,
            Ok(None) => self.empty_claims.saturating_add(1),
            Err(_) => u32::MAX,
        };
        claimed
    }

    /// Sleep owed before the next claim, before jitter
    pub fn delay(&self) -> Duration {
        match self.empty_claims {
            0 => Duration::ZERO,
            u32::MAX => self.config.max_interval,
            n => {
                let exponent = (n - 1).min(i32::MAX as u32) as i32;
                let secs = self.config.min_interval.as_secs_f64()
                    * self.config.backoff_multiplier.powi(exponent);
                Duration::from_secs_f64(secs.min(self.config.max_interval.as_secs_f64()))
            }
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let shave = rand::thread_rng().gen_range(0.0..=self.config.jitter);
        delay.mul_f64(1.0 - shave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::persistence::{InMemoryWorkflowEventStore, NewWorkflow, WorkflowEventStore};
    use serde_json::json;
    use std::sync::Arc;

    fn poller(store: Arc<InMemoryWorkflowEventStore>, shutdown: CancellationToken) -> WorkPoller {
        let scheduler = Scheduler::new(store, &EngineConfig::default());
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(10))
            .with_max_interval(Duration::from_millis(40))
            .with_backoff_multiplier(2.0)
            .with_jitter(0.0);
        WorkPoller::new(scheduler, "w1", "default", config, shutdown)
    }

    #[test]
    fn test_config_clamps() {
        let config = PollerConfig::new()
            .with_backoff_multiplier(0.5)
            .with_jitter(3.0);
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.jitter, 1.0);
    }

    #[tokio::test]
    async fn test_delay_grows_caps_and_resets() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut poller = poller(store.clone(), CancellationToken::new());
        assert_eq!(poller.delay(), Duration::ZERO);

        let mut delays = vec![];
        for _ in 0..4 {
            assert!(poller.try_claim().await.unwrap().is_none());
            delays.push(poller.delay().as_millis());
        }
        assert_eq!(delays, vec![10, 20, 40, 40]);

        store
            .create_workflow(NewWorkflow::new("order", json!({})))
            .await
            .unwrap();
        assert!(poller.try_claim().await.unwrap().is_some());
        assert_eq!(poller.delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_next_picks_up_work_created_while_idle() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut poller = poller(store.clone(), CancellationToken::new());

        let creator = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                store
                    .create_workflow(NewWorkflow::new("order", json!({})))
                    .await
                    .unwrap()
                    .id()
            })
        };
        let work = tokio::time::timeout(Duration::from_secs(2), poller.next())
            .await
            .unwrap();
        let Some(ClaimedWork::Workflow { claim, .. }) = work else {
            panic!("expected a workflow");
        };
        assert_eq!(claim.workflow.id, creator.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_idle_wait() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let shutdown = CancellationToken::new();
        let mut poller = poller(store.clone(), shutdown.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            shutdown.cancel();
        });
        let work = tokio::time::timeout(Duration::from_secs(2), poller.next())
            .await
            .unwrap();
        assert!(work.is_none());
        canceller.await.unwrap();

        // Nothing is claimed after shutdown even when work is waiting
        store
            .create_workflow(NewWorkflow::new("order", json!({})))
            .await
            .unwrap();
        assert!(poller.next().await.is_none());
    }
}
