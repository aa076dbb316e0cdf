use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::pipeline::{JobOutcome, JobProcessor};
use crate::queue::JobQueue;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_id: String,
    pub interval: Duration,
    pub max_concurrent: usize,
    pub stale_after: Duration,
}

/// The Queue Monitor. Each tick sweeps stale jobs, then claims jobs up to the
/// concurrency budget and runs each one as its own task.
pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    processor: Arc<JobProcessor>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn JobQueue>, processor: Arc<JobProcessor>, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            queue,
            processor,
            config,
            permits,
        }
    }

    /// Ticks until `shutdown` flips (or its sender is dropped), then waits for
    /// in-flight jobs to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.config.worker_id,
            interval_secs = self.config.interval.as_secs(),
            max_concurrent = self.config.max_concurrent,
            "Queue monitor started"
        );

        let mut tasks = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&mut tasks).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(joined);
                }
                _ = shutdown.changed() => break,
            }
        }

        info!(in_flight = tasks.len(), "Queue monitor stopping; draining in-flight jobs");
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        info!("Queue monitor stopped");
    }

    /// One scheduler pass. Returns the number of jobs dispatched.
    pub async fn tick(&self, tasks: &mut JoinSet<JobOutcome>) -> usize {
        match self.queue.reclaim_stale(self.config.stale_after).await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                warn!(count = reclaimed.len(), "Reclaimed stale jobs");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Stale job sweep failed"),
        }

        let mut dispatched = 0;
        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!("No free worker slots");
                break;
            };

            let job = match self
                .queue
                .claim_next(&self.config.worker_id, self.config.max_concurrent as i64)
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Claiming next job failed");
                    break;
                }
            };

            let processor = self.processor.clone();
            let worker_id = self.config.worker_id.clone();
            tasks.spawn(async move {
                let _permit = permit;
                processor.process(&job, &worker_id).await
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!(dispatched, "Dispatched jobs");
        }
        dispatched
    }
}

fn log_join(joined: Result<JobOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => debug!(?outcome, "Job task finished"),
        Err(e) => error!(error = %e, "Job task panicked"),
    }
}
