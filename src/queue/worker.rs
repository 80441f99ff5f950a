use std::sync::Arc;
use std::time::Instant;

use color_eyre::eyre::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::{Broker, ClaimedTask, HandlerError, HandlerOutcome, Priority, Task, TaskHandler};
use crate::config::{PriorityWeights, QueueConfig};
use crate::scanner::Heartbeat;

/// Order in which priority classes are tried for one claim
///
/// Weighted shuffle: each class is drawn with probability proportional to
/// its weight among the classes not drawn yet, so urgent work usually goes
/// first while low priority work still gets its turn.
pub fn weighted_order(weights: &PriorityWeights, rng: &mut impl Rng) -> Vec<Priority> {
    let weight = |p: &Priority| match p {
        Priority::Critical => weights.critical,
        Priority::Urgent => weights.urgent,
        Priority::Normal => weights.normal,
        Priority::Low => weights.low,
    };

    let (mut left, zero): (Vec<_>, Vec<_>) = Priority::ALL.into_iter().partition(|p| weight(p) > 0);
    let mut order = Vec::with_capacity(Priority::ALL.len());

    while !left.is_empty() {
        let total: u32 = left.iter().map(weight).sum();
        let mut pick = rng.gen_range(0..total);
        let idx = left
            .iter()
            .position(|p| {
                let w = weight(p);
                if pick < w {
                    true
                } else {
                    pick -= w;
                    false
                }
            })
            .unwrap_or(0);
        order.push(left.remove(idx));
    }

    order.extend(zero);
    order
}

/// Pulls tasks from a [`Broker`] and runs them with bounded concurrency
pub struct WorkerPool<H> {
    broker: Arc<dyn Broker>,
    handler: Arc<H>,
    config: QueueConfig,
    heartbeat: Heartbeat,
    cancellation_token: CancellationToken,
}

impl<H: TaskHandler + 'static> WorkerPool<H> {
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<H>,
        config: QueueConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            broker,
            handler,
            config,
            heartbeat: Heartbeat::default(),
            cancellation_token,
        }
    }

    /// Beats `heartbeat` on every claim loop iteration
    pub fn with_heartbeat(self, heartbeat: Heartbeat) -> Self {
        Self { heartbeat, ..self }
    }

    #[instrument(name = "workers", skip(self), fields(concurrency = self.config.concurrency))]
    pub async fn run(self) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let tracker = TaskTracker::new();
        let mut rng = StdRng::from_entropy();
        let mut maintenance = interval(self.config.maintenance_interval());

        loop {
            self.heartbeat.beat();

            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,

                _ = maintenance.tick() => self.maintain().await,

                permit = semaphore.clone().acquire_owned() => {
                    let permit = permit?;
                    let order = weighted_order(&self.config.weights, &mut rng);

                    match self.broker.claim(&order).await {
                        Ok(Some(task)) => {
                            tracker.spawn(execute(
                                self.broker.clone(),
                                self.handler.clone(),
                                self.config.clone(),
                                task,
                                permit,
                            ));
                        }
                        Ok(None) => {
                            drop(permit);
                            sleep(self.config.poll_interval()).await;
                        }
                        Err(e) => {
                            drop(permit);
                            warn!(error = %e, "claim failed");
                            sleep(self.config.poll_interval()).await;
                        }
                    }
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("closing");

        Ok(())
    }

    async fn maintain(&self) {
        // a lease outlives the task timeout only if its worker died
        let stale = self.config.task_timeout() * 2;

        match self.broker.recover_stale(stale).await {
            Ok(0) => {}
            Ok(n) => warn!(recovered = n, "stale tasks returned to the queue"),
            Err(e) => warn!(error = %e, "stale task recovery failed"),
        }

        match self.broker.purge_expired().await {
            Ok(n) => debug!(purged = n),
            Err(e) => warn!(error = %e, "purge failed"),
        }
    }
}

#[instrument(skip_all, fields(id = claimed.id, kind = %claimed.kind, retried = claimed.retried))]
async fn execute<H: TaskHandler>(
    broker: Arc<dyn Broker>,
    handler: Arc<H>,
    config: QueueConfig,
    claimed: ClaimedTask,
    _permit: OwnedSemaphorePermit,
) {
    let started = Instant::now();

    let task = match Task::decode(&claimed.kind, claimed.payload.clone()) {
        Ok(task) => task,
        Err(e) => {
            error!(error = %e, "malformed payload");
            report(broker.archive(claimed.id, &e.to_string()).await);
            return;
        }
    };

    let result = match timeout(config.task_timeout(), handler.handle(task)).await {
        Ok(result) => result,
        Err(_) => Err(HandlerError::transient(color_eyre::eyre::eyre!(
            "timed out after {:?}",
            config.task_timeout()
        ))),
    };

    let elapsed = started.elapsed();
    match result {
        Ok(HandlerOutcome::Done) => {
            debug!(?elapsed, "done");
            report(broker.complete(claimed.id).await);
        }
        Ok(HandlerOutcome::Skipped(reason)) => {
            debug!(?elapsed, %reason, "skipped");
            report(broker.complete(claimed.id).await);
        }
        Err(HandlerError::Permanent(e)) => {
            error!(error = %e, "failed permanently");
            report(broker.archive(claimed.id, &e.to_string()).await);
        }
        Err(HandlerError::Transient(e)) if claimed.retried >= claimed.max_retry => {
            error!(error = %e, "retries exhausted");
            report(broker.archive(claimed.id, &e.to_string()).await);
        }
        Err(HandlerError::Transient(e)) => {
            let delay = config.backoff(claimed.retried);
            warn!(error = %e, ?delay, "will retry");
            report(broker.retry(claimed.id, delay, &e.to_string()).await);
        }
    }
}

fn report<E: std::fmt::Display>(result: std::result::Result<(), E>) {
    if let Err(e) = result {
        error!(error = %e, "could not record task result");
    }
}
