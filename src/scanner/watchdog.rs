use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::eyre::Result;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Liveness signal a long-running loop refreshes on every iteration
#[derive(Debug, Clone)]
pub struct Heartbeat {
    origin: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Heartbeat {
    pub fn beat(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    /// Time since the last beat
    pub fn age(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Keeps a job alive: restarts it when it exits or stops beating
pub struct Watchdog<F> {
    factory: F,
    heartbeat: Heartbeat,
    check_interval: Duration,
    stall_timeout: Duration,
    restart_delay: Duration,
    cancellation_token: CancellationToken,
}

impl<F, Fut> Watchdog<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(
        factory: F,
        heartbeat: Heartbeat,
        check_interval: Duration,
        stall_timeout: Duration,
        restart_delay: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            factory,
            heartbeat,
            check_interval,
            stall_timeout,
            restart_delay,
            cancellation_token,
        }
    }

    #[instrument(name = "watchdog", skip(self))]
    pub async fn run(self) -> Result<()> {
        let mut restarts = 0u64;

        loop {
            let child = self.cancellation_token.child_token();
            self.heartbeat.beat();
            let mut job = tokio::spawn((self.factory)(child.clone()));

            let mut ticker = interval(self.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => {
                        child.cancel();
                        if let Err(e) = job.await {
                            error!(error = %e, "job panicked on shutdown");
                        }
                        info!("closing");
                        return Ok(());
                    }

                    res = &mut job => {
                        match res {
                            Ok(Ok(())) => warn!("job exited"),
                            Ok(Err(e)) => error!(error = %e, "job failed"),
                            Err(e) => error!(error = %e, "job panicked"),
                        }
                        break;
                    }

                    _ = ticker.tick() => {
                        let age = self.heartbeat.age();
                        if age > self.stall_timeout {
                            warn!(?age, "job stalled");
                            child.cancel();
                            job.abort();
                            break;
                        }
                    }
                }
            }

            restarts += 1;
            info!(restarts, delay = ?self.restart_delay, "restarting job");

            tokio::select! {
                _ = self.cancellation_token.cancelled() => return Ok(()),
                _ = sleep(self.restart_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use color_eyre::eyre::eyre;

    use super::*;

    fn watchdog<F, Fut>(factory: F, heartbeat: Heartbeat, token: CancellationToken) -> Watchdog<F>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let ms = Duration::from_millis;
        Watchdog::new(factory, heartbeat, ms(10), ms(50), ms(5), token)
    }

    #[test]
    fn heartbeat_age_resets_on_beat() {
        let heartbeat = Heartbeat::default();
        std::thread::sleep(Duration::from_millis(20));
        assert!(heartbeat.age() >= Duration::from_millis(20));

        heartbeat.beat();
        assert!(heartbeat.age() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn failed_job_is_restarted() {
        let starts = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let counter = starts.clone();
        let dog = watchdog(
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(eyre!("boom"))
                }
            },
            Heartbeat::default(),
            token.clone(),
        );
        let run = tokio::spawn(dog.run());

        sleep(Duration::from_millis(100)).await;
        token.cancel();
        run.await.unwrap().unwrap();

        assert!(starts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn stalled_job_is_replaced() {
        let starts = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let counter = starts.clone();
        let dog = watchdog(
            move |token: CancellationToken| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // never beats
                    token.cancelled().await;
                    Ok(())
                }
            },
            Heartbeat::default(),
            token.clone(),
        );
        let run = tokio::spawn(dog.run());

        sleep(Duration::from_millis(200)).await;
        token.cancel();
        run.await.unwrap().unwrap();

        assert!(starts.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn beating_job_is_left_alone() {
        let starts = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let heartbeat = Heartbeat::default();

        let counter = starts.clone();
        let beat = heartbeat.clone();
        let dog = watchdog(
            move |token: CancellationToken| {
                let counter = counter.clone();
                let beat = beat.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    while !token.is_cancelled() {
                        beat.beat();
                        sleep(Duration::from_millis(5)).await;
                    }
                    Ok(())
                }
            },
            heartbeat,
            token.clone(),
        );
        let run = tokio::spawn(dog.run());

        sleep(Duration::from_millis(200)).await;
        token.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }
}
