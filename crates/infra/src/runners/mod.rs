//! Background runners: snapshot pipeline, reconciliation guard, TTL sweeper.
//!
//! Every runner follows the same loop:
//!
//! - runs once on startup, then every `interval`
//! - `handle.trigger()` requests an extra run; triggers coalesce (capacity 1)
//! - a failed run is logged and retried with bounded exponential backoff, up
//!   to `max_retries` times, then the runner waits for the next tick
//! - `handle.shutdown()` stops the loop, also while it is backing off
//!
//! Failures never propagate out of a runner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::StoreResult;
use crate::metrics;

pub mod guard;
pub mod snapshot;
pub mod ttl;

pub use guard::{AlertSink, InMemoryAlertSink, ReconciliationAlert, ReconciliationGuard};
pub use snapshot::SnapshotPipeline;
pub use ttl::TtlSweeper;

/// One unit of periodic work.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_once(&self, now: DateTime<Utc>) -> StoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub interval: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
        }
    }
}

impl RunnerConfig {
    /// Retry policy from the engine config with the given cadence.
    pub fn from_engine(config: &EngineConfig, interval: Duration) -> Self {
        Self {
            interval,
            max_retries: config.runner_max_retries,
            base_backoff: config.runner_base_backoff,
        }
    }

    /// Spawns `job` on the current tokio runtime.
    pub fn spawn<J: Job>(&self, job: Arc<J>) -> RunnerHandle {
        let shutdown = Arc::new(Notify::new());
        let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);
        let name = job.name();

        let join = tokio::spawn(runner_loop(
            self.clone(),
            job,
            shutdown.clone(),
            trigger_rx,
        ));

        RunnerHandle {
            name,
            shutdown,
            trigger: trigger_tx,
            join,
        }
    }
}

/// Control handle of a spawned runner.
#[derive(Debug)]
pub struct RunnerHandle {
    name: &'static str,
    shutdown: Arc<Notify>,
    trigger: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl RunnerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Requests a run as soon as the current one (if any) finishes.
    pub fn trigger(&self) {
        // Full channel means a run is already pending.
        let _ = self.trigger.try_send(());
    }

    /// Stops the runner and waits for its task to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            warn!(runner = self.name, error = %e, "runner task ended abnormally");
        }
    }
}

async fn runner_loop<J: Job>(
    cfg: RunnerConfig,
    job: Arc<J>,
    shutdown: Arc<Notify>,
    mut trigger_rx: mpsc::Receiver<()>,
) {
    let name = job.name();
    info!(runner = name, interval_secs = cfg.interval.as_secs(), "runner started");

    let mut ticker = tokio::time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    'outer: loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {}
            Some(()) = trigger_rx.recv() => debug!(runner = name, "triggered run"),
        }

        let mut failures: u32 = 0;
        loop {
            match job.run_once(Utc::now()).await {
                Ok(()) => break,
                Err(e) => {
                    failures += 1;
                    metrics::record_runner_failure(name);
                    warn!(runner = name, attempt = failures, code = e.code(), error = %e, "run failed");
                    if failures > cfg.max_retries {
                        warn!(runner = name, "retry budget exhausted; waiting for next tick");
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = shutdown.notified() => break 'outer,
                        _ = tokio::time::sleep(backoff(cfg.base_backoff, failures)) => {}
                    }
                }
            }
        }
    }

    info!(runner = name, "runner stopped");
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    // base * 2^(attempt-1), capped.
    let pow = 1u32 << attempt.saturating_sub(1).min(10);
    let ms = base.as_millis().saturating_mul(pow as u128);
    Duration::from_millis(ms.min(10_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::StoreError;

    /// Fails the first `fail_first` runs.
    struct Counting {
        runs: AtomicU32,
        fail_first: u32,
        done: Notify,
    }

    #[async_trait]
    impl Job for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_once(&self, _now: DateTime<Utc>) -> StoreResult<()> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(StoreError::storage("boom"));
            }
            self.done.notify_one();
            Ok(())
        }
    }

    fn job(fail_first: u32) -> Arc<Counting> {
        Arc::new(Counting {
            runs: AtomicU32::new(0),
            fail_first,
            done: Notify::new(),
        })
    }

    fn fast() -> RunnerConfig {
        RunnerConfig {
            interval: Duration::from_secs(3600),
            max_retries: 3,
            base_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff(base, 1), Duration::from_millis(250));
        assert_eq!(backoff(base, 3), Duration::from_millis(1000));
        assert_eq!(backoff(base, 30), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn runs_on_startup_and_on_trigger() {
        let job = job(0);
        let handle = fast().spawn(job.clone());

        job.done.notified().await;
        handle.trigger();
        job.done.notified().await;

        handle.shutdown().await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_retried_with_backoff() {
        let job = job(2);
        let handle = fast().spawn(job.clone());

        job.done.notified().await;
        handle.shutdown().await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let job = job(u32::MAX);
        let handle = RunnerConfig {
            max_retries: 2,
            ..fast()
        }
        .spawn(job.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await;
        // One initial attempt plus two retries, then it waits for the hour tick.
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
    }
}
