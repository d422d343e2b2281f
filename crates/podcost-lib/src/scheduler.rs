//! Scrape scheduler
//!
//! Owns one independent polling task per target. Each task waits a random
//! share of its interval before the first poll so that many nodes added at
//! once do not hit the API server in lockstep, then polls on a fixed period
//! until it is cancelled.

use crate::health::{components, HealthRegistry};
use crate::observability::{ScraperMetrics, StructuredLogger};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Something the scheduler can poll on a schedule
#[async_trait]
pub trait ScrapeTarget: Send + Sync {
    /// Run one poll. Errors are logged by the scheduler and do not stop
    /// subsequent polls.
    async fn scrape(&self) -> Result<()>;
}

/// Bookkeeping for one running target task
struct TargetHandle {
    cancel: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

/// Targets whose last poll failed, mirrored into the scheduler health
/// component
#[derive(Clone, Default)]
struct PollReporter {
    failing: Arc<Mutex<BTreeSet<String>>>,
    health: Option<HealthRegistry>,
}

impl PollReporter {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.failing.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn record(&self, id: &str, succeeded: bool) {
        {
            let mut failing = self.lock();
            if succeeded {
                failing.remove(id);
            } else {
                failing.insert(id.to_string());
            }
        }
        self.publish().await;
    }

    async fn forget(&self, id: &str) {
        self.lock().remove(id);
        self.publish().await;
    }

    async fn publish(&self) {
        let Some(health) = &self.health else {
            return;
        };
        let failing: Vec<String> = self.lock().iter().cloned().collect();
        if failing.is_empty() {
            health.set_healthy(components::SCHEDULER).await;
        } else {
            health
                .set_degraded(
                    components::SCHEDULER,
                    format!("last poll failed for {}", failing.join(", ")),
                )
                .await;
        }
    }
}

/// Registry of running scrape targets
pub struct ScrapeScheduler {
    targets: Mutex<HashMap<String, TargetHandle>>,
    /// Skip the random initial delay (deterministic tests)
    disable_jitter: bool,
    metrics: ScraperMetrics,
    reporter: PollReporter,
    logger: StructuredLogger,
}

impl ScrapeScheduler {
    pub fn new(logger: StructuredLogger, disable_jitter: bool) -> Self {
        Self {
            targets: Mutex::new(HashMap::new()),
            disable_jitter,
            metrics: ScraperMetrics::new(),
            reporter: PollReporter::default(),
            logger,
        }
    }

    /// Report failing targets as a degraded scheduler component
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.reporter.health = Some(health);
        self
    }

    /// Register a target and start its polling task.
    ///
    /// Returns false without touching the existing task when `id` is
    /// already registered.
    pub fn add_target(
        &self,
        id: impl Into<String>,
        target: Arc<dyn ScrapeTarget>,
        interval: Duration,
    ) -> bool {
        let id = id.into();
        if interval.is_zero() {
            warn!(target_id = %id, "Refusing scrape target with zero interval");
            return false;
        }

        let mut targets = self.lock_targets();
        if targets.contains_key(&id) {
            debug!(target_id = %id, "Scrape target already registered");
            return false;
        }

        let jitter = if self.disable_jitter {
            Duration::ZERO
        } else {
            rand_jitter(interval)
        };

        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_target(
            id.clone(),
            target,
            interval,
            jitter,
            cancel_rx,
            self.metrics.clone(),
            self.reporter.clone(),
        ));

        targets.insert(
            id.clone(),
            TargetHandle {
                cancel,
                _task: task,
            },
        );
        self.metrics.set_active_targets(targets.len());
        drop(targets);

        self.logger.log_target_added(&id, interval.as_secs());
        true
    }

    /// Cancel and forget a target. An in-flight poll finishes first.
    pub fn remove_target(&self, id: &str) -> bool {
        let mut targets = self.lock_targets();
        let removed = targets.remove(id);
        self.metrics.set_active_targets(targets.len());
        drop(targets);

        match removed {
            Some(handle) => {
                let _ = handle.cancel.send(true);
                self.logger.log_target_removed(id);
                true
            }
            None => false,
        }
    }

    /// Ids of all registered targets, sorted
    pub fn targets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_targets().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock_targets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_targets().is_empty()
    }

    /// Cancel every target
    pub fn shutdown(&self) {
        let drained: Vec<(String, TargetHandle)> = self.lock_targets().drain().collect();
        self.metrics.set_active_targets(0);
        for (id, handle) in drained {
            let _ = handle.cancel.send(true);
            debug!(target_id = %id, "Scrape target cancelled on shutdown");
        }
    }

    fn lock_targets(&self) -> std::sync::MutexGuard<'_, HashMap<String, TargetHandle>> {
        self.targets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Polling task for one target, cleaning up its health and metric state
/// once cancelled
async fn run_target(
    id: String,
    target: Arc<dyn ScrapeTarget>,
    interval: Duration,
    jitter: Duration,
    mut cancel: watch::Receiver<bool>,
    metrics: ScraperMetrics,
    reporter: PollReporter,
) {
    poll_until_cancelled(
        &id,
        target.as_ref(),
        interval,
        jitter,
        &mut cancel,
        &metrics,
        &reporter,
    )
    .await;

    reporter.forget(&id).await;
    metrics.forget_target(&id);
}

async fn poll_until_cancelled(
    id: &str,
    target: &dyn ScrapeTarget,
    interval: Duration,
    jitter: Duration,
    cancel: &mut watch::Receiver<bool>,
    metrics: &ScraperMetrics,
    reporter: &PollReporter,
) {
    if !jitter.is_zero() {
        tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                debug!(target_id = %id, "Scrape target cancelled before first poll");
                return;
            }
            _ = tokio::time::sleep(jitter) => {}
        }
    }
    if *cancel.borrow() {
        return;
    }

    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    poll_once(id, target, metrics, reporter).await;

    loop {
        tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                debug!(target_id = %id, "Scrape target cancelled");
                break;
            }
            _ = ticker.tick() => {
                poll_once(id, target, metrics, reporter).await;
            }
        }
    }
}

async fn poll_once(
    id: &str,
    target: &dyn ScrapeTarget,
    metrics: &ScraperMetrics,
    reporter: &PollReporter,
) {
    let start = Instant::now();
    let result = target.scrape().await;
    metrics.observe_poll_latency(id, start.elapsed().as_secs_f64());

    if let Err(e) = &result {
        metrics.inc_poll_failures(id);
        let error = format!("{:#}", e);
        error!(target_id = %id, error = %error, "Scraping target failed");
    }
    reporter.record(id, result.is_ok()).await;
}

/// Resolves once the cancel flag is set or the scheduler dropped the sender
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Random delay in [0, interval)
fn rand_jitter(interval: Duration) -> Duration {
    let max_ms = interval.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}
