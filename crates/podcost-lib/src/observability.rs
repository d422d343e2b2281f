//! Observability infrastructure for the scraper
//!
//! Provides:
//! - Prometheus metrics (poll latency, failures, rows written, sweep results)
//! - Structured JSON lifecycle events with tracing

use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for poll and query latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ScraperMetricsInner> = OnceLock::new();

struct ScraperMetricsInner {
    poll_latency_seconds: HistogramVec,
    poll_failures: IntCounterVec,
    usage_rows_upserted: IntCounterVec,
    identity_misses: IntCounter,
    objects_upserted: IntCounterVec,
    objects_soft_deleted: IntCounterVec,
    active_targets: IntGauge,
    active_objects: IntGauge,
    query_latency_seconds: Histogram,
}

impl ScraperMetricsInner {
    fn new() -> Self {
        Self {
            poll_latency_seconds: register_histogram_vec!(
                "podcost_poll_latency_seconds",
                "Time spent polling one scrape target",
                &["target"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register poll_latency_seconds"),

            poll_failures: register_int_counter_vec!(
                "podcost_poll_failures_total",
                "Scrape polls that returned an error",
                &["target"]
            )
            .expect("Failed to register poll_failures"),

            usage_rows_upserted: register_int_counter_vec!(
                "podcost_usage_rows_upserted_total",
                "Values folded into hourly usage buckets",
                &["metric"]
            )
            .expect("Failed to register usage_rows_upserted"),

            identity_misses: register_int_counter!(
                "podcost_identity_misses_total",
                "Samples dropped because the pod uid was not known yet"
            )
            .expect("Failed to register identity_misses"),

            objects_upserted: register_int_counter_vec!(
                "podcost_objects_upserted_total",
                "Object snapshots written from watch notifications",
                &["kind"]
            )
            .expect("Failed to register objects_upserted"),

            objects_soft_deleted: register_int_counter_vec!(
                "podcost_objects_soft_deleted_total",
                "Object snapshots marked deleted",
                &["kind", "source"]
            )
            .expect("Failed to register objects_soft_deleted"),

            active_targets: register_int_gauge!(
                "podcost_active_scrape_targets",
                "Number of scrape targets with a running task"
            )
            .expect("Failed to register active_targets"),

            active_objects: register_int_gauge!(
                "podcost_active_objects",
                "Object snapshots without a deletion time, as of the last sweep"
            )
            .expect("Failed to register active_objects"),

            query_latency_seconds: register_histogram!(
                "podcost_query_latency_seconds",
                "Time spent executing aggregation queries",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register query_latency_seconds"),
        }
    }
}

/// Handle to the process-wide Prometheus metrics.
///
/// Clones share the same underlying collectors.
#[derive(Clone)]
pub struct ScraperMetrics {
    _private: (),
}

impl Default for ScraperMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScraperMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ScraperMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ScraperMetricsInner {
        GLOBAL_METRICS.get_or_init(ScraperMetricsInner::new)
    }

    pub fn observe_poll_latency(&self, target: &str, duration_secs: f64) {
        self.inner()
            .poll_latency_seconds
            .with_label_values(&[target])
            .observe(duration_secs);
    }

    pub fn inc_poll_failures(&self, target: &str) {
        self.inner().poll_failures.with_label_values(&[target]).inc();
    }

    pub fn add_usage_rows(&self, metric: &str, count: usize) {
        self.inner()
            .usage_rows_upserted
            .with_label_values(&[metric])
            .inc_by(count as u64);
    }

    pub fn add_identity_misses(&self, count: usize) {
        self.inner().identity_misses.inc_by(count as u64);
    }

    pub fn inc_objects_upserted(&self, kind: &str) {
        self.inner().objects_upserted.with_label_values(&[kind]).inc();
    }

    /// `source` is either "notification" or "sweep"
    pub fn add_objects_soft_deleted(&self, kind: &str, source: &str, count: u64) {
        self.inner()
            .objects_soft_deleted
            .with_label_values(&[kind, source])
            .inc_by(count);
    }

    pub fn set_active_targets(&self, count: usize) {
        self.inner().active_targets.set(count as i64);
    }

    pub fn set_active_objects(&self, count: i64) {
        self.inner().active_objects.set(count);
    }

    /// Drop the per-target series of a target that stopped polling
    pub fn forget_target(&self, target: &str) {
        let inner = self.inner();
        let _ = inner.poll_latency_seconds.remove_label_values(&[target]);
        let _ = inner.poll_failures.remove_label_values(&[target]);
    }

    pub fn observe_query_latency(&self, duration_secs: f64) {
        self.inner().query_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for lifecycle events.
///
/// Every event carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, kinds: usize) {
        info!(
            event = "agent_started",
            instance = %self.instance,
            version = %version,
            watched_kinds = kinds,
            "podcost agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            instance = %self.instance,
            reason = %reason,
            "podcost agent shutting down"
        );
    }

    pub fn log_target_added(&self, target: &str, interval_secs: u64) {
        info!(
            event = "target_added",
            instance = %self.instance,
            target_id = %target,
            interval_secs = interval_secs,
            "New scrape target added"
        );
    }

    pub fn log_target_removed(&self, target: &str) {
        info!(
            event = "target_removed",
            instance = %self.instance,
            target_id = %target,
            "Scrape target removed"
        );
    }

    pub fn log_sweep(&self, kind: &str, live: usize, soft_deleted: u64) {
        if soft_deleted > 0 {
            warn!(
                event = "sweep_completed",
                instance = %self.instance,
                kind = %kind,
                live = live,
                soft_deleted = soft_deleted,
                "Sweep removed objects missed by notifications"
            );
        } else {
            info!(
                event = "sweep_completed",
                instance = %self.instance,
                kind = %kind,
                live = live,
                soft_deleted = soft_deleted,
                "Sweep completed"
            );
        }
    }
}
