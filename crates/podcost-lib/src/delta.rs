//! Usage delta engine
//!
//! Turns cumulative CPU-seconds counters into average core rates, passes
//! memory gauges through, resolves every pod to its uid and folds the
//! results into hourly buckets.

use crate::identity::WorkloadIdentityCache;
use crate::models::{CounterSample, NodeSample, UsageMetric, UsageRecord, WorkloadKey};
use crate::observability::ScraperMetrics;
use crate::scheduler::ScrapeTarget;
use crate::source::NodeMetricsSource;
use crate::store::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Scrape target id for a node
pub fn node_target_id(node: &str) -> String {
    format!("node/{}", node)
}

/// Truncate a millisecond timestamp to the start of its UTC hour
pub fn truncate_to_hour(timestamp_ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)?
        .duration_trunc(Duration::hours(1))
        .ok()
}

#[derive(Debug, Default)]
struct DeltaState {
    prev_samples: HashMap<WorkloadKey, CounterSample>,
    prev_rates: HashMap<WorkloadKey, CounterSample>,
}

/// Counter-to-rate conversion for one node.
///
/// Keeps the previous sample set and the rates derived from it; the whole
/// state is swapped under one lock per poll.
#[derive(Debug, Default)]
pub struct UsageDeltaEngine {
    state: Mutex<DeltaState>,
}

impl UsageDeltaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute CPU core rates for `current` and remember it for the next poll.
    ///
    /// A key with no history yields nothing. An unchanged timestamp reuses the
    /// last rate. A counter or timestamp that went backwards yields nothing.
    pub fn cpu_rates(
        &self,
        current: &HashMap<WorkloadKey, CounterSample>,
    ) -> HashMap<WorkloadKey, CounterSample> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut rates = HashMap::with_capacity(current.len());

        for (key, sample) in current {
            let Some(prev) = state.prev_samples.get(key) else {
                continue;
            };

            if sample.timestamp_ms == prev.timestamp_ms {
                if let Some(rate) = state.prev_rates.get(key) {
                    rates.insert(key.clone(), *rate);
                }
                continue;
            }

            let delta_value = sample.value - prev.value;
            let delta_ms = sample.timestamp_ms - prev.timestamp_ms;
            if delta_value < 0.0 || delta_ms < 0 {
                debug!(workload = %key, delta_value, delta_ms, "Counter reset, skipping rate");
                continue;
            }

            let rate = delta_value / (delta_ms as f64 / 1000.0);
            rates.insert(key.clone(), CounterSample::new(rate, sample.timestamp_ms));
        }

        state.prev_samples = current.clone();
        state.prev_rates = rates.clone();
        rates
    }

    /// True once at least one sample set has been seen
    pub fn has_history(&self) -> bool {
        !self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .prev_samples
            .is_empty()
    }
}

/// Resolve keys to uids and bucket the values. Returns the records and the
/// number of keys that had no known uid.
pub fn to_usage_records(
    values: &HashMap<WorkloadKey, CounterSample>,
    identities: &WorkloadIdentityCache,
) -> (Vec<UsageRecord>, usize) {
    let mut records = Vec::with_capacity(values.len());
    let mut misses = 0;

    for (key, sample) in values {
        let Some(pod_uid) = identities.resolve(key) else {
            warn!(workload = %key, "Pod uid not known, dropping sample");
            misses += 1;
            continue;
        };
        let Some(bucket) = truncate_to_hour(sample.timestamp_ms) else {
            warn!(workload = %key, timestamp_ms = sample.timestamp_ms, "Sample timestamp out of range");
            continue;
        };
        records.push(UsageRecord {
            pod_uid,
            bucket,
            value: sample.value,
        });
    }

    // Stable statement order inside a batch
    records.sort_by(|a, b| {
        a.pod_uid
            .cmp(&b.pod_uid)
            .then_with(|| a.bucket.cmp(&b.bucket))
    });
    (records, misses)
}

/// Scrape target that polls one node and persists its usage
pub struct NodeScraper {
    node: String,
    source: Arc<dyn NodeMetricsSource>,
    store: Arc<dyn Store>,
    identities: Arc<WorkloadIdentityCache>,
    engine: UsageDeltaEngine,
    metrics: ScraperMetrics,
}

impl NodeScraper {
    pub fn new(
        node: impl Into<String>,
        source: Arc<dyn NodeMetricsSource>,
        store: Arc<dyn Store>,
        identities: Arc<WorkloadIdentityCache>,
    ) -> Self {
        Self {
            node: node.into(),
            source,
            store,
            identities,
            engine: UsageDeltaEngine::new(),
            metrics: ScraperMetrics::new(),
        }
    }

    async fn persist(
        &self,
        metric: UsageMetric,
        values: &HashMap<WorkloadKey, CounterSample>,
    ) -> Result<()> {
        let (records, misses) = to_usage_records(values, &self.identities);
        if misses > 0 {
            self.metrics.add_identity_misses(misses);
        }
        if records.is_empty() {
            return Ok(());
        }

        self.store
            .upsert_usage(metric, &records)
            .await
            .with_context(|| {
                format!("Failed to store {} usage for node {}", metric.as_str(), self.node)
            })?;
        self.metrics.add_usage_rows(metric.as_str(), records.len());
        debug!(node = %self.node, metric = metric.as_str(), rows = records.len(), "Usage stored");
        Ok(())
    }
}

#[async_trait]
impl ScrapeTarget for NodeScraper {
    async fn scrape(&self) -> Result<()> {
        let NodeSample { cpu, memory } = self
            .source
            .node_sample(&self.node)
            .await
            .with_context(|| format!("Failed to fetch resource metrics for node {}", self.node))?;

        let warmed_up = self.engine.has_history();
        let rates = self.engine.cpu_rates(&cpu);
        if !warmed_up {
            debug!(node = %self.node, pods = cpu.len(), "First CPU sample set, rates start with the next poll");
        }
        self.persist(UsageMetric::Cpu, &rates).await?;
        self.persist(UsageMetric::Memory, &memory).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use std::collections::VecDeque;

    /// Source that replays canned samples, one per call
    struct ReplaySource {
        samples: Mutex<VecDeque<Result<NodeSample>>>,
    }

    impl ReplaySource {
        fn new(samples: Vec<Result<NodeSample>>) -> Self {
            Self {
                samples: Mutex::new(samples.into()),
            }
        }
    }

    #[async_trait]
    impl NodeMetricsSource for ReplaySource {
        async fn node_sample(&self, _node: &str) -> Result<NodeSample> {
            self.samples
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(NodeSample::default()))
        }
    }

    // 2024-03-01T10:00:00Z
    const HOUR_MS: i64 = 1_709_287_200_000;

    fn key() -> WorkloadKey {
        WorkloadKey::new("shop", "web-0")
    }

    fn cpu_sample(value: f64, offset_ms: i64) -> NodeSample {
        let mut sample = NodeSample::default();
        sample
            .cpu
            .insert(key(), CounterSample::new(value, HOUR_MS + offset_ms));
        sample
    }

    fn single(value: f64, ts: i64) -> HashMap<WorkloadKey, CounterSample> {
        HashMap::from([(key(), CounterSample::new(value, ts))])
    }

    #[test]
    fn test_truncate_to_hour() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(truncate_to_hour(HOUR_MS), Some(expected));
        assert_eq!(truncate_to_hour(HOUR_MS + 3_599_999), Some(expected));
        assert_eq!(
            truncate_to_hour(HOUR_MS + 3_600_000),
            Some(expected + Duration::hours(1))
        );
    }

    #[test]
    fn test_first_sample_produces_no_rate() {
        let engine = UsageDeltaEngine::new();
        assert!(!engine.has_history());
        assert!(engine.cpu_rates(&single(10.0, 0)).is_empty());
        assert!(engine.has_history());
    }

    #[test]
    fn test_rate_is_delta_over_seconds() {
        let engine = UsageDeltaEngine::new();
        engine.cpu_rates(&single(10.0, 0));

        let rates = engine.cpu_rates(&single(13.0, 2_000));
        assert_eq!(rates[&key()], CounterSample::new(1.5, 2_000));

        // Sub-second spacing keeps its precision
        let rates = engine.cpu_rates(&single(13.25, 2_500));
        assert_eq!(rates[&key()].value, 0.5);
    }

    #[test]
    fn test_unchanged_timestamp_reuses_rate() {
        let engine = UsageDeltaEngine::new();
        engine.cpu_rates(&single(10.0, 0));
        engine.cpu_rates(&single(30.0, 1_000));

        let rates = engine.cpu_rates(&single(30.0, 1_000));
        assert_eq!(rates[&key()], CounterSample::new(20.0, 1_000));

        // Still reused on a second repeat
        let rates = engine.cpu_rates(&single(30.0, 1_000));
        assert_eq!(rates[&key()].value, 20.0);
    }

    #[test]
    fn test_unchanged_timestamp_without_rate_skips() {
        let engine = UsageDeltaEngine::new();
        engine.cpu_rates(&single(10.0, 0));
        assert!(engine.cpu_rates(&single(10.0, 0)).is_empty());
    }

    #[test]
    fn test_counter_reset_skips() {
        let engine = UsageDeltaEngine::new();
        engine.cpu_rates(&single(100.0, 0));
        assert!(engine.cpu_rates(&single(2.0, 1_000)).is_empty());

        // The reset sample becomes the new baseline
        let rates = engine.cpu_rates(&single(4.0, 2_000));
        assert_eq!(rates[&key()].value, 2.0);
    }

    #[test]
    fn test_timestamp_going_backwards_skips() {
        let engine = UsageDeltaEngine::new();
        engine.cpu_rates(&single(10.0, 5_000));
        assert!(engine.cpu_rates(&single(12.0, 4_000)).is_empty());
    }

    #[test]
    fn test_vanished_key_loses_history() {
        let engine = UsageDeltaEngine::new();
        engine.cpu_rates(&single(10.0, 0));
        engine.cpu_rates(&HashMap::new());
        assert!(engine.cpu_rates(&single(20.0, 1_000)).is_empty());
    }

    #[test]
    fn test_unknown_identity_dropped() {
        let identities = WorkloadIdentityCache::new();
        identities.store(WorkloadKey::new("shop", "known"), "uid-1");

        let values = HashMap::from([
            (WorkloadKey::new("shop", "known"), CounterSample::new(1.0, HOUR_MS)),
            (WorkloadKey::new("shop", "unknown"), CounterSample::new(2.0, HOUR_MS)),
        ]);
        let (records, misses) = to_usage_records(&values, &identities);

        assert_eq!(misses, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pod_uid, "uid-1");
        assert_eq!(records[0].bucket.timestamp_millis(), HOUR_MS);
    }

    fn scraper(samples: Vec<Result<NodeSample>>) -> (NodeScraper, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let identities = Arc::new(WorkloadIdentityCache::new());
        identities.store(key(), "uid-web-0");
        let scraper = NodeScraper::new(
            "node-a",
            Arc::new(ReplaySource::new(samples)),
            store.clone(),
            identities,
        );
        (scraper, store)
    }

    #[tokio::test]
    async fn test_rates_fold_into_hourly_bucket() {
        let (scraper, store) = scraper(vec![
            Ok(cpu_sample(10.0, 0)),
            Ok(cpu_sample(30.0, 1_000)),
            Ok(cpu_sample(30.0, 1_000)),
            Ok(cpu_sample(40.0, 2_000)),
        ]);
        let hour = truncate_to_hour(HOUR_MS).unwrap();

        scraper.scrape().await.unwrap();
        assert!(store.bucket("uid-web-0", hour).is_none());

        scraper.scrape().await.unwrap();
        let stats = store.bucket("uid-web-0", hour).unwrap().cpu_cores;
        assert_eq!((stats.min, stats.max, stats.avg()), (20.0, 20.0, 20.0));

        scraper.scrape().await.unwrap();
        let stats = store.bucket("uid-web-0", hour).unwrap().cpu_cores;
        assert_eq!((stats.min, stats.max, stats.avg()), (20.0, 20.0, 20.0));
        assert_eq!(stats.readings, 2);

        scraper.scrape().await.unwrap();
        let stats = store.bucket("uid-web-0", hour).unwrap().cpu_cores;
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 20.0);
        assert!((stats.avg() - 50.0 / 3.0).abs() < 1e-9);
        assert!(stats.min <= stats.avg() && stats.avg() <= stats.max);
    }

    #[tokio::test]
    async fn test_memory_passed_through() {
        let mut sample = NodeSample::default();
        sample
            .memory
            .insert(key(), CounterSample::new(4096.0, HOUR_MS + 10));
        let (scraper, store) = scraper(vec![Ok(sample)]);

        scraper.scrape().await.unwrap();

        let bucket = store
            .bucket("uid-web-0", truncate_to_hour(HOUR_MS).unwrap())
            .unwrap();
        assert_eq!(bucket.memory_bytes.max, 4096.0);
        assert_eq!(bucket.cpu_cores.readings, 0);
    }

    #[tokio::test]
    async fn test_source_failure_fails_poll_only() {
        let (scraper, store) = scraper(vec![
            Ok(cpu_sample(10.0, 0)),
            Err(anyhow::anyhow!("connection refused")),
            Ok(cpu_sample(12.0, 1_000)),
        ]);

        scraper.scrape().await.unwrap();
        let err = scraper.scrape().await.unwrap_err();
        assert!(format!("{:#}", err).contains("connection refused"));

        // History from before the failure is still used
        scraper.scrape().await.unwrap();
        let bucket = store
            .bucket("uid-web-0", truncate_to_hour(HOUR_MS).unwrap())
            .unwrap();
        assert_eq!(bucket.cpu_cores.max, 2.0);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let (scraper, store) = scraper(vec![Ok(cpu_sample(10.0, 0)), Ok(cpu_sample(12.0, 1_000))]);
        scraper.scrape().await.unwrap();

        store.set_fail_writes(true);
        assert!(scraper.scrape().await.is_err());
    }
}
