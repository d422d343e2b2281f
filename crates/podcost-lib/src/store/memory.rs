use super::Store;
use crate::models::{
    HourlyUsageBucket, ObjectKind, ObjectSnapshot, PodRecord, StoredObject, SweptObject,
    UsageMetric, UsageRecord,
};
use crate::query::{BuiltQuery, Cell};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryState {
    buckets: BTreeMap<(String, DateTime<Utc>), HourlyUsageBucket>,
    objects: HashMap<String, StoredObject>,
    pods: HashMap<String, PodRecord>,
    executed: Vec<BuiltQuery>,
    query_rows: Vec<Vec<Cell>>,
    fail_writes: bool,
}

/// In-process [`Store`].
///
/// Queries are recorded rather than interpreted; tests preload the rows
/// they should return with [`MemoryStore::set_query_rows`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_writable(state: &MemoryState) -> Result<()> {
        if state.fail_writes {
            bail!("store unavailable");
        }
        Ok(())
    }

    /// Make every write and query fail until switched back
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn set_query_rows(&self, rows: Vec<Vec<Cell>>) {
        self.lock().query_rows = rows;
    }

    pub fn executed_queries(&self) -> Vec<BuiltQuery> {
        self.lock().executed.clone()
    }

    pub fn bucket(&self, pod_uid: &str, timestamp: DateTime<Utc>) -> Option<HourlyUsageBucket> {
        self.lock()
            .buckets
            .get(&(pod_uid.to_string(), timestamp))
            .cloned()
    }

    /// All buckets ordered by pod uid then hour
    pub fn buckets(&self) -> Vec<HourlyUsageBucket> {
        self.lock().buckets.values().cloned().collect()
    }

    pub fn object(&self, uid: &str) -> Option<StoredObject> {
        self.lock().objects.get(uid).cloned()
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn pod(&self, uid: &str) -> Option<PodRecord> {
        self.lock().pods.get(uid).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_usage(&self, metric: UsageMetric, records: &[UsageRecord]) -> Result<()> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        for record in records {
            state
                .buckets
                .entry((record.pod_uid.clone(), record.bucket))
                .or_insert_with(|| HourlyUsageBucket::new(record.pod_uid.clone(), record.bucket))
                .stats_mut(metric)
                .fold(record.value);
        }
        Ok(())
    }

    async fn upsert_object(&self, snapshot: &ObjectSnapshot) -> Result<()> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        state
            .objects
            .entry(snapshot.uid.clone())
            .and_modify(|stored| stored.snapshot = snapshot.clone())
            .or_insert_with(|| StoredObject {
                snapshot: snapshot.clone(),
                deleted_at: None,
            });
        Ok(())
    }

    async fn upsert_pod(&self, pod: &PodRecord) -> Result<()> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        let deleted_at = state
            .pods
            .get(&pod.uid)
            .and_then(|stored| stored.deleted_at)
            .or(pod.deleted_at);
        state.pods.insert(
            pod.uid.clone(),
            PodRecord {
                deleted_at,
                ..pod.clone()
            },
        );
        Ok(())
    }

    async fn soft_delete_object(&self, uid: &str) -> Result<bool> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        match state.objects.get_mut(uid) {
            Some(stored) if stored.is_live() => {
                stored.deleted_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn soft_delete_missing(
        &self,
        kind: ObjectKind,
        live_uids: &HashSet<String>,
    ) -> Result<Vec<SweptObject>> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        let now = Utc::now();
        let mut swept = Vec::new();
        for stored in state.objects.values_mut() {
            if stored.snapshot.kind == kind
                && stored.is_live()
                && !live_uids.contains(&stored.snapshot.uid)
            {
                stored.deleted_at = Some(now);
                swept.push(SweptObject {
                    kind,
                    uid: stored.snapshot.uid.clone(),
                    namespace: stored.snapshot.namespace.clone(),
                    name: stored.snapshot.name.clone(),
                });
            }
        }
        swept.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(swept)
    }

    async fn active_object_count(&self) -> Result<i64> {
        Ok(self.lock().objects.values().filter(|o| o.is_live()).count() as i64)
    }

    async fn run_query(&self, query: &BuiltQuery) -> Result<Vec<Vec<Cell>>> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        state.executed.push(query.clone());
        Ok(state.query_rows.clone())
    }

    async fn ping(&self) -> Result<()> {
        Self::check_writable(&self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObjectKind;
    use chrono::TimeZone;
    use serde_json::json;

    fn snapshot(kind: ObjectKind, uid: &str, name: &str) -> ObjectSnapshot {
        ObjectSnapshot::from_object_json(
            kind,
            json!({"metadata": {"uid": uid, "name": name, "namespace": "default"}}),
        )
        .unwrap()
    }

    fn hour() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn record(uid: &str, value: f64) -> UsageRecord {
        UsageRecord {
            pod_uid: uid.to_string(),
            bucket: hour(),
            value,
        }
    }

    #[tokio::test]
    async fn test_usage_metrics_fold_independently() {
        let store = MemoryStore::new();
        store
            .upsert_usage(UsageMetric::Cpu, &[record("p1", 0.5)])
            .await
            .unwrap();
        store
            .upsert_usage(UsageMetric::Memory, &[record("p1", 1024.0)])
            .await
            .unwrap();
        store
            .upsert_usage(UsageMetric::Memory, &[record("p1", 2048.0)])
            .await
            .unwrap();

        let bucket = store.bucket("p1", hour()).unwrap();
        assert_eq!(bucket.cpu_cores.readings, 1);
        assert_eq!(bucket.memory_bytes.readings, 2);
        assert_eq!(bucket.memory_bytes.min, 1024.0);
        assert_eq!(bucket.memory_bytes.max, 2048.0);
    }

    #[tokio::test]
    async fn test_min_avg_max_hold_after_every_upsert() {
        use rand::rngs::StdRng;
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut values: Vec<f64> = (0..200).map(|i| (i % 37) as f64 * 0.25).collect();
        values.extend([0.0, 0.0, 9.0, 9.0, 4.5]);
        values.shuffle(&mut StdRng::seed_from_u64(7));

        let store = MemoryStore::new();
        let mut seen_min = f64::MAX;
        let mut seen_max = f64::MIN;
        for value in &values {
            store
                .upsert_usage(UsageMetric::Cpu, &[record("p1", *value)])
                .await
                .unwrap();
            seen_min = seen_min.min(*value);
            seen_max = seen_max.max(*value);

            let stats = store.bucket("p1", hour()).unwrap().cpu_cores;
            assert!(stats.min <= stats.avg() + 1e-9, "{:?}", stats);
            assert!(stats.avg() <= stats.max + 1e-9, "{:?}", stats);
            assert_eq!(stats.min, seen_min);
            assert_eq!(stats.max, seen_max);
        }

        let stats = store.bucket("p1", hour()).unwrap().cpu_cores;
        assert_eq!(stats.readings as usize, values.len());
        assert!((stats.total - values.iter().sum::<f64>()).abs() < 1e-6);
    }

    fn pod_record(uid: &str, deleted_at: Option<DateTime<Utc>>) -> PodRecord {
        PodRecord {
            uid: uid.to_string(),
            namespace: "default".to_string(),
            name: "web-0".to_string(),
            node_name: "node-a".to_string(),
            controller: None,
            request_cpu_cores: 0.5,
            request_memory_bytes: 1024.0,
            labels: json!({}),
            created_at: None,
            started_at: None,
            deleted_at,
        }
    }

    #[tokio::test]
    async fn test_pod_keeps_first_deletion_time() {
        let store = MemoryStore::new();
        let first = hour();
        let later = hour() + chrono::Duration::minutes(5);

        store.upsert_pod(&pod_record("u1", None)).await.unwrap();
        store.upsert_pod(&pod_record("u1", Some(first))).await.unwrap();
        store.upsert_pod(&pod_record("u1", Some(later))).await.unwrap();
        assert_eq!(store.pod("u1").unwrap().deleted_at, Some(first));

        // A late update without a deletion time does not clear it
        store.upsert_pod(&pod_record("u1", None)).await.unwrap();
        let pod = store.pod("u1").unwrap();
        assert_eq!(pod.deleted_at, Some(first));
        assert_eq!(pod.node_name, "node-a");
    }

    #[tokio::test]
    async fn test_soft_deleted_object_stays_deleted_on_upsert() {
        let store = MemoryStore::new();
        let pod = snapshot(ObjectKind::Pod, "u1", "web-0");

        store.upsert_object(&pod).await.unwrap();
        assert!(store.soft_delete_object("u1").await.unwrap());
        assert!(!store.soft_delete_object("u1").await.unwrap());

        store.upsert_object(&pod).await.unwrap();
        assert!(!store.object("u1").unwrap().is_live());
        assert_eq!(store.active_object_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_same_name_new_uid_is_separate_row() {
        let store = MemoryStore::new();
        store
            .upsert_object(&snapshot(ObjectKind::Pod, "u1", "web-0"))
            .await
            .unwrap();
        store.soft_delete_object("u1").await.unwrap();
        store
            .upsert_object(&snapshot(ObjectKind::Pod, "u2", "web-0"))
            .await
            .unwrap();

        assert_eq!(store.objects().len(), 2);
        assert_eq!(store.active_object_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_soft_delete_missing_scoped_to_kind() {
        let store = MemoryStore::new();
        store
            .upsert_object(&snapshot(ObjectKind::Pod, "p1", "a"))
            .await
            .unwrap();
        store
            .upsert_object(&snapshot(ObjectKind::Pod, "p2", "b"))
            .await
            .unwrap();
        store
            .upsert_object(&snapshot(ObjectKind::Node, "n1", "node-a"))
            .await
            .unwrap();

        let live: HashSet<String> = ["p1".to_string()].into_iter().collect();
        let deleted = store
            .soft_delete_missing(ObjectKind::Pod, &live)
            .await
            .unwrap();

        assert_eq!(
            deleted,
            vec![SweptObject {
                kind: ObjectKind::Pod,
                uid: "p2".to_string(),
                namespace: "default".to_string(),
                name: "b".to_string(),
            }]
        );
        assert!(!store.object("p2").unwrap().is_live());
        assert!(store.object("n1").unwrap().is_live());
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.ping().await.is_err());
        assert!(store
            .upsert_usage(UsageMetric::Cpu, &[record("p1", 1.0)])
            .await
            .is_err());
        assert!(store.buckets().is_empty());
    }
}
