//! Kubernetes integration
//!
//! One watcher task per object kind turns watch events into
//! [`ObjectEvent`]s for the reconciler and keeps a local set of live uids
//! per kind that the sweeper lists from. Node resource metrics are read
//! through the API server's kubelet proxy.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Namespace, Node, PersistentVolumeClaim, Pod};
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::{Client, Resource, ResourceExt};
use podcost_lib::health::{components, HealthRegistry};
use podcost_lib::source::parse_resource_metrics;
use podcost_lib::{
    NodeMetricsSource, NodeSample, ObjectEvent, ObjectKind, ObjectLister, ObjectSnapshot,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay before re-opening a failed watch
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct KindCache {
    /// Set once the initial list completed
    synced: bool,
    uids: HashSet<String>,
}

/// Live uids per kind, fed by the watchers
#[derive(Debug, Default)]
pub struct WatchCache {
    kinds: RwLock<HashMap<ObjectKind, KindCache>>,
}

impl WatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn applied(&self, kind: ObjectKind, uid: &str) {
        let mut kinds = self.kinds.write().await;
        kinds.entry(kind).or_default().uids.insert(uid.to_string());
    }

    async fn deleted(&self, kind: ObjectKind, uid: &str) {
        if let Some(cache) = self.kinds.write().await.get_mut(&kind) {
            cache.uids.remove(uid);
        }
    }

    async fn restarted(&self, kind: ObjectKind, uids: HashSet<String>) {
        self.kinds
            .write()
            .await
            .insert(kind, KindCache { synced: true, uids });
    }
}

#[async_trait]
impl ObjectLister for WatchCache {
    /// Fails until the first full list for `kind` arrived, so a sweep never
    /// runs against a half-filled cache.
    async fn live_uids(&self, kind: ObjectKind) -> Result<HashSet<String>> {
        match self.kinds.read().await.get(&kind) {
            Some(cache) if cache.synced => Ok(cache.uids.clone()),
            _ => bail!("{} watch has not completed its initial list", kind),
        }
    }
}

fn to_snapshot<K: Serialize>(kind: ObjectKind, object: &K) -> Result<ObjectSnapshot> {
    let value = serde_json::to_value(object)
        .with_context(|| format!("Failed to serialize {} object", kind))?;
    ObjectSnapshot::from_object_json(kind, value)
}

/// Watches one kind cluster-wide until shutdown, re-opening the watch on errors
pub async fn watch_kind<K>(
    api: Api<K>,
    kind: ObjectKind,
    events: mpsc::Sender<ObjectEvent>,
    cache: Arc<WatchCache>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    info!(kind = %kind, "Starting watcher");

    loop {
        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        tokio::pin!(stream);

        loop {
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(Ok(event)) => {
                            let relisted = matches!(event, Event::Restarted(_));
                            if !forward(kind, event, &events, &cache).await {
                                info!(kind = %kind, "Reconciler gone, stopping watcher");
                                return;
                            }
                            if relisted {
                                health.set_healthy(components::WATCHER).await;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(kind = %kind, error = %e, "Watch error, will reconnect");
                            health.set_degraded(components::WATCHER, format!("{} watch failed: {}", kind, e)).await;
                            break;
                        }
                        None => {
                            info!(kind = %kind, "Watch stream ended, reconnecting");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(kind = %kind, "Shutting down watcher");
                    return;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
            _ = shutdown.recv() => return,
        }
    }
}

/// Returns false once the reconciler side of the channel is closed
async fn forward<K>(
    kind: ObjectKind,
    event: Event<K>,
    events: &mpsc::Sender<ObjectEvent>,
    cache: &WatchCache,
) -> bool
where
    K: Resource + Serialize,
{
    let notifications = match event {
        Event::Applied(object) => {
            if let Some(uid) = object.uid() {
                cache.applied(kind, &uid).await;
            }
            vec![to_snapshot(kind, &object).map(ObjectEvent::Applied)]
        }
        Event::Deleted(object) => {
            if let Some(uid) = object.uid() {
                cache.deleted(kind, &uid).await;
            }
            vec![to_snapshot(kind, &object).map(ObjectEvent::Deleted)]
        }
        Event::Restarted(objects) => {
            let uids = objects.iter().filter_map(|o| o.uid()).collect();
            cache.restarted(kind, uids).await;
            debug!(kind = %kind, count = objects.len(), "Watch relisted");
            objects
                .iter()
                .map(|o| to_snapshot(kind, o).map(ObjectEvent::Applied))
                .collect()
        }
    };

    for notification in notifications {
        match notification {
            Ok(event) => {
                if events.send(event).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(kind = %kind, error = %error, "Skipping unusable object");
            }
        }
    }
    true
}

/// Start one watcher per monitored kind
pub fn spawn_watchers(
    client: Client,
    events: mpsc::Sender<ObjectEvent>,
    cache: Arc<WatchCache>,
    health: HealthRegistry,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    macro_rules! spawn_kind {
        ($ty:ty, $kind:expr) => {
            tokio::spawn(watch_kind(
                Api::<$ty>::all(client.clone()),
                $kind,
                events.clone(),
                cache.clone(),
                health.clone(),
                shutdown.subscribe(),
            ))
        };
    }

    ObjectKind::ALL
        .iter()
        .map(|kind| match kind {
            ObjectKind::Pod => spawn_kind!(Pod, ObjectKind::Pod),
            ObjectKind::Node => spawn_kind!(Node, ObjectKind::Node),
            ObjectKind::Namespace => spawn_kind!(Namespace, ObjectKind::Namespace),
            ObjectKind::ReplicaSet => spawn_kind!(ReplicaSet, ObjectKind::ReplicaSet),
            ObjectKind::Deployment => spawn_kind!(Deployment, ObjectKind::Deployment),
            ObjectKind::StatefulSet => spawn_kind!(StatefulSet, ObjectKind::StatefulSet),
            ObjectKind::DaemonSet => spawn_kind!(DaemonSet, ObjectKind::DaemonSet),
            ObjectKind::Job => spawn_kind!(Job, ObjectKind::Job),
            ObjectKind::CronJob => spawn_kind!(CronJob, ObjectKind::CronJob),
            ObjectKind::PersistentVolumeClaim => {
                spawn_kind!(PersistentVolumeClaim, ObjectKind::PersistentVolumeClaim)
            }
        })
        .collect()
}

/// Reads `/metrics/resource` of a node through the API server proxy
#[derive(Clone)]
pub struct KubeletMetricsSource {
    client: Client,
}

impl KubeletMetricsSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeMetricsSource for KubeletMetricsSource {
    async fn node_sample(&self, node: &str) -> Result<NodeSample> {
        let request = http::Request::get(format!("/api/v1/nodes/{}/proxy/metrics/resource", node))
            .body(Vec::new())
            .context("Failed to build kubelet metrics request")?;
        let text = self
            .client
            .request_text(request)
            .await
            .with_context(|| format!("Kubelet metrics request for node {} failed", node))?;
        Ok(parse_resource_metrics(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(uid: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                name: Some(name.to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cache_not_listable_before_sync() {
        let cache = WatchCache::new();
        cache.applied(ObjectKind::Pod, "u1").await;
        assert!(cache.live_uids(ObjectKind::Pod).await.is_err());
        assert!(cache.live_uids(ObjectKind::Node).await.is_err());
    }

    #[tokio::test]
    async fn test_events_forwarded_and_cached() {
        let cache = WatchCache::new();
        let (tx, mut rx) = mpsc::channel(8);

        assert!(forward(ObjectKind::Pod, Event::Restarted(vec![pod("u1", "a")]), &tx, &cache).await);
        assert!(forward(ObjectKind::Pod, Event::Applied(pod("u2", "b")), &tx, &cache).await);
        assert!(forward(ObjectKind::Pod, Event::Deleted(pod("u1", "a")), &tx, &cache).await);

        let live = cache.live_uids(ObjectKind::Pod).await.unwrap();
        assert_eq!(live, HashSet::from(["u2".to_string()]));

        match rx.recv().await.unwrap() {
            ObjectEvent::Applied(snapshot) => {
                assert_eq!(snapshot.uid, "u1");
                assert_eq!(snapshot.namespace, "shop");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), ObjectEvent::Applied(s) if s.uid == "u2"));
        assert!(matches!(rx.recv().await.unwrap(), ObjectEvent::Deleted(s) if s.uid == "u1"));
    }

    #[tokio::test]
    async fn test_object_without_uid_skipped() {
        let cache = WatchCache::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut no_uid = pod("x", "a");
        no_uid.metadata.uid = None;

        assert!(forward(ObjectKind::Pod, Event::Applied(no_uid), &tx, &cache).await);
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_channel_stops_forwarding() {
        let cache = WatchCache::new();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!forward(ObjectKind::Pod, Event::Applied(pod("u1", "a")), &tx, &cache).await);
    }
}
