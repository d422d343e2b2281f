//! Object lifecycle reconciler
//!
//! Mirrors cluster objects into the snapshot table from watch
//! notifications, keeps the pod identity cache and node scrape targets in
//! step with them, and periodically sweeps rows whose delete notification
//! was missed.

use crate::delta::{node_target_id, NodeScraper};
use crate::health::{components, HealthRegistry};
use crate::identity::WorkloadIdentityCache;
use crate::models::{ObjectEvent, ObjectKind, ObjectSnapshot, WorkloadKey};
use crate::observability::{ScraperMetrics, StructuredLogger};
use crate::pod::pod_record;
use crate::scheduler::ScrapeScheduler;
use crate::source::NodeMetricsSource;
use crate::store::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Current live uids per kind, as seen by the watch layer's local cache
#[async_trait]
pub trait ObjectLister: Send + Sync {
    async fn live_uids(&self, kind: ObjectKind) -> Result<HashSet<String>>;
}

/// What a node notification needs to start polling that node
struct NodeScraping {
    scheduler: Arc<ScrapeScheduler>,
    source: Arc<dyn NodeMetricsSource>,
    interval: Duration,
}

/// Applies add/update/delete notifications to the store
pub struct ObjectReconciler {
    store: Arc<dyn Store>,
    identities: Arc<WorkloadIdentityCache>,
    nodes: Option<NodeScraping>,
    metrics: ScraperMetrics,
}

impl ObjectReconciler {
    pub fn new(store: Arc<dyn Store>, identities: Arc<WorkloadIdentityCache>) -> Self {
        Self {
            store,
            identities,
            nodes: None,
            metrics: ScraperMetrics::new(),
        }
    }

    /// Register a scrape target for every node that appears
    pub fn with_node_scraping(
        mut self,
        scheduler: Arc<ScrapeScheduler>,
        source: Arc<dyn NodeMetricsSource>,
        interval: Duration,
    ) -> Self {
        self.nodes = Some(NodeScraping {
            scheduler,
            source,
            interval,
        });
        self
    }

    /// Apply one notification
    pub async fn handle(&self, event: ObjectEvent) -> Result<()> {
        match event {
            ObjectEvent::Applied(snapshot) => self.apply(&snapshot).await,
            ObjectEvent::Deleted(snapshot) => self.delete(&snapshot).await,
        }
    }

    async fn apply(&self, snapshot: &ObjectSnapshot) -> Result<()> {
        if snapshot.kind == ObjectKind::Pod {
            // Before any write so the next scrape can attribute samples
            self.identities
                .store(snapshot.workload_key(), snapshot.uid.clone());
        }

        self.store.upsert_object(snapshot).await?;
        self.metrics.inc_objects_upserted(snapshot.kind.as_str());

        match snapshot.kind {
            ObjectKind::Pod => {
                let record = pod_record(snapshot)?;
                self.store.upsert_pod(&record).await?;
            }
            ObjectKind::Node => self.add_node(&snapshot.name),
            _ => {}
        }

        debug!(kind = %snapshot.kind, uid = %snapshot.uid, name = %snapshot.name, "Object applied");
        Ok(())
    }

    async fn delete(&self, snapshot: &ObjectSnapshot) -> Result<()> {
        self.release(snapshot.kind, &snapshot.uid, &snapshot.workload_key());

        let projected = match snapshot.kind {
            // Final state carries the deletion timestamp the cost view needs
            ObjectKind::Pod => self.upsert_final_pod(snapshot).await,
            _ => Ok(()),
        };

        if self.store.soft_delete_object(&snapshot.uid).await? {
            self.metrics
                .add_objects_soft_deleted(snapshot.kind.as_str(), "notification", 1);
        }
        debug!(kind = %snapshot.kind, uid = %snapshot.uid, name = %snapshot.name, "Object deleted");
        projected
    }

    async fn upsert_final_pod(&self, snapshot: &ObjectSnapshot) -> Result<()> {
        let record = pod_record(snapshot)?;
        self.store.upsert_pod(&record).await
    }

    /// Drop in-memory state tied to an object that left the cluster: the
    /// identity entry of a pod or the scrape target of a node
    pub fn release(&self, kind: ObjectKind, uid: &str, key: &WorkloadKey) {
        match kind {
            ObjectKind::Pod => {
                self.identities.compare_and_remove(key, uid);
            }
            ObjectKind::Node => self.remove_node(&key.name),
            _ => {}
        }
    }

    fn add_node(&self, node: &str) {
        let Some(nodes) = &self.nodes else {
            return;
        };
        let scraper = NodeScraper::new(
            node,
            nodes.source.clone(),
            self.store.clone(),
            self.identities.clone(),
        );
        nodes
            .scheduler
            .add_target(node_target_id(node), Arc::new(scraper), nodes.interval);
    }

    fn remove_node(&self, node: &str) {
        if let Some(nodes) = &self.nodes {
            nodes.scheduler.remove_target(&node_target_id(node));
        }
    }

    /// Drain notifications until the channel closes or shutdown fires
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ObjectEvent>,
        health: HealthRegistry,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Starting object reconciler");

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("Object notification channel closed");
                        break;
                    };
                    let result = self.handle(event).await;
                    if let Err(e) = &result {
                        let error = format!("{:#}", e);
                        error!(error = %error, "Failed to apply object notification");
                    }
                    health.report(components::RECONCILER, &result).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down object reconciler");
                    break;
                }
            }
        }
    }
}

/// Periodic pass that soft-deletes rows for objects no longer in the cluster
pub struct Sweeper {
    store: Arc<dyn Store>,
    lister: Arc<dyn ObjectLister>,
    reconciler: Arc<ObjectReconciler>,
    kinds: Vec<ObjectKind>,
    interval: Duration,
    metrics: ScraperMetrics,
    logger: StructuredLogger,
}

/// Per-kind outcome of one sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub kind: ObjectKind,
    pub live: usize,
    pub soft_deleted: u64,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn Store>,
        lister: Arc<dyn ObjectLister>,
        reconciler: Arc<ObjectReconciler>,
        interval: Duration,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            store,
            lister,
            reconciler,
            kinds: ObjectKind::ALL.to_vec(),
            interval,
            metrics: ScraperMetrics::new(),
            logger,
        }
    }

    /// Restrict the sweep to a subset of kinds
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = ObjectKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    async fn sweep_kind(&self, kind: ObjectKind) -> Result<SweepReport> {
        let live = self
            .lister
            .live_uids(kind)
            .await
            .with_context(|| format!("Failed to list live {} objects", kind))?;
        let swept = self
            .store
            .soft_delete_missing(kind, &live)
            .await
            .with_context(|| format!("Failed to sweep {} objects", kind))?;

        for object in &swept {
            debug!(kind = %kind, uid = %object.uid, name = %object.name, "Swept object missed by notifications");
            self.reconciler
                .release(kind, &object.uid, &object.workload_key());
        }

        let soft_deleted = swept.len() as u64;
        self.metrics
            .add_objects_soft_deleted(kind.as_str(), "sweep", soft_deleted);
        self.logger.log_sweep(kind.as_str(), live.len(), soft_deleted);
        Ok(SweepReport {
            kind,
            live: live.len(),
            soft_deleted,
        })
    }

    /// Sweep every kind once. A failing kind is logged and skipped; the
    /// first error is returned after the remaining kinds ran.
    pub async fn sweep_once(&self) -> Result<Vec<SweepReport>> {
        let mut reports = Vec::with_capacity(self.kinds.len());
        let mut first_error = None;

        for kind in &self.kinds {
            match self.sweep_kind(*kind).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    let error = format!("{:#}", e);
                    error!(kind = %kind, error = %error, "Sweep failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match self.store.active_object_count().await {
            Ok(count) => self.metrics.set_active_objects(count),
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(error = %error, "Failed to count live objects");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    /// Sweep immediately, then once per interval until shutdown
    pub async fn run(self, health: HealthRegistry, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Starting sweeper");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = self.sweep_once().await;
                    health.report(components::RECONCILER, &result).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down sweeper");
                    break;
                }
            }
        }
    }
}
