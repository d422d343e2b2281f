//! Core data models shared by the scraper, reconciler and query layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifies a pod as the kubelet metrics endpoint reports it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A single reading of a cumulative counter or a gauge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterSample {
    pub value: f64,
    pub timestamp_ms: i64,
}

impl CounterSample {
    pub fn new(value: f64, timestamp_ms: i64) -> Self {
        Self {
            value,
            timestamp_ms,
        }
    }
}

/// Everything one poll of a node's resource metrics returned
#[derive(Debug, Clone, Default)]
pub struct NodeSample {
    /// Cumulative CPU seconds per pod
    pub cpu: HashMap<WorkloadKey, CounterSample>,
    /// Working set bytes per pod
    pub memory: HashMap<WorkloadKey, CounterSample>,
}

/// Which half of an hourly usage bucket a value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageMetric {
    /// Average cores over the sampling window
    Cpu,
    /// Working set bytes
    Memory,
}

impl UsageMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageMetric::Cpu => "cpu",
            UsageMetric::Memory => "memory",
        }
    }
}

/// One value ready to be folded into an hourly bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub pod_uid: String,
    pub bucket: DateTime<Utc>,
    pub value: f64,
}

/// Running statistics for one metric inside an hourly bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub min: f64,
    pub max: f64,
    pub total: f64,
    pub readings: u32,
}

impl UsageStats {
    /// Fold one value in. Mirrors the conflict branch of the usage upsert.
    pub fn fold(&mut self, value: f64) {
        if self.readings == 0 {
            self.min = value;
            self.max = value;
            self.total = value;
        } else {
            if value > self.max {
                self.max = value;
            }
            if value < self.min {
                self.min = value;
            }
            self.total += value;
        }
        self.readings += 1;
    }

    /// Average of all folded values, zero when nothing was folded yet
    pub fn avg(&self) -> f64 {
        if self.readings == 0 {
            0.0
        } else {
            self.total / self.readings as f64
        }
    }
}

/// Persisted hourly aggregate for one pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyUsageBucket {
    pub pod_uid: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_cores: UsageStats,
    pub memory_bytes: UsageStats,
}

impl HourlyUsageBucket {
    pub fn new(pod_uid: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            pod_uid: pod_uid.into(),
            timestamp,
            cpu_cores: UsageStats::default(),
            memory_bytes: UsageStats::default(),
        }
    }

    pub fn stats_mut(&mut self, metric: UsageMetric) -> &mut UsageStats {
        match metric {
            UsageMetric::Cpu => &mut self.cpu_cores,
            UsageMetric::Memory => &mut self.memory_bytes,
        }
    }
}

/// Kinds of cluster objects mirrored into the snapshot table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Pod,
    Node,
    Namespace,
    ReplicaSet,
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    PersistentVolumeClaim,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 10] = [
        ObjectKind::Pod,
        ObjectKind::Node,
        ObjectKind::Namespace,
        ObjectKind::ReplicaSet,
        ObjectKind::Deployment,
        ObjectKind::StatefulSet,
        ObjectKind::DaemonSet,
        ObjectKind::Job,
        ObjectKind::CronJob,
        ObjectKind::PersistentVolumeClaim,
    ];

    /// Discriminator stored in the `kind` column
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Pod => "Pod",
            ObjectKind::Node => "Node",
            ObjectKind::Namespace => "Namespace",
            ObjectKind::ReplicaSet => "ReplicaSet",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::StatefulSet => "StatefulSet",
            ObjectKind::DaemonSet => "DaemonSet",
            ObjectKind::Job => "Job",
            ObjectKind::CronJob => "CronJob",
            ObjectKind::PersistentVolumeClaim => "PersistentVolumeClaim",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest known state of one cluster object, as delivered by the watch layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub kind: ObjectKind,
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub metadata: serde_json::Value,
    pub spec: serde_json::Value,
    pub status: serde_json::Value,
}

impl ObjectSnapshot {
    /// Split a serialized Kubernetes object into its snapshot columns
    pub fn from_object_json(kind: ObjectKind, object: serde_json::Value) -> anyhow::Result<Self> {
        let metadata = object
            .get("metadata")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} object has no metadata", kind))?;
        let uid = metadata
            .get("uid")
            .and_then(|v| v.as_str())
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| anyhow::anyhow!("{} object has no uid", kind))?
            .to_string();
        let field = |key: &str| {
            metadata
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let namespace = field("namespace");
        let name = field("name");

        Ok(Self {
            kind,
            uid,
            namespace,
            name,
            spec: object.get("spec").cloned().unwrap_or(serde_json::Value::Null),
            status: object
                .get("status")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            metadata,
        })
    }

    pub fn workload_key(&self) -> WorkloadKey {
        WorkloadKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Add/update/delete notification from the watch layer
#[derive(Debug, Clone)]
pub enum ObjectEvent {
    /// The object was created or changed
    Applied(ObjectSnapshot),
    /// The object is gone from the cluster
    Deleted(ObjectSnapshot),
}

/// Stored row of the snapshot table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub snapshot: ObjectSnapshot,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredObject {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Row the sweep marked deleted because its object left the cluster unseen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweptObject {
    pub kind: ObjectKind,
    pub uid: String,
    pub namespace: String,
    pub name: String,
}

impl SweptObject {
    pub fn workload_key(&self) -> WorkloadKey {
        WorkloadKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Owner reference flagged as the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerRef {
    pub uid: String,
    pub kind: String,
    pub name: String,
}

/// Typed projection of a pod used for cost attribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodRecord {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub node_name: String,
    pub controller: Option<ControllerRef>,
    pub request_cpu_cores: f64,
    pub request_memory_bytes: f64,
    pub labels: serde_json::Value,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}
