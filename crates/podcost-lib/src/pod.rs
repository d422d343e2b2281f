//! Pod projection
//!
//! Derives the typed [`PodRecord`] the cost view joins on from a raw pod
//! snapshot.

use crate::models::{ControllerRef, ObjectKind, ObjectSnapshot, PodRecord};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Parse a Kubernetes resource quantity such as `250m`, `1.5`, `512Mi`,
/// `2E` or `1e3`
pub fn parse_quantity(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);

    if is_decimal_exponent(suffix) {
        return raw
            .parse()
            .with_context(|| format!("invalid quantity {:?}", raw));
    }

    // Decimal fractions divide so that `100m` is exactly 0.1
    let (multiplier, divisor) = match suffix {
        "n" => (1.0, 1e9),
        "u" => (1.0, 1e6),
        "m" => (1.0, 1e3),
        _ => (binary_or_decimal_multiplier(suffix, raw)?, 1.0),
    };

    let value: f64 = number
        .parse()
        .with_context(|| format!("invalid quantity {:?}", raw))?;
    Ok(value * multiplier / divisor)
}

/// `e3`, `E-2` and the like; a bare `E` is the exa suffix
fn is_decimal_exponent(suffix: &str) -> bool {
    let Some(exponent) = suffix.strip_prefix(|c| c == 'e' || c == 'E') else {
        return false;
    };
    let digits = exponent
        .strip_prefix(|c| c == '+' || c == '-')
        .unwrap_or(exponent);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn binary_or_decimal_multiplier(suffix: &str, raw: &str) -> Result<f64> {
    Ok(match suffix {
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        other => bail!("unknown quantity suffix {:?} in {:?}", other, raw),
    })
}

fn request(container: &Value, resource: &str) -> Result<f64> {
    match container
        .pointer(&format!("/resources/requests/{}", resource))
        .and_then(Value::as_str)
    {
        Some(q) => parse_quantity(q),
        None => Ok(0.0),
    }
}

/// Effective (cpu cores, memory bytes) requests of a pod spec.
///
/// Regular containers run together so their requests add up. Init containers
/// run one at a time before them, so each only raises the total to at least
/// its own request.
pub fn effective_requests(spec: &Value) -> Result<(f64, f64)> {
    let containers = |field: &str| {
        spec.get(field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };

    let mut cpu = 0.0;
    let mut memory = 0.0;
    for container in containers("containers") {
        cpu += request(&container, "cpu")?;
        memory += request(&container, "memory")?;
    }
    for container in containers("initContainers") {
        cpu = f64::max(cpu, request(&container, "cpu")?);
        memory = f64::max(memory, request(&container, "memory")?);
    }
    Ok((cpu, memory))
}

fn controller(metadata: &Value) -> Option<ControllerRef> {
    metadata
        .get("ownerReferences")?
        .as_array()?
        .iter()
        .find(|owner| owner.get("controller").and_then(Value::as_bool) == Some(true))
        .map(|owner| {
            let field = |key: &str| {
                owner
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            ControllerRef {
                uid: field("uid"),
                kind: field("kind"),
                name: field("name"),
            }
        })
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Build the pod projection from a snapshot
pub fn pod_record(snapshot: &ObjectSnapshot) -> Result<PodRecord> {
    if snapshot.kind != ObjectKind::Pod {
        bail!("expected a Pod snapshot, got {}", snapshot.kind);
    }
    let (request_cpu_cores, request_memory_bytes) = effective_requests(&snapshot.spec)
        .with_context(|| format!("Failed to read requests of pod {}", snapshot.workload_key()))?;

    Ok(PodRecord {
        uid: snapshot.uid.clone(),
        namespace: snapshot.namespace.clone(),
        name: snapshot.name.clone(),
        node_name: snapshot
            .spec
            .get("nodeName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        controller: controller(&snapshot.metadata),
        request_cpu_cores,
        request_memory_bytes,
        labels: snapshot
            .metadata
            .get("labels")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default())),
        created_at: timestamp(snapshot.metadata.get("creationTimestamp")),
        started_at: timestamp(snapshot.status.get("startTime")),
        deleted_at: timestamp(snapshot.metadata.get("deletionTimestamp")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("250m").unwrap(), 0.25);
        assert_eq!(parse_quantity("2").unwrap(), 2.0);
        assert_eq!(parse_quantity("1.5").unwrap(), 1.5);
        assert_eq!(parse_quantity("128Mi").unwrap(), 134_217_728.0);
        assert_eq!(parse_quantity("1Gi").unwrap(), 1_073_741_824.0);
        assert_eq!(parse_quantity("1G").unwrap(), 1e9);
        assert_eq!(parse_quantity("1e3").unwrap(), 1000.0);
        assert_eq!(parse_quantity("100k").unwrap(), 100_000.0);
        assert_eq!(parse_quantity("1E3").unwrap(), 1000.0);
        assert_eq!(parse_quantity("5e-1").unwrap(), 0.5);
        assert_eq!(parse_quantity("1E").unwrap(), 1e18);
        assert_eq!(parse_quantity("2Ei").unwrap(), 2.0 * 1024.0_f64.powi(6));

        assert!(parse_quantity("12Zi").is_err());
        assert!(parse_quantity("lots").is_err());
        assert!(parse_quantity("").is_err());
    }

    fn pod_snapshot() -> ObjectSnapshot {
        ObjectSnapshot::from_object_json(
            ObjectKind::Pod,
            json!({
                "metadata": {
                    "uid": "pod-uid",
                    "name": "web-7d9f-abcde",
                    "namespace": "shop",
                    "creationTimestamp": "2024-03-01T09:58:00Z",
                    "labels": {"app": "web"},
                    "ownerReferences": [
                        {"kind": "Node", "name": "ignored", "uid": "x"},
                        {"kind": "ReplicaSet", "name": "web-7d9f", "uid": "rs-uid", "controller": true}
                    ]
                },
                "spec": {
                    "nodeName": "node-a",
                    "initContainers": [
                        {"name": "migrate", "resources": {"requests": {"cpu": "2", "memory": "64Mi"}}}
                    ],
                    "containers": [
                        {"name": "web", "resources": {"requests": {"cpu": "500m", "memory": "256Mi"}}},
                        {"name": "sidecar", "resources": {"requests": {"cpu": "250m"}}},
                        {"name": "no-requests"}
                    ]
                },
                "status": {"startTime": "2024-03-01T09:59:00Z"}
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_pod_record() {
        let record = pod_record(&pod_snapshot()).unwrap();

        assert_eq!(record.node_name, "node-a");
        // Init container raises cpu, memory keeps the container sum
        assert_eq!(record.request_cpu_cores, 2.0);
        assert_eq!(record.request_memory_bytes, 256.0 * 1024.0 * 1024.0);

        let controller = record.controller.unwrap();
        assert_eq!(controller.kind, "ReplicaSet");
        assert_eq!(controller.name, "web-7d9f");
        assert_eq!(controller.uid, "rs-uid");

        assert_eq!(record.labels["app"], "web");
        assert_eq!(
            record.started_at.unwrap().to_rfc3339(),
            "2024-03-01T09:59:00+00:00"
        );
        assert!(record.deleted_at.is_none());
    }

    #[test]
    fn test_bare_pod_defaults() {
        let snapshot = ObjectSnapshot::from_object_json(
            ObjectKind::Pod,
            json!({"metadata": {"uid": "u", "name": "bare", "namespace": "default"}}),
        )
        .unwrap();
        let record = pod_record(&snapshot).unwrap();

        assert!(record.controller.is_none());
        assert_eq!(record.request_cpu_cores, 0.0);
        assert_eq!(record.node_name, "");
        assert_eq!(record.labels, json!({}));
    }

    #[test]
    fn test_rejects_other_kinds() {
        let snapshot = ObjectSnapshot::from_object_json(
            ObjectKind::Node,
            json!({"metadata": {"uid": "n", "name": "node-a"}}),
        )
        .unwrap();
        assert!(pod_record(&snapshot).is_err());
    }
}
