//! Node metrics source
//!
//! The kubelet serves per-pod resource counters at
//! `/api/v1/nodes/<node>/proxy/metrics/resource` in the Prometheus text
//! exposition format. [`parse_resource_metrics`] extracts the two series the
//! delta engine needs.

use crate::models::{CounterSample, NodeSample, WorkloadKey};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::trace;

pub const CPU_SERIES: &str = "pod_cpu_usage_seconds_total";
pub const MEMORY_SERIES: &str = "pod_memory_working_set_bytes";

/// Fetches one resource sample set for a node
#[async_trait]
pub trait NodeMetricsSource: Send + Sync {
    async fn node_sample(&self, node: &str) -> Result<NodeSample>;
}

/// Parse kubelet resource metrics.
///
/// Lines that are comments, belong to other series, lack a `namespace` or
/// `pod` label, lack a timestamp or carry an unparsable value are skipped.
pub fn parse_resource_metrics(text: &str) -> NodeSample {
    let mut sample = NodeSample::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let target = if line.starts_with(CPU_SERIES) {
            &mut sample.cpu
        } else if line.starts_with(MEMORY_SERIES) {
            &mut sample.memory
        } else {
            continue;
        };

        match parse_line(line) {
            Some((name, key, value)) if name == CPU_SERIES || name == MEMORY_SERIES => {
                target.insert(key, value);
            }
            _ => trace!(line = %line, "Skipping resource metric line"),
        }
    }

    sample
}

/// Splits `name{labels} value timestamp` into its parts
fn parse_line(line: &str) -> Option<(&str, WorkloadKey, CounterSample)> {
    let open = line.find('{')?;
    let close = line.rfind('}')?;
    if close < open {
        return None;
    }
    let name = &line[..open];
    let labels = parse_labels(&line[open + 1..close]);

    let mut rest = line[close + 1..].split_whitespace();
    let value: f64 = rest.next()?.parse().ok()?;
    let timestamp_ms: i64 = rest.next()?.parse().ok()?;

    let key = WorkloadKey::new(labels.get("namespace")?.clone(), labels.get("pod")?.clone());
    Some((name, key, CounterSample::new(value, timestamp_ms)))
}

fn parse_labels(raw: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let mut chars = raw.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let name: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if name.is_empty() || chars.next() != Some('"') {
            break;
        }

        let mut value = String::new();
        let mut escaped = false;
        for c in chars.by_ref() {
            match (escaped, c) {
                (true, 'n') => {
                    value.push('\n');
                    escaped = false;
                }
                (true, c) => {
                    value.push(c);
                    escaped = false;
                }
                (false, '\\') => escaped = true,
                (false, '"') => break,
                (false, c) => value.push(c),
            }
        }
        labels.insert(name.trim().to_string(), value);
    }

    labels
}
