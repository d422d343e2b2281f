//! podcost agent
//!
//! Wires the core library to Kubernetes, PostgreSQL and HTTP:
//! - `cluster`: kube watchers feeding the reconciler, and the kubelet metrics source
//! - `api`: workload aggregation, health and Prometheus endpoints
//! - `config`: environment-driven agent configuration

pub mod api;
pub mod cluster;
pub mod config;
