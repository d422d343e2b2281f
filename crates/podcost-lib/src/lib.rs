//! Core library for the podcost agent
//!
//! This crate provides:
//! - A scrape scheduler running one polling task per node
//! - Counter-to-rate conversion and hourly usage buckets
//! - Object snapshot reconciliation with periodic sweeps
//! - Whitelisted workload cost aggregation queries
//! - Storage backends, health checks and observability

pub mod delta;
pub mod health;
pub mod identity;
pub mod models;
pub mod observability;
pub mod pod;
pub mod query;
pub mod reconciler;
pub mod scheduler;
pub mod source;
pub mod store;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use identity::WorkloadIdentityCache;
pub use models::*;
pub use observability::{ScraperMetrics, StructuredLogger};
pub use query::{workload_agg, QueryError, WorkloadAggRequest, WorkloadAggResult};
pub use reconciler::{ObjectLister, ObjectReconciler, Sweeper};
pub use scheduler::{ScrapeScheduler, ScrapeTarget};
pub use source::NodeMetricsSource;
pub use store::{MemoryStore, PgStore, Store};
