//! Persistence seam
//!
//! Everything the scraper, reconciler and query layers write or read goes
//! through [`Store`]. [`PgStore`] is the production backend; [`MemoryStore`]
//! applies the same semantics in process and backs the test suites.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::models::{
    ObjectKind, ObjectSnapshot, PodRecord, SweptObject, UsageMetric, UsageRecord,
};
use crate::query::{BuiltQuery, Cell};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

#[async_trait]
pub trait Store: Send + Sync {
    /// Fold a batch of values into their hourly buckets, atomically.
    ///
    /// Each record raises the bucket's max, lowers its min, adds to its
    /// total and bumps the reading count for `metric` only.
    async fn upsert_usage(&self, metric: UsageMetric, records: &[UsageRecord]) -> Result<()>;

    /// Insert or replace the snapshot for `snapshot.uid`.
    ///
    /// A row that was already soft-deleted stays deleted.
    async fn upsert_object(&self, snapshot: &ObjectSnapshot) -> Result<()>;

    /// Insert or replace the typed pod projection. The first recorded
    /// deletion time wins.
    async fn upsert_pod(&self, pod: &PodRecord) -> Result<()>;

    /// Mark one object deleted. Returns false when it was unknown or
    /// already deleted.
    async fn soft_delete_object(&self, uid: &str) -> Result<bool>;

    /// Mark every live object of `kind` whose uid is not in `live_uids`
    /// deleted. Returns the rows that changed.
    async fn soft_delete_missing(
        &self,
        kind: ObjectKind,
        live_uids: &HashSet<String>,
    ) -> Result<Vec<SweptObject>>;

    /// Count of snapshot rows with no deletion time
    async fn active_object_count(&self) -> Result<i64>;

    /// Execute a query produced by [`crate::query::build_query`]
    async fn run_query(&self, query: &BuiltQuery) -> Result<Vec<Vec<Cell>>>;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<()>;
}
