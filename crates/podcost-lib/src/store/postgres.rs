use super::Store;
use crate::models::{
    ObjectKind, ObjectSnapshot, PodRecord, SweptObject, UsageMetric, UsageRecord,
};
use crate::query::{BuiltQuery, Cell, QueryArg};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

const CPU_UPSERT: &str = "\
insert into pod_usage_hourly (pod_uid, timestamp, cpu_cores_max, cpu_cores_min, cpu_cores_total, cpu_cores_total_readings)
values ($1, $2, $3, $3, $3, 1)
on conflict (pod_uid, timestamp) do update set
    cpu_cores_max = case when pod_usage_hourly.cpu_cores_total_readings = 0 or excluded.cpu_cores_max > pod_usage_hourly.cpu_cores_max
        then excluded.cpu_cores_max else pod_usage_hourly.cpu_cores_max end,
    cpu_cores_min = case when pod_usage_hourly.cpu_cores_total_readings = 0 or excluded.cpu_cores_min < pod_usage_hourly.cpu_cores_min
        then excluded.cpu_cores_min else pod_usage_hourly.cpu_cores_min end,
    cpu_cores_total = pod_usage_hourly.cpu_cores_total + excluded.cpu_cores_total,
    cpu_cores_total_readings = pod_usage_hourly.cpu_cores_total_readings + 1";

const MEMORY_UPSERT: &str = "\
insert into pod_usage_hourly (pod_uid, timestamp, memory_bytes_max, memory_bytes_min, memory_bytes_total, memory_bytes_total_readings)
values ($1, $2, $3, $3, $3, 1)
on conflict (pod_uid, timestamp) do update set
    memory_bytes_max = case when pod_usage_hourly.memory_bytes_total_readings = 0 or excluded.memory_bytes_max > pod_usage_hourly.memory_bytes_max
        then excluded.memory_bytes_max else pod_usage_hourly.memory_bytes_max end,
    memory_bytes_min = case when pod_usage_hourly.memory_bytes_total_readings = 0 or excluded.memory_bytes_min < pod_usage_hourly.memory_bytes_min
        then excluded.memory_bytes_min else pod_usage_hourly.memory_bytes_min end,
    memory_bytes_total = pod_usage_hourly.memory_bytes_total + excluded.memory_bytes_total,
    memory_bytes_total_readings = pod_usage_hourly.memory_bytes_total_readings + 1";

const OBJECT_UPSERT: &str = "\
insert into object (uid, kind, namespace, name, metadata, spec, status)
values ($1, $2, $3, $4, $5, $6, $7)
on conflict (uid) do update set
    kind = excluded.kind,
    namespace = excluded.namespace,
    name = excluded.name,
    metadata = excluded.metadata,
    spec = excluded.spec,
    status = excluded.status,
    updated_at = now()";

const POD_UPSERT: &str = "\
insert into pod (pod_uid, namespace, name, node_name, controller_uid, controller_kind, controller_name,
    request_cpu_cores, request_memory_bytes, labels, created_at, started_at, deleted_at)
values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
on conflict (pod_uid) do update set
    node_name = excluded.node_name,
    controller_uid = excluded.controller_uid,
    controller_kind = excluded.controller_kind,
    controller_name = excluded.controller_name,
    request_cpu_cores = excluded.request_cpu_cores,
    request_memory_bytes = excluded.request_memory_bytes,
    labels = excluded.labels,
    created_at = excluded.created_at,
    started_at = excluded.started_at,
    deleted_at = coalesce(pod.deleted_at, excluded.deleted_at)";

/// PostgreSQL-backed [`Store`]
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;
        info!(max_connections, "Database pool created");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        info!("Database migrations applied");
        Ok(())
    }
}

fn decode_cell(row: &PgRow, index: usize) -> Result<Cell> {
    let column = &row.columns()[index];
    let cell = match column.type_info().name() {
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Cell::Float),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)?
            .map(|v| Cell::Float(v as f64)),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Cell::Int),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)?
            .map(|v| Cell::Int(v as i64)),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)?
            .map(|v| Cell::Int(v as i64)),
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Cell::Bool),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(Cell::Timestamp),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(|v| Cell::Timestamp(v.and_utc())),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(index)?.map(Cell::Date),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(index)?.map(Cell::Text)
        }
        other => {
            debug!(column = column.name(), type_name = other, "Unsupported column type");
            None
        }
    };
    Ok(cell.unwrap_or(Cell::Null))
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_usage(&self, metric: UsageMetric, records: &[UsageRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let sql = match metric {
            UsageMetric::Cpu => CPU_UPSERT,
            UsageMetric::Memory => MEMORY_UPSERT,
        };

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for record in records {
            sqlx::query(sql)
                .bind(&record.pod_uid)
                .bind(record.bucket)
                .bind(record.value)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to upsert {} usage", metric.as_str()))?;
        }
        tx.commit().await.context("Failed to commit usage batch")?;
        Ok(())
    }

    async fn upsert_object(&self, snapshot: &ObjectSnapshot) -> Result<()> {
        sqlx::query(OBJECT_UPSERT)
            .bind(&snapshot.uid)
            .bind(snapshot.kind.as_str())
            .bind(&snapshot.namespace)
            .bind(&snapshot.name)
            .bind(&snapshot.metadata)
            .bind(&snapshot.spec)
            .bind(&snapshot.status)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to upsert {} {}", snapshot.kind, snapshot.uid))?;
        Ok(())
    }

    async fn upsert_pod(&self, pod: &PodRecord) -> Result<()> {
        let controller = pod.controller.clone().unwrap_or_default();
        let controller_uid = pod.controller.as_ref().map(|c| c.uid.clone());
        sqlx::query(POD_UPSERT)
            .bind(&pod.uid)
            .bind(&pod.namespace)
            .bind(&pod.name)
            .bind(&pod.node_name)
            .bind(controller_uid)
            .bind(&controller.kind)
            .bind(&controller.name)
            .bind(pod.request_cpu_cores)
            .bind(pod.request_memory_bytes)
            .bind(&pod.labels)
            .bind(pod.created_at)
            .bind(pod.started_at)
            .bind(pod.deleted_at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to upsert pod {}", pod.uid))?;
        Ok(())
    }

    async fn soft_delete_object(&self, uid: &str) -> Result<bool> {
        let result =
            sqlx::query("update object set deleted_at = now() where uid = $1 and deleted_at is null")
                .bind(uid)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to soft-delete object {}", uid))?;
        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete_missing(
        &self,
        kind: ObjectKind,
        live_uids: &HashSet<String>,
    ) -> Result<Vec<SweptObject>> {
        let uids: Vec<String> = live_uids.iter().cloned().collect();
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "update object set deleted_at = now() \
             where kind = $1 and deleted_at is null and uid <> all($2) \
             returning uid, namespace, name",
        )
        .bind(kind.as_str())
        .bind(&uids)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to sweep {} objects", kind))?;

        let mut swept: Vec<SweptObject> = rows
            .into_iter()
            .map(|(uid, namespace, name)| SweptObject {
                kind,
                uid,
                namespace,
                name,
            })
            .collect();
        swept.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(swept)
    }

    async fn active_object_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("select count(*) from object where deleted_at is null")
                .fetch_one(&self.pool)
                .await
                .context("Failed to count live objects")?;
        Ok(count)
    }

    async fn run_query(&self, query: &BuiltQuery) -> Result<Vec<Vec<Cell>>> {
        let mut statement = sqlx::query(&query.sql);
        for arg in &query.args {
            statement = match arg {
                QueryArg::Timestamp(ts) => statement.bind(*ts),
                QueryArg::Float(v) => statement.bind(*v),
            };
        }

        let rows = statement
            .fetch_all(&self.pool)
            .await
            .context("Failed to execute aggregation query")?;

        rows.iter()
            .map(|row| (0..row.len()).map(|i| decode_cell(row, i)).collect())
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("select 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}
