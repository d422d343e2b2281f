//! Workload aggregation queries
//!
//! Turns a caller-chosen set of columns and a time window into one
//! parameterized `SELECT` over the `cost_hourly` view. Every requested
//! column is checked against a fixed whitelist. The only caller text that
//! ever reaches the SQL string is a label key, and [`build_query`] is the
//! single place that formats it, after [`validate_label`] accepted it.

use crate::observability::ScraperMetrics;
use crate::store::Store;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;
use thiserror::Error;
use tracing::info;

/// Selectable columns in output order
pub const COLUMNS: [&str; 15] = [
    "timestamp",
    "date",
    "namespace",
    "controller_kind",
    "controller_name",
    "name",
    "node_name",
    "request_cpu_cores",
    "used_cpu_cores",
    "request_memory_bytes",
    "used_memory_bytes",
    "hours",
    "cpu_cost",
    "memory_cost",
    "total_cost",
];

/// Columns that become GROUP BY expressions
const DIMENSIONS: [&str; 7] = [
    "timestamp",
    "date",
    "namespace",
    "controller_kind",
    "controller_name",
    "name",
    "node_name",
];

/// Prefix of dynamic columns that read one pod label
pub const LABEL_PREFIX: &str = "label_";

/// Aggregation request as received from the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadAggRequest {
    pub cols: Vec<String>,
    /// Column name with an optional ` asc` / ` desc` suffix; empty for no ordering
    #[serde(default)]
    pub order_by: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no columns requested")]
    NoColumns,

    #[error("invalid column: {0}")]
    InvalidColumn(String),

    #[error("invalid order by: {0}")]
    InvalidOrderBy(String),

    #[error("invalid label: {0}")]
    InvalidLabel(String),

    #[error("start time {start} is after end time {end}")]
    InvertedWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("aggregation query failed: {0:#}")]
    Store(anyhow::Error),
}

impl QueryError {
    /// True when the caller sent a bad request, false for server-side failures
    pub fn is_request_error(&self) -> bool {
        !matches!(self, QueryError::Store(_))
    }
}

/// Bound parameter of a built query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryArg {
    Timestamp(DateTime<Utc>),
    Float(f64),
}

/// SQL text plus its arguments, in placeholder order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuiltQuery {
    pub sql: String,
    pub args: Vec<QueryArg>,
    /// Output column names, in select order
    pub columns: Vec<String>,
}

/// A raw value read back from the store
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Float(f64),
    Int(i64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

/// Tabular result with display strings, plus the query that produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadAggResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub sql: String,
    pub args: Vec<QueryArg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

static LABEL_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Accepts label keys made of `[A-Za-z0-9._-]` that start and end with an
/// alphanumeric character.
pub fn validate_label(label: &str) -> bool {
    LABEL_PATTERN
        .get_or_init(|| {
            Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9._-]*[A-Za-z0-9])?$")
                .expect("Failed to compile label pattern")
        })
        .is_match(label)
}

fn is_whitelisted(col: &str) -> bool {
    COLUMNS.contains(&col)
}

/// Splits `"name desc"` into the column and direction
fn split_order_by(order_by: &str) -> (&str, Option<SortDirection>) {
    let trimmed = order_by.trim();
    if let Some((col, direction)) = trimmed.rsplit_once(' ') {
        if direction.eq_ignore_ascii_case("asc") {
            return (col.trim_end(), Some(SortDirection::Asc));
        }
        if direction.eq_ignore_ascii_case("desc") {
            return (col.trim_end(), Some(SortDirection::Desc));
        }
    }
    (trimmed, None)
}

/// Check every column of a request without building anything
pub fn validate(request: &WorkloadAggRequest) -> Result<(), QueryError> {
    if request.start > request.end {
        return Err(QueryError::InvertedWindow {
            start: request.start,
            end: request.end,
        });
    }
    if request.cols.is_empty() {
        return Err(QueryError::NoColumns);
    }

    for col in &request.cols {
        match col.strip_prefix(LABEL_PREFIX) {
            Some(label) => {
                if !validate_label(label) {
                    return Err(QueryError::InvalidLabel(label.to_string()));
                }
            }
            None if is_whitelisted(col) => {}
            None => return Err(QueryError::InvalidColumn(col.clone())),
        }
    }

    if !request.order_by.trim().is_empty() {
        let (col, _) = split_order_by(&request.order_by);
        let known = match col.strip_prefix(LABEL_PREFIX) {
            Some(label) => validate_label(label),
            None => is_whitelisted(col),
        };
        if !known || !request.cols.iter().any(|c| c == col) {
            return Err(QueryError::InvalidOrderBy(request.order_by.clone()));
        }
    }

    Ok(())
}

/// Hands out `$n` placeholders in first-use order
#[derive(Default)]
struct Args {
    values: Vec<QueryArg>,
}

impl Args {
    fn bind(&mut self, arg: QueryArg) -> String {
        self.values.push(arg);
        format!("${}", self.values.len())
    }
}

fn dimension_expr(col: &str) -> Result<&'static str, QueryError> {
    let expr = match col {
        "timestamp" => "timestamp at time zone 'utc'",
        "date" => "(timestamp at time zone 'utc')::date::text",
        "namespace" => "namespace",
        "controller_kind" => "controller_kind",
        "controller_name" => "controller_name",
        "name" => "name",
        "node_name" => "node_name",
        _ => return Err(QueryError::InvalidColumn(col.to_string())),
    };
    Ok(expr)
}

/// Per-hour metrics are weighted by the hours the pod existed in each
/// bucket and divided by the window length
fn metric_expr(col: &str, window_hours: &str) -> Result<String, QueryError> {
    let weighted = |column: &str| format!("sum({} * hours) / {}", column, window_hours);
    let expr = match col {
        "request_cpu_cores" => weighted("request_cpu_cores"),
        "used_cpu_cores" => weighted("cpu_cores_avg"),
        "request_memory_bytes" => weighted("request_memory_bytes"),
        "used_memory_bytes" => weighted("memory_bytes_avg"),
        "hours" => "sum(hours)".to_string(),
        "cpu_cost" => "sum(cpu_cost)".to_string(),
        "memory_cost" => "sum(memory_cost)".to_string(),
        "total_cost" => "sum(cpu_cost + memory_cost)".to_string(),
        _ => return Err(QueryError::InvalidColumn(col.to_string())),
    };
    Ok(expr)
}

fn uses_window_hours(col: &str) -> bool {
    matches!(
        col,
        "request_cpu_cores" | "used_cpu_cores" | "request_memory_bytes" | "used_memory_bytes"
    )
}

/// Validate a request and compile it to SQL.
///
/// Identical requests produce byte-identical SQL and argument lists.
pub fn build_query(request: &WorkloadAggRequest) -> Result<BuiltQuery, QueryError> {
    validate(request)?;

    let window_hours =
        (request.end - request.start).num_milliseconds() as f64 / 3_600_000.0;

    let mut args = Args::default();
    let mut window_placeholder: Option<String> = None;
    let mut select = Vec::new();
    let mut group_by = Vec::new();
    let mut columns = Vec::new();

    for col in COLUMNS {
        if !request.cols.iter().any(|c| c == col) {
            continue;
        }
        if DIMENSIONS.contains(&col) {
            let expr = dimension_expr(col)?;
            select.push(format!("{} as \"{}\"", expr, col));
            group_by.push(expr.to_string());
        } else {
            let expr = if uses_window_hours(col) {
                let placeholder = window_placeholder
                    .get_or_insert_with(|| args.bind(QueryArg::Float(window_hours)))
                    .clone();
                metric_expr(col, &format!("{}::float8", placeholder))?
            } else {
                metric_expr(col, "")?
            };
            select.push(format!("{} as \"{}\"", expr, col));
        }
        columns.push(col.to_string());
    }

    for col in &request.cols {
        let Some(label) = col.strip_prefix(LABEL_PREFIX) else {
            continue;
        };
        if columns.iter().any(|c| c == col) {
            continue;
        }
        // Label text enters the SQL string here
        if !validate_label(label) {
            return Err(QueryError::InvalidLabel(label.to_string()));
        }
        let expr = format!("labels->>'{}'", label);
        select.push(format!("coalesce({}, '') as \"{}\"", expr, col));
        group_by.push(expr);
        columns.push(col.clone());
    }

    let start = args.bind(QueryArg::Timestamp(request.start));
    let end = args.bind(QueryArg::Timestamp(request.end));

    let mut sql = format!(
        "select {} from cost_hourly where timestamp >= {} and timestamp < {}",
        select.join(", "),
        start,
        end
    );
    if !group_by.is_empty() {
        sql.push_str(" group by ");
        sql.push_str(&group_by.join(", "));
    }
    if !request.order_by.trim().is_empty() {
        let (col, direction) = split_order_by(&request.order_by);
        sql.push_str(&format!(
            " order by \"{}\" {}",
            col,
            direction.unwrap_or(SortDirection::Asc).as_sql()
        ));
    }

    Ok(BuiltQuery {
        sql,
        args: args.values,
        columns,
    })
}

/// Render a cell for display.
///
/// Floats keep at most two decimals with trailing zeros dropped, so `12.00`
/// becomes `12` and `12.50` becomes `12.5`.
pub fn format_cell(cell: &Cell) -> String {
    match cell {
        Cell::Null => String::new(),
        Cell::Text(s) => s.clone(),
        Cell::Float(v) => format_float(*v),
        Cell::Int(v) => v.to_string(),
        Cell::Bool(v) => v.to_string(),
        Cell::Timestamp(ts) => ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        Cell::Date(d) => d.format("%Y-%m-%d").to_string(),
    }
}

fn format_float(value: f64) -> String {
    let formatted = format!("{:.2}", value);
    if !formatted.contains('.') {
        return formatted;
    }
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build, execute and render a workload aggregation
pub async fn workload_agg(
    store: &dyn Store,
    request: &WorkloadAggRequest,
) -> Result<WorkloadAggResult, QueryError> {
    let query = build_query(request)?;
    info!(sql = %query.sql, args = ?query.args, "Running workload aggregation");

    let start = Instant::now();
    let rows = store.run_query(&query).await.map_err(QueryError::Store)?;
    ScraperMetrics::new().observe_query_latency(start.elapsed().as_secs_f64());

    Ok(WorkloadAggResult {
        columns: query.columns,
        rows: rows
            .iter()
            .map(|row| row.iter().map(format_cell).collect())
            .collect(),
        sql: query.sql,
        args: query.args,
    })
}
