//! `podcost workloads`: aggregated usage and cost per workload

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use colored::Colorize;

use crate::client::{ApiClient, WorkloadTable};
use crate::output::{print_warning, render_rows, OutputFormat};

/// Aggregation request as sent to `/api/v1/workloads`
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadQuery {
    pub cols: Vec<String>,
    pub order_by: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WorkloadQuery {
    /// Fills the window from `now`: `end` defaults to now and `start` to
    /// `hours` before `end`.
    pub fn new(
        cols: Vec<String>,
        order_by: Option<String>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        hours: u32,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if cols.is_empty() {
            bail!("at least one column is required");
        }
        let end = end.unwrap_or(now);
        let start = start.unwrap_or(end - Duration::hours(i64::from(hours)));

        Ok(Self {
            cols,
            order_by,
            start,
            end,
        })
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("cols", self.cols.join(",")),
            ("start", self.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end", self.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ];
        if let Some(order_by) = &self.order_by {
            params.push(("order_by", order_by.clone()));
        }
        params
    }
}

pub async fn fetch_workloads(client: &ApiClient, query: &WorkloadQuery) -> Result<WorkloadTable> {
    client
        .get_with_query("api/v1/workloads", &query.params())
        .await
}

/// Print the aggregation for the requested window
pub async fn show_workloads(
    client: &ApiClient,
    query: &WorkloadQuery,
    show_sql: bool,
    format: OutputFormat,
) -> Result<()> {
    let result = fetch_workloads(client, query).await?;

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&result)?;
            println!("{}", json);
        }
        OutputFormat::Table => {
            println!(
                "{} {} → {}",
                "Window:".bold(),
                query.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                query.end.to_rfc3339_opts(SecondsFormat::Secs, true)
            );

            if result.rows.is_empty() {
                print_warning("No usage recorded in this window");
            } else {
                println!("{}", render_rows(&result.columns, &result.rows));
                println!("\nTotal: {} rows", result.rows.len());
            }

            if show_sql {
                println!("\n{}", "SQL".bold());
                println!("{}", result.sql.dimmed());
                let args: Vec<String> = result.args.iter().map(|a| a.to_string()).collect();
                println!("{} [{}]", "Args:".bold(), args.join(", "));
            }
        }
    }

    Ok(())
}
