//! podcost CLI
//!
//! Queries a running podcost agent for workload cost aggregations and
//! component health.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use podcost_cli::client::ApiClient;
use podcost_cli::commands::{health, workloads};
use podcost_cli::output::{self, print_error};

#[derive(Parser)]
#[command(name = "podcost")]
#[command(author, version, about = "Workload cost reports from the podcost agent", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via PODCOST_API_URL env var)
    #[arg(long, env = "PODCOST_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Aggregate usage and cost per workload over a time window
    Workloads {
        /// Comma-separated columns; `label_<key>` groups by a pod label
        #[arg(
            long,
            value_delimiter = ',',
            default_value = "namespace,controller_kind,controller_name,total_cost"
        )]
        cols: Vec<String>,

        /// Column to sort by, optionally followed by ` asc` or ` desc`
        #[arg(long)]
        order_by: Option<String>,

        /// Window start (RFC 3339), defaults to `--hours` before the end
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Window end (RFC 3339), defaults to now
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        /// Window length when no start is given
        #[arg(long, default_value_t = 24)]
        hours: u32,

        /// Also print the SQL the agent ran
        #[arg(long)]
        show_sql: bool,
    },

    /// Show agent component health and readiness
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Workloads {
            cols,
            order_by,
            start,
            end,
            hours,
            show_sql,
        } => {
            let query = workloads::WorkloadQuery::new(cols, order_by, start, end, hours, Utc::now())?;
            workloads::show_workloads(&client, &query, show_sql, cli.format).await?;
        }
        Commands::Health => {
            health::show_health(&client, cli.format).await?;
        }
    }

    Ok(())
}
