//! `podcost health`: component health and readiness of the agent

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use tabled::Tabled;

use crate::client::{ApiClient, HealthReport, Readiness};
use crate::output::{color_status, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Last Check")]
    last_check: String,
}

#[derive(Serialize)]
struct HealthOutput {
    health: HealthReport,
    readiness: Readiness,
}

pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: HealthReport = client.get_status("healthz").await?;
    let readiness: Readiness = client.get_status("readyz").await?;

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&HealthOutput { health, readiness })?;
            println!("{}", json);
        }
        OutputFormat::Table => {
            println!("{} {}", "Status:".bold(), color_status(&health.status));
            let ready = if readiness.ready { "ready" } else { "not ready" };
            match &readiness.reason {
                Some(reason) => println!("{} {} ({})", "Readiness:".bold(), color_status(ready), reason),
                None => println!("{} {}", "Readiness:".bold(), color_status(ready)),
            }
            println!();

            let rows: Vec<ComponentRow> = health
                .components
                .into_iter()
                .map(|(name, c)| ComponentRow {
                    name,
                    status: color_status(&c.status),
                    message: c.message.unwrap_or_else(|| "-".to_string()),
                    last_check: c.last_check,
                })
                .collect();

            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
        }
    }

    Ok(())
}
