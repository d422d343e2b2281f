//! Agent configuration

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Agent configuration, read from `PODCOST_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Port of the query, health and metrics server
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds between polls of one node
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval_secs: u64,

    /// Seconds between sweeps for missed deletions
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Start every node poll immediately instead of after a random delay
    #[serde(default)]
    pub disable_scrape_jitter: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Name used in lifecycle log events
    #[serde(default = "default_instance")]
    pub instance: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_scrape_interval() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_db_max_connections() -> u32 {
    5
}

fn default_instance() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "podcost".to_string())
}

impl AgentConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::from_environment(config::Environment::with_prefix("PODCOST"))
    }

    fn from_environment(environment: config::Environment) -> Result<Self> {
        let config: AgentConfig = config::Config::builder()
            .add_source(environment.try_parsing(true))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration (is PODCOST_DATABASE_URL set?)")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            bail!("PODCOST_DATABASE_URL must not be empty");
        }
        if self.scrape_interval_secs == 0 {
            bail!("PODCOST_SCRAPE_INTERVAL_SECS must be greater than zero");
        }
        if self.sweep_interval_secs == 0 {
            bail!("PODCOST_SWEEP_INTERVAL_SECS must be greater than zero");
        }
        if self.db_max_connections == 0 {
            bail!("PODCOST_DB_MAX_CONNECTIONS must be greater than zero");
        }
        Ok(())
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
