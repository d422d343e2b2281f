//! podcost agent
//!
//! Runs as a single Deployment per cluster: watches cluster objects, polls
//! every node's kubelet resource metrics, stores hourly usage in PostgreSQL
//! and serves workload cost aggregations.

use anyhow::{Context, Result};
use podcost_agent::{
    api,
    cluster::{self, KubeletMetricsSource, WatchCache},
    config::AgentConfig,
};
use podcost_lib::{
    health::{components, HealthRegistry},
    ObjectKind, ObjectReconciler, PgStore, ScrapeScheduler, Store, StructuredLogger, Sweeper,
    WorkloadIdentityCache,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffered notifications between the watchers and the reconciler
const EVENT_BUFFER: usize = 1024;

const STORE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting podcost-agent");

    let config = AgentConfig::load()?;
    info!(
        api_port = config.api_port,
        scrape_interval_secs = config.scrape_interval_secs,
        sweep_interval_secs = config.sweep_interval_secs,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    for name in components::ALL {
        health_registry.register(name).await;
    }

    let logger = StructuredLogger::new(&config.instance);

    let pg = PgStore::connect(&config.database_url, config.db_max_connections).await?;
    pg.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(pg);

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let identities = Arc::new(WorkloadIdentityCache::new());
    let scheduler = Arc::new(
        ScrapeScheduler::new(logger.clone(), config.disable_scrape_jitter)
            .with_health(health_registry.clone()),
    );
    let reconciler = Arc::new(
        ObjectReconciler::new(store.clone(), identities.clone()).with_node_scraping(
            scheduler.clone(),
            Arc::new(KubeletMetricsSource::new(client.clone())),
            config.scrape_interval(),
        ),
    );

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let watch_cache = Arc::new(WatchCache::new());

    let reconciler_handle = tokio::spawn(reconciler.clone().run(
        events_rx,
        health_registry.clone(),
        shutdown_tx.subscribe(),
    ));
    let watcher_handles = cluster::spawn_watchers(
        client,
        events_tx,
        watch_cache.clone(),
        health_registry.clone(),
        &shutdown_tx,
    );

    let sweeper = Sweeper::new(
        store.clone(),
        watch_cache,
        reconciler.clone(),
        config.sweep_interval(),
        logger.clone(),
    );
    let sweeper_handle = tokio::spawn(sweeper.run(health_registry.clone(), shutdown_tx.subscribe()));

    let store_check_handle = tokio::spawn(check_store(
        store.clone(),
        health_registry.clone(),
        shutdown_tx.subscribe(),
    ));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), store));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    health_registry.set_ready(true).await;
    logger.log_startup(AGENT_VERSION, ObjectKind::ALL.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    logger.log_shutdown("SIGINT received");

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());
    scheduler.shutdown();

    for handle in watcher_handles {
        let _ = handle.await;
    }
    let _ = reconciler_handle.await;
    let _ = sweeper_handle.await;
    let _ = store_check_handle.await;
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Keep the store component current so readiness follows database outages
async fn check_store(
    store: Arc<dyn Store>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(STORE_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = store.ping().await;
                health.report(components::STORE, &result).await;
            }
            _ = shutdown.recv() => break,
        }
    }
}
