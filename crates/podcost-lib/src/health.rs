//! Component health for liveness and readiness checks
//!
//! Long-running loops report into a shared [`HealthRegistry`] after every
//! iteration. Liveness summarizes all components; readiness additionally
//! requires startup to have finished and the store to be reachable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still running, but the last iteration failed
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check: DateTime<Utc>,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status among the components
    pub fn overall(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const SCHEDULER: &str = "scheduler";
    pub const RECONCILER: &str = "reconciler";
    pub const STORE: &str = "store";
    pub const WATCHER: &str = "watcher";

    pub const ALL: [&str; 4] = [SCHEDULER, RECONCILER, STORE, WATCHER];
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Healthy on `Ok`, degraded with the error chain on `Err`
    pub async fn report<T>(&self, name: &str, result: &anyhow::Result<T>) {
        match result {
            Ok(_) => self.set_healthy(name).await,
            Err(e) => self.set_degraded(name, format!("{:#}", e)).await,
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        HealthResponse {
            status: HealthResponse::overall(&components),
            components,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let not_ready = |reason: String| ReadinessResponse {
            ready: false,
            reason: Some(reason),
        };

        if !*self.ready.read().await {
            return not_ready("Agent not yet initialized".to_string());
        }

        let components = self.components.read().await;
        if let Some(store) = components.get(components::STORE) {
            if store.status != ComponentStatus::Healthy {
                return not_ready(format!(
                    "Store unavailable: {}",
                    store.message.as_deref().unwrap_or("unknown")
                ));
            }
        }
        if let Some((name, _)) = components
            .iter()
            .find(|(_, c)| c.status == ComponentStatus::Unhealthy)
        {
            return not_ready(format!("Component {} unhealthy", name));
        }

        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with_all() -> HealthRegistry {
        let registry = HealthRegistry::new();
        for name in components::ALL {
            registry.register(name).await;
        }
        registry
    }

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let health = HealthRegistry::new().health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_worst_status_wins() {
        let registry = registry_with_all().await;

        registry.set_degraded(components::WATCHER, "stream restarted").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry.set_unhealthy(components::SCHEDULER, "stopped").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_report_result() {
        let registry = registry_with_all().await;

        let failed: anyhow::Result<()> =
            Err(anyhow::anyhow!("timeout").context("Failed to sweep Pod objects"));
        registry.report(components::RECONCILER, &failed).await;

        let health = registry.health().await;
        let reconciler = &health.components[components::RECONCILER];
        assert_eq!(reconciler.status, ComponentStatus::Degraded);
        assert_eq!(
            reconciler.message.as_deref(),
            Some("Failed to sweep Pod objects: timeout")
        );

        registry.report(components::RECONCILER, &Ok(())).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_not_ready_until_initialized() {
        let registry = registry_with_all().await;
        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_degraded_store_blocks_readiness() {
        let registry = registry_with_all().await;
        registry.set_ready(true).await;

        registry.set_degraded(components::WATCHER, "relisting").await;
        assert!(registry.readiness().await.ready);

        registry.set_degraded(components::STORE, "connection refused").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.unwrap().contains("connection refused"));
    }
}
