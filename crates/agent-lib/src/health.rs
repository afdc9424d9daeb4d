//! Liveness and readiness state for the agent
//!
//! Components report here after every cycle. `/healthz` reads the worst
//! component status, `/readyz` additionally waits for the first completed
//! cycle.

use crate::models::{CheckTarget, ServiceCheck, ServiceCheckStatus};
use crate::topology::RefreshOutcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but a dependency is unreachable or data is stale
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// An endpoint the agent cannot reach degrades it but never makes it
/// unhealthy: restarting the agent would not bring the endpoint back.
impl From<&ServiceCheck> for ComponentHealth {
    fn from(check: &ServiceCheck) -> Self {
        match check.status {
            ServiceCheckStatus::Ok => Self::healthy(),
            ServiceCheckStatus::Warning | ServiceCheckStatus::Critical => Self::degraded(
                check
                    .message
                    .clone()
                    .unwrap_or_else(|| check.status.to_string()),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    fn from_components(components: BTreeMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        Self { status, components }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const COLLECTOR: &str = "collector";
    pub const KUBELET: &str = "kubelet";
    pub const APISERVER: &str = "apiserver";
    pub const TOPOLOGY: &str = "topology";
}

#[derive(Debug, Default)]
struct HealthState {
    components: BTreeMap<String, ComponentHealth>,
    ready: bool,
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `name` as healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.state
            .write()
            .await
            .components
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

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    /// Record one cycle's kubelet and API server checks. Targets with no
    /// check this cycle keep their previous state.
    pub async fn apply_service_checks(&self, checks: &[ServiceCheck]) {
        let mut state = self.state.write().await;
        for (target, component) in [
            (CheckTarget::Kubelet, components::KUBELET),
            (CheckTarget::ApiServer, components::APISERVER),
        ] {
            if let Some(check) = checks.iter().find(|c| c.check == target.check_name()) {
                state
                    .components
                    .insert(component.to_string(), ComponentHealth::from(check));
            }
        }
    }

    pub async fn apply_topology(&self, outcome: &RefreshOutcome) {
        match outcome {
            RefreshOutcome::Refreshed { .. } => self.set_healthy(components::TOPOLOGY).await,
            RefreshOutcome::Failed(error) => {
                self.set_degraded(components::TOPOLOGY, format!("serving stale topology: {}", error))
                    .await
            }
            RefreshOutcome::Unchanged | RefreshOutcome::Disabled => {}
        }
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse::from_components(self.state.read().await.components.clone())
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let (ready, status) = {
            let state = self.state.read().await;
            let status = state.components.values().map(|c| c.status).max();
            (state.ready, status)
        };

        let reason = if !ready {
            Some("No collection cycle completed yet")
        } else if status == Some(ComponentStatus::Unhealthy) {
            Some("Critical component unhealthy")
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(target: CheckTarget, status: ServiceCheckStatus, message: Option<&str>) -> ServiceCheck {
        ServiceCheck {
            check: target.check_name().to_string(),
            status,
            message: message.map(str::to_string),
            tags: Default::default(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_empty_registry_is_healthy_but_not_ready() {
        let registry = HealthRegistry::new();

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let registry = HealthRegistry::new();
        registry.register(components::COLLECTOR).await;
        registry.register(components::TOPOLOGY).await;

        registry.set_degraded(components::TOPOLOGY, "stale").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry.set_unhealthy(components::COLLECTOR, "Collection loop stopped").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_unhealthy_component_blocks_readiness() {
        let registry = HealthRegistry::new();
        registry.register(components::COLLECTOR).await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.set_unhealthy(components::COLLECTOR, "Failed").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Critical component unhealthy"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoints_degrade_but_stay_ready() {
        let registry = HealthRegistry::new();
        registry.register(components::COLLECTOR).await;
        registry.set_ready(true).await;

        registry
            .apply_service_checks(&[
                check(CheckTarget::Kubelet, ServiceCheckStatus::Critical, Some("connection refused")),
                check(CheckTarget::ApiServer, ServiceCheckStatus::Ok, None),
            ])
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            health.components[components::KUBELET].message.as_deref(),
            Some("connection refused")
        );
        assert_eq!(
            health.components[components::APISERVER].status,
            ComponentStatus::Healthy
        );
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_missing_check_keeps_previous_state() {
        let registry = HealthRegistry::new();
        registry
            .apply_service_checks(&[check(CheckTarget::ApiServer, ServiceCheckStatus::Warning, None)])
            .await;
        registry
            .apply_service_checks(&[check(CheckTarget::Kubelet, ServiceCheckStatus::Ok, None)])
            .await;

        let health = registry.health().await;
        let apiserver = &health.components[components::APISERVER];
        assert_eq!(apiserver.status, ComponentStatus::Degraded);
        assert_eq!(apiserver.message.as_deref(), Some("WARNING"));
    }

    #[tokio::test]
    async fn test_topology_failure_marks_stale() {
        let registry = HealthRegistry::new();
        registry
            .apply_topology(&RefreshOutcome::Refreshed { pods: 3 })
            .await;
        registry.apply_topology(&RefreshOutcome::Unchanged).await;
        assert_eq!(
            registry.health().await.components[components::TOPOLOGY].status,
            ComponentStatus::Healthy
        );

        registry
            .apply_topology(&RefreshOutcome::Failed("HTTP 503".to_string()))
            .await;
        let health = registry.health().await;
        assert_eq!(
            health.components[components::TOPOLOGY].status,
            ComponentStatus::Degraded
        );
        assert_eq!(
            health.components[components::TOPOLOGY].message.as_deref(),
            Some("serving stale topology: HTTP 503")
        );
    }
}
