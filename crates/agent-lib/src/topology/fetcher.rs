//! Rate-limited topology refresh

use super::{TopologyMapping, TopologySource};
use crate::config::CollectorConfig;
use crate::models::{CheckTarget, ServiceCheckResult};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shared handle to the current topology mapping.
///
/// Readers get a cheap `Arc` snapshot; a refresh swaps in a new mapping so
/// readers never observe a half-built one.
#[derive(Debug, Clone)]
pub struct TopologyStore {
    current: Arc<RwLock<Arc<TopologyMapping>>>,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyStore {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(TopologyMapping::empty()))),
        }
    }

    pub fn snapshot(&self) -> Arc<TopologyMapping> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, mapping: TopologyMapping) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(mapping);
    }
}

/// What a refresh call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new mapping was installed
    Refreshed { pods: usize },
    /// The refresh interval has not elapsed
    Unchanged,
    /// The API server could not be listed; the previous mapping is kept
    Failed(String),
    /// Topology collection is switched off
    Disabled,
}

/// Topology fetcher for one node
pub struct TopologyFetcher {
    source: Arc<dyn TopologySource>,
    store: TopologyStore,
    update_freq: Duration,
    enabled: bool,
    last_refresh: Option<Instant>,
}

impl TopologyFetcher {
    pub fn new(
        source: Arc<dyn TopologySource>,
        store: TopologyStore,
        update_freq: Duration,
        enabled: bool,
    ) -> Self {
        Self {
            source,
            store,
            update_freq,
            enabled,
            last_refresh: None,
        }
    }

    pub fn from_config(
        config: &CollectorConfig,
        source: Arc<dyn TopologySource>,
        store: TopologyStore,
    ) -> Self {
        Self::new(
            source,
            store,
            config.service_tag_update_freq,
            config.collect_service_tags,
        )
    }

    /// Whether the next refresh would hit the API server
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_refresh {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.update_freq,
        }
    }

    pub async fn refresh(&mut self, force: bool) -> RefreshOutcome {
        self.refresh_at(force, Instant::now()).await
    }

    /// Rebuild the mapping when due, or unconditionally when `force` is set.
    ///
    /// On failure the previous mapping stays installed and the next call
    /// tries again.
    pub async fn refresh_at(&mut self, force: bool, now: Instant) -> RefreshOutcome {
        if !self.enabled {
            return RefreshOutcome::Disabled;
        }
        if !force && !self.is_due(now) {
            debug!("Topology refresh not due");
            return RefreshOutcome::Unchanged;
        }

        match self.source.fetch_topology().await {
            Ok(raw) => {
                let mapping = TopologyMapping::build(raw, now);
                let pods = mapping.pod_count();
                self.store.replace(mapping);
                self.last_refresh = Some(now);
                info!(pods, "Topology refreshed");
                RefreshOutcome::Refreshed { pods }
            }
            Err(e) => {
                warn!(error = %e, "Topology refresh failed, keeping previous mapping");
                RefreshOutcome::Failed(e.to_string())
            }
        }
    }

    /// Check API server liveness
    pub async fn health_check(&self) -> ServiceCheckResult {
        match self.source.check_health().await {
            Ok(()) => ServiceCheckResult::ok(CheckTarget::ApiServer),
            Err(e) if e.is_transient() => {
                ServiceCheckResult::critical(CheckTarget::ApiServer, e.to_string())
            }
            Err(e) => ServiceCheckResult::warning(CheckTarget::ApiServer, e.to_string()),
        }
    }

    pub fn source(&self) -> &Arc<dyn TopologySource> {
        &self.source
    }

    pub fn store(&self) -> &TopologyStore {
        &self.store
    }
}
