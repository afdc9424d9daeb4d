//! Cluster topology: which services and controllers each pod belongs to
//!
//! The API server is listed at most once per refresh interval; the result
//! is turned into an immutable [`TopologyMapping`] and swapped into a
//! [`TopologyStore`] that taggers read from.

mod apiserver;
mod fetcher;
mod mapping;

pub use apiserver::{event_timestamp, ApiServerClient};
pub use fetcher::{RefreshOutcome, TopologyFetcher, TopologyStore};
pub use mapping::{derive_owners, ImageManifest, Owner, OwnerKind, PodTopology, TopologyMapping};

use crate::error::CollectorError;
use crate::models::ClusterEvent;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use std::collections::BTreeMap;

/// One unprocessed API server listing
#[derive(Debug, Clone, Default)]
pub struct RawTopology {
    /// Pods scheduled on this node
    pub pods: Vec<Pod>,
    /// Services in all namespaces
    pub services: Vec<Service>,
    /// Labels of this node; empty unless node label tags are enabled
    pub node_labels: BTreeMap<String, String>,
}

/// Source of cluster topology and events
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn fetch_topology(&self) -> Result<RawTopology, CollectorError>;

    /// Cluster events at or after `since` (unix seconds), oldest first
    async fn fetch_events(&self, since: i64) -> Result<Vec<ClusterEvent>, CollectorError>;

    async fn check_health(&self) -> Result<(), CollectorError>;
}
