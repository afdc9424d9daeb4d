//! Collector configuration
//!
//! Every polling cadence and endpoint lives here and is handed to the
//! fetchers explicitly; nothing in the pipeline reads global state.

use crate::error::CollectorError;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Labels that change on every rollout and would explode tag cardinality
pub const DEFAULT_EXCLUDED_LABELS: &[&str] = &[
    "pod-template-hash",
    "controller-revision-hash",
    "pod-template-generation",
];

/// Configuration for one collector instance
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Node this instance runs on (downward API)
    pub node_name: String,
    /// Kubelet base URL, used for `/healthz`
    pub kubelet_url: String,
    /// API server base URL
    pub apiserver_url: String,
    /// Bearer token file for the kubelet
    pub kubelet_token_path: Option<PathBuf>,
    /// Bearer token file for the API server
    pub apiserver_token_path: Option<PathBuf>,
    /// Verify TLS certificates of both endpoints
    pub tls_verify: bool,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// cAdvisor port on the kubelet host; 0 disables container stats
    pub cadvisor_port: u16,
    /// Retries after a failed stats fetch
    pub retries: u32,
    /// Fixed delay between retries
    pub retry_delay: Duration,
    /// Only retry until the first successful fetch
    pub retry_startup_only: bool,
    /// Minimum interval between topology refreshes
    pub service_tag_update_freq: Duration,
    /// Collect pod-to-service/owner topology from the API server
    pub collect_service_tags: bool,
    /// Prefix for pod label tags; empty disables label tags
    pub label_to_tag_prefix: String,
    /// Attach node labels as tags
    pub collect_node_labels_as_tags: bool,
    /// Whether an external election decides who emits cluster events
    pub leader_election_enabled: bool,
    /// Topology older than this is ignored for tagging; unbounded when `None`
    pub max_topology_staleness: Option<Duration>,
    /// Static `key:value` tags added to everything
    pub tags: Vec<String>,
    /// Cap on cluster events emitted per cycle
    pub max_events_per_cycle: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            node_name: "unknown".to_string(),
            kubelet_url: "http://localhost:10255".to_string(),
            apiserver_url: "https://kubernetes.default.svc".to_string(),
            kubelet_token_path: None,
            apiserver_token_path: None,
            tls_verify: true,
            request_timeout: Duration::from_secs(10),
            cadvisor_port: 4194,
            retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_startup_only: false,
            service_tag_update_freq: Duration::from_secs(5 * 60),
            collect_service_tags: true,
            label_to_tag_prefix: "kube_".to_string(),
            collect_node_labels_as_tags: false,
            leader_election_enabled: false,
            max_topology_staleness: None,
            tags: Vec::new(),
            max_events_per_cycle: 100,
        }
    }
}

impl CollectorConfig {
    /// Reject configuration misuse before any collection starts
    pub fn validate(&self) -> Result<(), CollectorError> {
        parse_url("kubelet_url", &self.kubelet_url)?;
        parse_url("apiserver_url", &self.apiserver_url)?;

        if let Some(bad) = self
            .label_to_tag_prefix
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')))
        {
            return Err(CollectorError::InvalidConfig(format!(
                "label_to_tag_prefix {:?} contains invalid character {:?}",
                self.label_to_tag_prefix, bad
            )));
        }

        if self.node_name.trim().is_empty() {
            return Err(CollectorError::InvalidConfig(
                "node_name must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// cAdvisor base URL derived from the kubelet host, `None` when disabled
    pub fn cadvisor_url(&self) -> Result<Option<Url>, CollectorError> {
        if self.cadvisor_port == 0 {
            return Ok(None);
        }

        let mut url = parse_url("kubelet_url", &self.kubelet_url)?;
        url.set_port(Some(self.cadvisor_port)).map_err(|_| {
            CollectorError::InvalidConfig(format!("kubelet_url {} has no host", self.kubelet_url))
        })?;
        // cAdvisor serves plain HTTP
        if url.scheme() == "https" && url.set_scheme("http").is_err() {
            return Err(CollectorError::InvalidConfig(format!(
                "cannot derive cadvisor url from {}",
                self.kubelet_url
            )));
        }
        url.set_path("/");
        Ok(Some(url))
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url, CollectorError> {
    Url::parse(raw)
        .map_err(|e| CollectorError::InvalidConfig(format!("{} {:?} is not a valid URL: {}", field, raw, e)))
}
