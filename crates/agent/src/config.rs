//! Agent configuration
//!
//! Loaded from an optional file named by `AGENT_CONFIG_FILE`, overridden by
//! `AGENT_*` environment variables (`AGENT_KUBELET_URL`, `AGENT_RETRIES`, ...).

use anyhow::{Context, Result};
use kubelet_agent_lib::CollectorConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Collection interval in seconds
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,

    /// Maximum start delay in milliseconds
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_kubelet_url")]
    pub kubelet_url: String,

    #[serde(default = "default_apiserver_url")]
    pub apiserver_url: String,

    #[serde(default)]
    pub kubelet_token_path: Option<PathBuf>,

    #[serde(default = "default_apiserver_token_path")]
    pub apiserver_token_path: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub tls_verify: bool,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// 0 disables container stats
    #[serde(default = "default_cadvisor_port")]
    pub cadvisor_port: u16,

    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Delay between stat fetch retries in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub retry_startup_only: bool,

    #[serde(default = "default_service_tag_update_freq")]
    pub service_tag_update_freq: u64,

    #[serde(default = "default_true")]
    pub collect_service_tags: bool,

    #[serde(default = "default_label_prefix")]
    pub label_to_tag_prefix: String,

    #[serde(default)]
    pub collect_node_labels_as_tags: bool,

    #[serde(default)]
    pub max_topology_staleness_secs: Option<u64>,

    #[serde(default)]
    pub leader_election_enabled: bool,

    /// Marker file an election sidecar holds while this instance leads
    #[serde(default)]
    pub leader_file: Option<PathBuf>,

    /// Static `key:value` tags; comma-separated in the environment
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default = "default_max_events")]
    pub max_events_per_cycle: usize,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_collection_interval() -> u64 {
    15
}

fn default_jitter_ms() -> u64 {
    1000
}

fn default_kubelet_url() -> String {
    "http://localhost:10255".to_string()
}

fn default_apiserver_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_apiserver_token_path() -> Option<PathBuf> {
    Some(PathBuf::from(
        "/var/run/secrets/kubernetes.io/serviceaccount/token",
    ))
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    10
}

fn default_cadvisor_port() -> u16 {
    4194
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_service_tag_update_freq() -> u64 {
    300
}

fn default_label_prefix() -> String {
    "kube_".to_string()
}

fn default_max_events() -> usize {
    100
}

impl AgentConfig {
    /// Load configuration from environment and config file
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Ok(path) = std::env::var("AGENT_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("AGENT")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("tags"),
            )
            .build()
            .context("Failed to read agent configuration")?;

        let agent: AgentConfig = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        agent.validate()?;
        Ok(agent)
    }

    /// Fail fast on settings the collector would reject later
    pub fn validate(&self) -> Result<()> {
        if self.collection_interval_secs == 0 {
            anyhow::bail!("collection_interval_secs must be greater than zero");
        }
        if self.leader_election_enabled && self.leader_file.is_none() {
            anyhow::bail!("leader_election_enabled requires leader_file to be set");
        }
        self.collector_config()
            .validate()
            .context("Invalid collector configuration")?;
        Ok(())
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            node_name: self.node_name.clone(),
            kubelet_url: self.kubelet_url.clone(),
            apiserver_url: self.apiserver_url.clone(),
            kubelet_token_path: self.kubelet_token_path.clone(),
            apiserver_token_path: self.apiserver_token_path.clone(),
            tls_verify: self.tls_verify,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            cadvisor_port: self.cadvisor_port,
            retries: self.retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            retry_startup_only: self.retry_startup_only,
            service_tag_update_freq: Duration::from_secs(self.service_tag_update_freq),
            collect_service_tags: self.collect_service_tags,
            label_to_tag_prefix: self.label_to_tag_prefix.clone(),
            collect_node_labels_as_tags: self.collect_node_labels_as_tags,
            leader_election_enabled: self.leader_election_enabled,
            max_topology_staleness: self.max_topology_staleness_secs.map(Duration::from_secs),
            tags: self.tags.clone(),
            max_events_per_cycle: self.max_events_per_cycle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn from_file(contents: &str) -> Result<AgentConfig> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        file.write_all(contents.as_bytes())?;
        let config = config::Config::builder()
            .add_source(config::File::from(file.path()))
            .build()?;
        let agent: AgentConfig = config.try_deserialize()?;
        agent.validate()?;
        Ok(agent)
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let agent = from_file("").unwrap();
        let collector = agent.collector_config();

        assert_eq!(agent.collection_interval(), Duration::from_secs(15));
        assert_eq!(collector.cadvisor_port, 4194);
        assert_eq!(collector.service_tag_update_freq, Duration::from_secs(300));
        assert!(collector.collect_service_tags);
        assert!(collector.max_topology_staleness.is_none());
        assert!(!collector.retry_startup_only);
    }

    #[test]
    fn test_file_values_flow_into_collector_config() {
        let agent = from_file(
            r#"
            node_name = "node-a"
            cadvisor_port = 0
            retries = 5
            retry_delay_ms = 250
            label_to_tag_prefix = ""
            max_topology_staleness_secs = 900
            tags = ["env:prod", "team:infra"]
            "#,
        )
        .unwrap();
        let collector = agent.collector_config();

        assert_eq!(collector.node_name, "node-a");
        assert_eq!(collector.cadvisor_port, 0);
        assert_eq!(collector.retries, 5);
        assert_eq!(collector.retry_delay, Duration::from_millis(250));
        assert_eq!(collector.label_to_tag_prefix, "");
        assert_eq!(collector.max_topology_staleness, Some(Duration::from_secs(900)));
        assert_eq!(collector.tags, vec!["env:prod", "team:infra"]);
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        assert!(from_file(r#"label_to_tag_prefix = "kube:""#).is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(from_file("collection_interval_secs = 0").is_err());
    }

    #[test]
    fn test_election_requires_leader_file() {
        assert!(from_file("leader_election_enabled = true").is_err());

        let agent = from_file(
            r#"
            leader_election_enabled = true
            leader_file = "/var/run/kubelet-agent/leader"
            "#,
        )
        .unwrap();
        assert!(agent.collector_config().leader_election_enabled);
    }
}
