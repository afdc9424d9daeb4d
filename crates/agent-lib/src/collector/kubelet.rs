//! Kubelet and cAdvisor stats source
//!
//! Reads per-container statistics from cAdvisor's
//! `/api/v1.3/subcontainers/` endpoint and checks kubelet `/healthz`.
//! The payload is parsed entry by entry: a malformed entry is skipped
//! without discarding the rest of the batch.

use super::StatSource;
use crate::client::HttpClient;
use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::models::{ContainerImageRef, FilesystemStat, NetworkStat, RawContainerStat};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use url::Url;

/// cAdvisor endpoint listing every cgroup with its recent samples
pub const SUBCONTAINERS_PATH: &str = "/api/v1.3/subcontainers/";

/// Memory limits at or above this are cAdvisor's "unlimited" sentinel
const UNLIMITED_MEMORY: u64 = 1 << 62;

/// Stats source backed by the node's kubelet and cAdvisor
pub struct KubeletClient {
    kubelet: HttpClient,
    cadvisor: Option<HttpClient>,
}

impl KubeletClient {
    /// Create a client from the collector configuration
    pub fn new(config: &CollectorConfig) -> Result<Self, CollectorError> {
        let kubelet_url = Url::parse(&config.kubelet_url)
            .map_err(|e| CollectorError::InvalidConfig(format!("kubelet_url: {}", e)))?;
        let kubelet = HttpClient::new(
            kubelet_url,
            config.kubelet_token_path.clone(),
            config.tls_verify,
            config.request_timeout,
        )?;

        let cadvisor = config
            .cadvisor_url()?
            .map(|url| HttpClient::new(url, None, config.tls_verify, config.request_timeout))
            .transpose()?;

        Ok(Self { kubelet, cadvisor })
    }
}

#[async_trait]
impl StatSource for KubeletClient {
    async fn fetch_stats(&self) -> Result<Vec<RawContainerStat>, CollectorError> {
        let Some(cadvisor) = &self.cadvisor else {
            return Ok(Vec::new());
        };

        let url = cadvisor.url(SUBCONTAINERS_PATH)?;
        let endpoint = url.to_string();
        let payload: serde_json::Value = cadvisor.get_json(url).await?;

        parse_subcontainers(&endpoint, payload)
    }

    async fn check_health(&self) -> Result<(), CollectorError> {
        let url = self.kubelet.url("/healthz")?;
        let endpoint = url.to_string();
        let body = self.kubelet.get_text(url).await?;

        if body.trim() == "ok" {
            Ok(())
        } else {
            Err(CollectorError::Decode {
                endpoint,
                message: format!("unexpected healthz body {:?}", body.trim()),
            })
        }
    }

    fn stats_enabled(&self) -> bool {
        self.cadvisor.is_some()
    }
}

/// Parse a `subcontainers` payload into raw stats.
///
/// The payload must be a JSON array; entries that fail to decode are
/// logged and skipped.
pub fn parse_subcontainers(
    endpoint: &str,
    payload: serde_json::Value,
) -> Result<Vec<RawContainerStat>, CollectorError> {
    let serde_json::Value::Array(entries) = payload else {
        return Err(CollectorError::Decode {
            endpoint: endpoint.to_string(),
            message: "expected a JSON array of containers".to_string(),
        });
    };

    let mut stats = Vec::with_capacity(entries.len());
    for entry in entries {
        let container: CadvisorContainer = match serde_json::from_value(entry) {
            Ok(container) => container,
            Err(e) => {
                warn!(error = %e, "Skipping unparseable cAdvisor entry");
                continue;
            }
        };

        match container.into_raw() {
            Ok(raw) => stats.push(raw),
            Err(reason) => {
                warn!(reason = %reason, "Skipping malformed cAdvisor entry");
            }
        }
    }

    Ok(stats)
}

/// Extract a container id from a cgroup name.
///
/// Handles the common runtime layouts:
/// - Docker: `/docker/<id>`
/// - systemd driver: `/kubepods.slice/.../docker-<id>.scope`
/// - CRI-O: `.../crio-<id>.scope`
/// - containerd: `.../cri-containerd-<id>.scope`
pub fn extract_container_id(cgroup_name: &str) -> Option<String> {
    let parts: Vec<&str> = cgroup_name.split('/').filter(|p| !p.is_empty()).collect();

    for part in parts.iter().rev() {
        let trimmed = part.strip_suffix(".scope").unwrap_or(part);
        let id = ["docker-", "crio-", "cri-containerd-"]
            .iter()
            .find_map(|prefix| trimmed.strip_prefix(prefix))
            .unwrap_or(trimmed);

        if id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(id.to_string());
        }
    }

    // Fall back to the last path component
    parts.last().map(|s| s.to_string())
}

#[derive(Debug, Deserialize)]
struct CadvisorContainer {
    name: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    spec: Option<CadvisorSpec>,
    #[serde(default)]
    stats: Option<Vec<CadvisorSample>>,
}

#[derive(Debug, Default, Deserialize)]
struct CadvisorSpec {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    has_filesystem: bool,
    #[serde(default)]
    cpu: Option<CpuSpec>,
    #[serde(default)]
    memory: Option<MemorySpec>,
}

#[derive(Debug, Default, Deserialize)]
struct CpuSpec {
    #[serde(default)]
    quota: u64,
    #[serde(default)]
    period: u64,
}

#[derive(Debug, Default, Deserialize)]
struct MemorySpec {
    #[serde(default)]
    limit: u64,
}

#[derive(Debug, Deserialize)]
struct CadvisorSample {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    cpu: Option<CpuStats>,
    #[serde(default)]
    memory: Option<MemoryStats>,
    #[serde(default)]
    network: Option<NetworkStats>,
    #[serde(default)]
    filesystem: Option<Vec<FsStats>>,
}

#[derive(Debug, Deserialize)]
struct CpuStats {
    usage: CpuUsage,
}

#[derive(Debug, Deserialize)]
struct CpuUsage {
    total: u64,
}

#[derive(Debug, Deserialize)]
struct MemoryStats {
    #[serde(default)]
    usage: u64,
    #[serde(default)]
    working_set: u64,
}

#[derive(Debug, Deserialize)]
struct NetworkStats {
    #[serde(default)]
    interfaces: Option<Vec<InterfaceStats>>,
    #[serde(flatten)]
    default_interface: InterfaceStats,
}

#[derive(Debug, Default, Deserialize)]
struct InterfaceStats {
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
    #[serde(default)]
    rx_errors: u64,
    #[serde(default)]
    tx_errors: u64,
}

#[derive(Debug, Deserialize)]
struct FsStats {
    #[serde(default)]
    device: String,
    #[serde(default)]
    capacity: u64,
    #[serde(default)]
    usage: u64,
}

impl CadvisorContainer {
    fn into_raw(self) -> Result<RawContainerStat, String> {
        let spec = self.spec.unwrap_or_default();
        let sample = self
            .stats
            .and_then(|mut samples| samples.pop())
            .ok_or_else(|| format!("{} has no stat samples", self.name))?;

        // Newer cAdvisor versions put labels in the spec, older ones at the top level
        let mut labels = self.labels.unwrap_or_default();
        labels.extend(spec.labels.unwrap_or_default());

        let timestamp = sample
            .timestamp
            .as_deref()
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or_else(|| chrono::Utc::now().timestamp());

        let filesystems: Vec<FilesystemStat> = sample
            .filesystem
            .unwrap_or_default()
            .into_iter()
            .map(|fs| FilesystemStat {
                device: fs.device,
                capacity: fs.capacity,
                usage: fs.usage,
            })
            .collect();

        if spec.has_filesystem && filesystems.is_empty() {
            debug!(
                container = %self.name,
                "has_filesystem is set but no filesystem stats were reported"
            );
        }

        let cpu_limit_cores = spec
            .cpu
            .filter(|cpu| cpu.quota > 0 && cpu.period > 0)
            .map(|cpu| cpu.quota as f64 / cpu.period as f64);

        let memory_limit = spec
            .memory
            .map(|m| m.limit)
            .filter(|limit| *limit > 0 && *limit < UNLIMITED_MEMORY);

        Ok(RawContainerStat {
            container_id: extract_container_id(&self.name).unwrap_or_default(),
            name: self.name,
            labels,
            image: ContainerImageRef::new(spec.image.unwrap_or_default()),
            timestamp,
            cpu_usage_total: sample.cpu.map(|cpu| cpu.usage.total),
            cpu_limit_cores,
            memory_usage: sample.memory.as_ref().map(|m| m.usage),
            memory_working_set: sample.memory.as_ref().map(|m| m.working_set),
            memory_limit,
            network: sample.network.map(NetworkStats::summed),
            has_filesystem: spec.has_filesystem,
            filesystems,
        })
    }
}

impl NetworkStats {
    /// Sum all interfaces, falling back to the default interface counters
    fn summed(self) -> NetworkStat {
        match self.interfaces {
            Some(interfaces) if !interfaces.is_empty() => {
                interfaces
                    .iter()
                    .fold(NetworkStat::default(), |mut acc, iface| {
                        acc.rx_bytes = acc.rx_bytes.saturating_add(iface.rx_bytes);
                        acc.tx_bytes = acc.tx_bytes.saturating_add(iface.tx_bytes);
                        acc.rx_errors = acc.rx_errors.saturating_add(iface.rx_errors);
                        acc.tx_errors = acc.tx_errors.saturating_add(iface.tx_errors);
                        acc
                    })
            }
            _ => NetworkStat {
                rx_bytes: self.default_interface.rx_bytes,
                tx_bytes: self.default_interface.tx_bytes,
                rx_errors: self.default_interface.rx_errors,
                tx_errors: self.default_interface.tx_errors,
            },
        }
    }
}
