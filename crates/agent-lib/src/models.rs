//! Core data models for the kubelet agent

use crate::tags::TagSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Runtime label carrying the pod name
pub const LABEL_POD_NAME: &str = "io.kubernetes.pod.name";
/// Runtime label carrying the pod namespace
pub const LABEL_POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";
/// Runtime label carrying the pod UID
pub const LABEL_POD_UID: &str = "io.kubernetes.pod.uid";
/// Runtime label carrying the container name
pub const LABEL_CONTAINER_NAME: &str = "io.kubernetes.container.name";

/// Filesystem usage for one device of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemStat {
    pub device: String,
    pub capacity: u64,
    pub usage: u64,
}

/// Network counters summed over a container's interfaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStat {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

/// One stat sample per cgroup entry per cycle, as reported by cAdvisor.
///
/// Entries are not guaranteed to be containers: cAdvisor also reports the
/// cgroup root, system slices and pod-level cgroups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawContainerStat {
    /// cgroup name, e.g. `/kubepods/burstable/pod<uid>/<id>`
    pub name: String,
    pub container_id: String,
    /// Runtime labels (`io.kubernetes.*`)
    pub labels: BTreeMap<String, String>,
    pub image: ContainerImageRef,
    pub timestamp: i64,
    /// Cumulative CPU time in nanoseconds
    pub cpu_usage_total: Option<u64>,
    pub cpu_limit_cores: Option<f64>,
    pub memory_usage: Option<u64>,
    pub memory_working_set: Option<u64>,
    pub memory_limit: Option<u64>,
    pub network: Option<NetworkStat>,
    pub has_filesystem: bool,
    pub filesystems: Vec<FilesystemStat>,
}

impl RawContainerStat {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn pod_name(&self) -> Option<&str> {
        self.label(LABEL_POD_NAME)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.label(LABEL_POD_NAMESPACE)
    }

    pub fn container_name(&self) -> Option<&str> {
        self.label(LABEL_CONTAINER_NAME)
    }
}

/// A container's declared image: a human-readable reference or a content digest
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerImageRef(String);

impl ContainerImageRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Content digest in `sha256:<hex>` form, when the reference carries one.
    ///
    /// Recognizes `sha256:<hex>`, a bare 64-char hex id and `repo@sha256:<hex>`.
    pub fn digest(&self) -> Option<String> {
        normalize_digest(&self.0)
    }

    /// True when the reference is nothing but a digest
    pub fn is_digest_only(&self) -> bool {
        self.digest().is_some() && !self.0.contains('@')
    }
}

impl fmt::Display for ContainerImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize any digest-bearing reference to `sha256:<lowercase hex>`
pub fn normalize_digest(reference: &str) -> Option<String> {
    let reference = reference.trim();
    let candidate = match reference.rsplit_once('@') {
        Some((_, digest)) => digest,
        None => reference,
    };
    // Runtime scheme prefixes such as `docker-pullable://`
    let candidate = candidate
        .rsplit_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(candidate);
    let hex = candidate.strip_prefix("sha256:").unwrap_or(candidate);

    if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("sha256:{}", hex.to_ascii_lowercase()))
    } else {
        None
    }
}

/// A normalized metric data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub tags: TagSet,
    pub timestamp: i64,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64, tags: TagSet, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value,
            tags,
            timestamp,
        }
    }
}

/// Alert level of an emitted event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAlertType {
    Info,
    Warning,
}

/// An event handed to the submission transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub title: String,
    pub text: String,
    pub tags: TagSet,
    pub timestamp: i64,
    pub alert_type: EventAlertType,
    /// Groups repeated events about the same object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation_key: Option<String>,
}

/// A cluster event as listed from the API server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub reason: String,
    pub message: String,
    /// `Normal` or `Warning`
    pub event_type: String,
    pub timestamp: i64,
    /// UID of the involved object
    pub uid: Option<String>,
    /// UID of the event object itself
    #[serde(default)]
    pub event_uid: Option<String>,
}

impl ClusterEvent {
    /// Identity used to avoid emitting the same event twice
    pub fn key(&self) -> String {
        match &self.event_uid {
            Some(uid) => uid.clone(),
            None => format!(
                "{}/{}/{}/{}/{}/{}",
                self.namespace, self.kind, self.name, self.reason, self.timestamp, self.message
            ),
        }
    }
}

/// Tri-state health signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceCheckStatus {
    Ok,
    Warning,
    Critical,
}

impl ServiceCheckStatus {
    /// The more severe of two statuses
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for ServiceCheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceCheckStatus::Ok => write!(f, "OK"),
            ServiceCheckStatus::Warning => write!(f, "WARNING"),
            ServiceCheckStatus::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Monitored health targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckTarget {
    Kubelet,
    ApiServer,
}

impl CheckTarget {
    pub fn check_name(&self) -> &'static str {
        match self {
            CheckTarget::Kubelet => "kubernetes.kubelet.check",
            CheckTarget::ApiServer => "kubernetes.apiserver.check",
        }
    }
}

/// Outcome of probing one target during a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCheckResult {
    pub target: CheckTarget,
    pub status: ServiceCheckStatus,
    pub message: Option<String>,
    pub tags: TagSet,
}

impl ServiceCheckResult {
    pub fn ok(target: CheckTarget) -> Self {
        Self {
            target,
            status: ServiceCheckStatus::Ok,
            message: None,
            tags: TagSet::new(),
        }
    }

    pub fn warning(target: CheckTarget, message: impl Into<String>) -> Self {
        Self {
            target,
            status: ServiceCheckStatus::Warning,
            message: Some(message.into()),
            tags: TagSet::new(),
        }
    }

    pub fn critical(target: CheckTarget, message: impl Into<String>) -> Self {
        Self {
            target,
            status: ServiceCheckStatus::Critical,
            message: Some(message.into()),
            tags: TagSet::new(),
        }
    }
}

/// A service check handed to the submission transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCheck {
    pub check: String,
    pub status: ServiceCheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub tags: TagSet,
    pub timestamp: i64,
}

/// Result of one stat fetch, including the retries it took
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchStatus {
    pub status: ServiceCheckStatus,
    pub message: Option<String>,
    pub attempts: u32,
}

impl FetchStatus {
    pub fn ok(attempts: u32) -> Self {
        Self {
            status: ServiceCheckStatus::Ok,
            message: None,
            attempts,
        }
    }

    pub fn warning(message: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: ServiceCheckStatus::Warning,
            message: Some(message.into()),
            attempts,
        }
    }

    pub fn critical(message: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: ServiceCheckStatus::Critical,
            message: Some(message.into()),
            attempts,
        }
    }

    /// Stats collection switched off (`cadvisor_port = 0`)
    pub fn disabled() -> Self {
        Self {
            status: ServiceCheckStatus::Ok,
            message: Some("cadvisor disabled".to_string()),
            attempts: 0,
        }
    }

    /// Retries performed beyond the first attempt
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn is_critical(&self) -> bool {
        self.status == ServiceCheckStatus::Critical
    }
}

/// Whether this instance is the elected leader for the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeaderState(pub bool);

impl LeaderState {
    pub fn is_leader(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "4f2c2d29e0e1b2c3d4e5f60718293a4b5c6d7e8f9a0b1c2d3e4f5a6b7c8d9e0f";

    #[test]
    fn test_digest_forms() {
        let expected = format!("sha256:{}", HEX);
        assert_eq!(ContainerImageRef::new(HEX).digest(), Some(expected.clone()));
        assert_eq!(
            ContainerImageRef::new(format!("sha256:{}", HEX)).digest(),
            Some(expected.clone())
        );
        assert_eq!(
            ContainerImageRef::new(format!("nginx@sha256:{}", HEX)).digest(),
            Some(expected.clone())
        );
        assert_eq!(
            normalize_digest(&format!("docker-pullable://nginx@sha256:{}", HEX)),
            Some(expected)
        );
        assert_eq!(ContainerImageRef::new("nginx:1.21").digest(), None);
    }

    #[test]
    fn test_digest_only() {
        assert!(ContainerImageRef::new(HEX).is_digest_only());
        assert!(!ContainerImageRef::new(format!("nginx@sha256:{}", HEX)).is_digest_only());
        assert!(!ContainerImageRef::new("nginx:1.21").is_digest_only());
    }

    #[test]
    fn test_status_ordering() {
        assert_eq!(
            ServiceCheckStatus::Ok.worst(ServiceCheckStatus::Critical),
            ServiceCheckStatus::Critical
        );
        assert_eq!(
            ServiceCheckStatus::Warning.worst(ServiceCheckStatus::Ok),
            ServiceCheckStatus::Warning
        );
    }

    #[test]
    fn test_fetch_status_retries() {
        assert_eq!(FetchStatus::critical("down", 3).retries(), 2);
        assert_eq!(FetchStatus::ok(1).retries(), 0);
        assert_eq!(FetchStatus::disabled().retries(), 0);
    }
}
