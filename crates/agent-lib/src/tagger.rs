//! Tag resolution for pods and containers
//!
//! Tags are layered, later layers owning their keys outright:
//!
//! 1. static tags from configuration
//! 2. node labels (`{prefix}node_{label}`)
//! 3. pod labels (`{prefix}{label}`)
//! 4. topology tags (`kube_service`, owner tags)
//! 5. intrinsic tags (`kube_namespace`, `pod_name`, `kube_container_name`)

use crate::config::{CollectorConfig, DEFAULT_EXCLUDED_LABELS};
use crate::tags::{pod_name_tag_value, Tag, TagSet};
use crate::topology::{PodTopology, TopologyMapping, TopologyStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Resolves tag sets against the current topology snapshot
#[derive(Debug, Clone)]
pub struct TagResolver {
    store: TopologyStore,
    static_tags: TagSet,
    /// Empty disables pod and node label tags
    label_prefix: String,
    excluded_labels: BTreeSet<String>,
    node_labels_as_tags: bool,
    max_staleness: Option<Duration>,
    empty: Arc<TopologyMapping>,
}

impl TagResolver {
    pub fn new(store: TopologyStore, config: &CollectorConfig) -> Self {
        Self {
            store,
            static_tags: TagSet::from_strings(&config.tags),
            label_prefix: config.label_to_tag_prefix.clone(),
            excluded_labels: DEFAULT_EXCLUDED_LABELS.iter().map(|l| l.to_string()).collect(),
            node_labels_as_tags: config.collect_node_labels_as_tags,
            max_staleness: config.max_topology_staleness,
            empty: Arc::new(TopologyMapping::empty()),
        }
    }

    pub fn static_tags(&self) -> &TagSet {
        &self.static_tags
    }

    pub fn snapshot(&self) -> Arc<TopologyMapping> {
        self.snapshot_at(Instant::now())
    }

    /// Current mapping, or the empty mapping when it is older than the
    /// staleness bound
    pub fn snapshot_at(&self, now: Instant) -> Arc<TopologyMapping> {
        let mapping = self.store.snapshot();
        match (self.max_staleness, mapping.age(now)) {
            (Some(max), Some(age)) if age > max => {
                debug!(age_secs = age.as_secs(), "Topology too stale, ignoring for tagging");
                self.empty.clone()
            }
            _ => mapping,
        }
    }

    /// Tags for one container of a pod
    pub fn resolve(&self, namespace: &str, pod_name: &str, container_name: &str) -> TagSet {
        self.resolve_in(&self.snapshot(), namespace, pod_name, container_name)
    }

    /// Like [`resolve`](Self::resolve) against a mapping the caller already
    /// holds, so one batch sees one snapshot
    pub fn resolve_in(
        &self,
        mapping: &TopologyMapping,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
    ) -> TagSet {
        let mut tags = self.pod_tags(mapping, namespace, pod_name);
        if !container_name.is_empty() {
            tags.set("kube_container_name", container_name);
        }
        tags
    }

    /// Tags for a pod, without container-level tags.
    ///
    /// A pod missing from the mapping gets static, node and intrinsic tags
    /// only.
    pub fn pod_tags(&self, mapping: &TopologyMapping, namespace: &str, pod_name: &str) -> TagSet {
        let mut tags = self.static_tags.clone();
        tags.merge(&self.node_label_tags(mapping.node_labels()));

        if let Some(pod) = mapping.pod(namespace, pod_name_tag_value(namespace, pod_name)) {
            tags.merge(&self.label_tags(&pod.labels));
            tags.merge(&topology_tags(pod));
        }

        tags.merge(&intrinsic_tags(namespace, pod_name));
        tags
    }

    fn label_tags(&self, labels: &BTreeMap<String, String>) -> TagSet {
        if self.label_prefix.is_empty() {
            return TagSet::new();
        }
        labels
            .iter()
            .filter(|(key, _)| !self.excluded_labels.contains(key.as_str()))
            .filter(|(key, _)| is_valid_label_key(key))
            .map(|(key, value)| {
                Tag::new(format!("{}{}", self.label_prefix, key), value.clone())
            })
            .collect()
    }

    fn node_label_tags(&self, labels: &BTreeMap<String, String>) -> TagSet {
        if !self.node_labels_as_tags || self.label_prefix.is_empty() {
            return TagSet::new();
        }
        labels
            .iter()
            .filter(|(key, _)| is_valid_label_key(key))
            .map(|(key, value)| {
                Tag::new(format!("{}node_{}", self.label_prefix, key), value.clone())
            })
            .collect()
    }
}

/// Label keys that would produce malformed tags are dropped
fn is_valid_label_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(':') && !key.chars().any(char::is_whitespace)
}

fn topology_tags(pod: &PodTopology) -> TagSet {
    let mut tags = TagSet::new();
    for service in &pod.services {
        tags.insert("kube_service", service.as_str());
    }
    for owner in &pod.owners {
        tags.insert(owner.kind.tag_key(), owner.name.as_str());
    }
    tags
}

fn intrinsic_tags(namespace: &str, pod_name: &str) -> TagSet {
    let mut tags = TagSet::new();
    if !namespace.is_empty() {
        tags.set("kube_namespace", namespace);
    }
    if !pod_name.is_empty() {
        tags.set("pod_name", pod_name_tag_value(namespace, pod_name));
    }
    tags
}
