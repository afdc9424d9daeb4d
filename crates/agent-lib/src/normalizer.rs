//! Raw stat normalization
//!
//! Turns one cycle's cAdvisor entries into tagged metrics:
//! - drops cgroup roots, system slices, pod-level cgroups and pause containers
//! - resolves digest image references through the topology image manifest
//! - computes network deltas against the previous sample of each container
//! - emits filesystem usage only for entries that really have a filesystem

use crate::models::{Metric, NetworkStat, RawContainerStat};
use crate::tagger::TagResolver;
use crate::tags::TagSet;
use crate::topology::{ImageManifest, TopologyMapping};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Name of the pause (sandbox) container in runtime labels
const SANDBOX_CONTAINER: &str = "POD";

/// Pod identity of a real container entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity<'a> {
    pub namespace: &'a str,
    pub pod_name: &'a str,
    pub container_name: &'a str,
    pub container_id: &'a str,
}

/// What a raw cAdvisor entry turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind<'a> {
    Container(ContainerIdentity<'a>),
    /// cgroup root, system slice, pod cgroup or sandbox
    NonContainer,
    /// Looks like a container but cannot be attributed
    Malformed(String),
}

/// Classify a raw entry by its runtime labels
pub fn classify(raw: &RawContainerStat) -> EntryKind<'_> {
    if raw.name == "/" {
        return EntryKind::NonContainer;
    }

    let (Some(namespace), Some(pod_name)) = (raw.namespace(), raw.pod_name()) else {
        return EntryKind::NonContainer;
    };
    let container_name = match raw.container_name() {
        None | Some(SANDBOX_CONTAINER) | Some("") => return EntryKind::NonContainer,
        Some(name) => name,
    };

    if namespace.is_empty() || pod_name.is_empty() {
        return EntryKind::Malformed(format!("{} has empty pod identity labels", raw.name));
    }
    if raw.container_id.is_empty() {
        return EntryKind::Malformed(format!("{} has no container id", raw.name));
    }

    EntryKind::Container(ContainerIdentity {
        namespace,
        pod_name,
        container_name,
        container_id: &raw.container_id,
    })
}

/// Image tags for a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTags {
    /// Human-readable reference when known, otherwise the raw reference
    pub container_image: String,
    pub image_name: Option<String>,
    pub short_image: Option<String>,
    pub image_tag: Option<String>,
}

impl ImageTags {
    fn apply(&self, tags: &mut TagSet) {
        tags.set("container_image", self.container_image.as_str());
        if let Some(name) = &self.image_name {
            tags.set("image_name", name.as_str());
        }
        if let Some(short) = &self.short_image {
            tags.set("short_image", short.as_str());
        }
        if let Some(tag) = &self.image_tag {
            tags.set("image_tag", tag.as_str());
        }
    }
}

/// Resolve the image of a raw entry.
///
/// Digest references are looked up in the manifest; an unresolved digest is
/// kept as-is rather than dropped. `None` only when the runtime reported no
/// image at all.
pub fn resolve_image(raw: &RawContainerStat, manifest: &ImageManifest) -> Option<ImageTags> {
    if raw.image.is_empty() {
        return None;
    }

    let reference = if raw.image.digest().is_some() {
        manifest
            .resolve(raw.image.as_str())
            .unwrap_or(raw.image.as_str())
    } else {
        raw.image.as_str()
    };

    if raw.image.is_digest_only() && reference == raw.image.as_str() {
        return Some(ImageTags {
            container_image: reference.to_string(),
            image_name: None,
            short_image: None,
            image_tag: None,
        });
    }

    let (name, tag) = split_image(reference);
    let short = name.rsplit('/').next().unwrap_or(name);
    Some(ImageTags {
        container_image: reference.to_string(),
        image_name: Some(name.to_string()),
        short_image: Some(short.to_string()),
        image_tag: tag.map(str::to_string),
    })
}

/// Split `registry:port/repo:tag@digest` into repository and tag.
/// A colon before the last `/` belongs to the registry port.
pub fn split_image(reference: &str) -> (&str, Option<&str>) {
    let without_digest = reference.split('@').next().unwrap_or(reference);
    let name_start = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);

    match without_digest[name_start..].rfind(':') {
        Some(i) => {
            let colon = name_start + i;
            let tag = &without_digest[colon + 1..];
            (&without_digest[..colon], (!tag.is_empty()).then_some(tag))
        }
        None => (without_digest, None),
    }
}

/// Previous network sample per container id
#[derive(Debug, Default)]
pub struct SampleRegistry {
    samples: DashMap<String, NetworkStat>,
}

impl SampleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `current` and return the sample it replaces
    pub fn swap(&self, container_id: &str, current: NetworkStat) -> Option<NetworkStat> {
        self.samples.insert(container_id.to_string(), current)
    }

    /// Forget every container not in `live`
    pub fn retain_live(&self, live: &HashSet<&str>) {
        let before = self.samples.len();
        self.samples.retain(|id, _| live.contains(id.as_str()));
        let evicted = before.saturating_sub(self.samples.len());
        if evicted > 0 {
            debug!(evicted, "Evicted network samples of departed containers");
        }
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.samples.contains_key(container_id)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Result of normalizing one batch
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub metrics: Vec<Metric>,
    /// Real containers that produced metrics
    pub containers: usize,
    /// Entries skipped as non-containers
    pub non_containers: usize,
    /// Entries skipped as malformed
    pub malformed: usize,
}

/// Stateful normalizer; holds the previous network sample of live containers
#[derive(Debug, Default)]
pub struct MetricNormalizer {
    samples: SampleRegistry,
}

impl MetricNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> &SampleRegistry {
        &self.samples
    }

    pub fn normalize(&self, stats: &[RawContainerStat], resolver: &TagResolver) -> Vec<Metric> {
        self.normalize_batch(stats, resolver).metrics
    }

    /// Normalize a batch against one topology snapshot
    pub fn normalize_batch(
        &self,
        stats: &[RawContainerStat],
        resolver: &TagResolver,
    ) -> NormalizedBatch {
        let mapping = resolver.snapshot();
        let mut batch = NormalizedBatch::default();
        let mut live = HashSet::with_capacity(stats.len());

        for raw in stats {
            let identity = match classify(raw) {
                EntryKind::Container(identity) => identity,
                EntryKind::NonContainer => {
                    batch.non_containers += 1;
                    continue;
                }
                EntryKind::Malformed(reason) => {
                    warn!(cgroup = %raw.name, reason = %reason, "Skipping malformed container record");
                    batch.malformed += 1;
                    continue;
                }
            };

            live.insert(identity.container_id);
            let tags = self.container_tags(raw, &identity, &mapping, resolver);
            self.container_metrics(raw, identity.container_id, &tags, &mut batch.metrics);
            batch.containers += 1;
        }

        self.samples.retain_live(&live);

        debug!(
            containers = batch.containers,
            non_containers = batch.non_containers,
            malformed = batch.malformed,
            metrics = batch.metrics.len(),
            "Normalized container stats"
        );
        batch
    }

    fn container_tags(
        &self,
        raw: &RawContainerStat,
        identity: &ContainerIdentity<'_>,
        mapping: &TopologyMapping,
        resolver: &TagResolver,
    ) -> TagSet {
        let mut tags = resolver.resolve_in(
            mapping,
            identity.namespace,
            identity.pod_name,
            identity.container_name,
        );
        if let Some(image) = resolve_image(raw, mapping.images()) {
            image.apply(&mut tags);
        }
        tags.set("container_id", identity.container_id);
        tags
    }

    fn container_metrics(
        &self,
        raw: &RawContainerStat,
        container_id: &str,
        tags: &TagSet,
        out: &mut Vec<Metric>,
    ) {
        let ts = raw.timestamp;
        let mut push = |name: &str, value: f64| out.push(Metric::new(name, value, tags.clone(), ts));

        if let Some(cpu) = raw.cpu_usage_total {
            push("kubernetes.cpu.usage.total", cpu as f64);
        }
        if let Some(cores) = raw.cpu_limit_cores.filter(|c| *c > 0.0) {
            push("kubernetes.cpu.limits", cores);
        }
        if let Some(usage) = raw.memory_usage {
            push("kubernetes.memory.usage", usage as f64);
        }
        if let Some(working_set) = raw.memory_working_set {
            push("kubernetes.memory.working_set", working_set as f64);
        }
        if let Some(limit) = raw.memory_limit.filter(|l| *l > 0) {
            push("kubernetes.memory.limits", limit as f64);
        }

        if let Some(current) = raw.network {
            if let Some(previous) = self.samples.swap(container_id, current) {
                if let Some(rx) = current.rx_bytes.checked_sub(previous.rx_bytes) {
                    push("kubernetes.network.rx_bytes", rx as f64);
                }
                if let Some(tx) = current.tx_bytes.checked_sub(previous.tx_bytes) {
                    push("kubernetes.network.tx_bytes", tx as f64);
                }
                let errors = current
                    .rx_errors
                    .saturating_add(current.tx_errors)
                    .checked_sub(previous.rx_errors.saturating_add(previous.tx_errors));
                if let Some(errors) = errors {
                    push("kubernetes.network_errors", errors as f64);
                }
            }
        }

        if raw.has_filesystem {
            for fs in raw.filesystems.iter().filter(|fs| fs.capacity > 0) {
                let mut fs_tags = tags.clone();
                if !fs.device.is_empty() {
                    fs_tags.set("device", fs.device.as_str());
                }
                out.push(Metric::new(
                    "kubernetes.filesystem.usage",
                    fs.usage as f64,
                    fs_tags.clone(),
                    ts,
                ));
                out.push(Metric::new(
                    "kubernetes.filesystem.usage_pct",
                    fs.usage as f64 / fs.capacity as f64,
                    fs_tags,
                    ts,
                ));
            }
        }
    }
}

/// `kubernetes.pods.running`, one point per distinct owner/namespace tag set
pub fn pods_running(resolver: &TagResolver, mapping: &TopologyMapping, timestamp: i64) -> Vec<Metric> {
    let mut counts: HashMap<TagSet, u64> = HashMap::new();

    for pod in mapping.pods().filter(|p| p.is_running()) {
        let mut tags = resolver.static_tags().clone();
        tags.set("kube_namespace", pod.namespace.as_str());
        for owner in &pod.owners {
            tags.insert(owner.kind.tag_key(), owner.name.as_str());
        }
        *counts.entry(tags).or_default() += 1;
    }

    let mut metrics: Vec<Metric> = counts
        .into_iter()
        .map(|(tags, count)| Metric::new("kubernetes.pods.running", count as f64, tags, timestamp))
        .collect();
    metrics.sort_by(|a, b| a.tags.to_strings().cmp(&b.tags.to_strings()));
    metrics
}
