//! Topology mapping built from one API server listing
//!
//! A mapping is built in full from a [`RawTopology`] and never patched
//! afterwards; refreshes replace it wholesale.

use super::RawTopology;
use crate::models::normalize_digest;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Label the deployment controller stamps on its replica sets' pods
const POD_TEMPLATE_HASH: &str = "pod-template-hash";

/// Kinds of controllers that own pods
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OwnerKind {
    Deployment,
    DaemonSet,
    ReplicaSet,
    StatefulSet,
    Job,
    CronJob,
    ReplicationController,
}

impl OwnerKind {
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(Self::Deployment),
            "DaemonSet" => Some(Self::DaemonSet),
            "ReplicaSet" => Some(Self::ReplicaSet),
            "StatefulSet" => Some(Self::StatefulSet),
            "Job" => Some(Self::Job),
            "CronJob" => Some(Self::CronJob),
            "ReplicationController" => Some(Self::ReplicationController),
            _ => None,
        }
    }

    /// Tag key carrying the owner's name
    pub fn tag_key(&self) -> &'static str {
        match self {
            Self::Deployment => "kube_deployment",
            Self::DaemonSet => "kube_daemon_set",
            Self::ReplicaSet => "kube_replica_set",
            Self::StatefulSet => "kube_stateful_set",
            Self::Job => "kube_job",
            Self::CronJob => "kube_cronjob",
            Self::ReplicationController => "kube_replication_controller",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Owner {
    pub kind: OwnerKind,
    pub name: String,
}

impl Owner {
    pub fn new(kind: OwnerKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// Everything known about one pod
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodTopology {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub phase: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub services: BTreeSet<String>,
    /// Direct owners plus the owners derived from them
    pub owners: BTreeSet<Owner>,
}

impl PodTopology {
    pub fn is_running(&self) -> bool {
        self.phase.as_deref() == Some("Running")
    }
}

/// Digest to human-readable image lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageManifest {
    by_digest: HashMap<String, String>,
}

impl ImageManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `reference` (any digest-bearing form) is `image`.
    /// References without a digest are ignored.
    pub fn insert(&mut self, reference: &str, image: impl Into<String>) {
        if let Some(digest) = normalize_digest(reference) {
            self.by_digest.entry(digest).or_insert_with(|| image.into());
        }
    }

    /// Look up the human-readable image for a digest-bearing reference
    pub fn resolve(&self, reference: &str) -> Option<&str> {
        normalize_digest(reference)
            .and_then(|digest| self.by_digest.get(&digest))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

/// Pod topology for the node, keyed by namespace then pod name
#[derive(Debug, Clone, Default)]
pub struct TopologyMapping {
    pods: HashMap<String, HashMap<String, PodTopology>>,
    node_labels: BTreeMap<String, String>,
    images: ImageManifest,
    built_at: Option<Instant>,
}

impl TopologyMapping {
    /// Mapping with no pods; used before the first successful refresh
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a complete mapping from one listing
    pub fn build(raw: RawTopology, built_at: Instant) -> Self {
        let mut mapping = Self {
            node_labels: raw.node_labels,
            built_at: Some(built_at),
            ..Self::default()
        };

        for pod in &raw.pods {
            register_images(&mut mapping.images, pod);

            let Some(topology) = pod_topology(pod, &raw.services) else {
                continue;
            };
            mapping
                .pods
                .entry(topology.namespace.clone())
                .or_default()
                .insert(topology.name.clone(), topology);
        }

        mapping
    }

    /// Test and embedding helper: insert a pod directly
    pub fn insert_pod(&mut self, pod: PodTopology) {
        self.pods
            .entry(pod.namespace.clone())
            .or_default()
            .insert(pod.name.clone(), pod);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<&PodTopology> {
        self.pods.get(namespace)?.get(name)
    }

    pub fn pods(&self) -> impl Iterator<Item = &PodTopology> {
        self.pods.values().flat_map(|by_name| by_name.values())
    }

    pub fn pod_count(&self) -> usize {
        self.pods.values().map(HashMap::len).sum()
    }

    pub fn node_labels(&self) -> &BTreeMap<String, String> {
        &self.node_labels
    }

    pub fn images(&self) -> &ImageManifest {
        &self.images
    }

    pub fn images_mut(&mut self) -> &mut ImageManifest {
        &mut self.images
    }

    /// Time since this mapping was built; `None` for the empty mapping
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.built_at.map(|at| now.saturating_duration_since(at))
    }

    pub fn built_at(&self) -> Option<Instant> {
        self.built_at
    }
}

/// `None` for pods the API server returned without a name
fn pod_topology(pod: &Pod, services: &[Service]) -> Option<PodTopology> {
    let meta = &pod.metadata;
    let name = meta.name.clone()?;
    let labels = meta.labels.clone().unwrap_or_default();

    let services = services
        .iter()
        .filter(|svc| svc.metadata.namespace == meta.namespace)
        .filter(|svc| selector_matches(svc, &labels))
        .filter_map(|svc| svc.metadata.name.clone())
        .collect();

    let owners = meta
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .flat_map(|owner| derive_owners(owner, &labels))
        .collect();

    Some(PodTopology {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name,
        uid: meta.uid.clone(),
        phase: pod.status.as_ref().and_then(|s| s.phase.clone()),
        labels,
        services,
        owners,
    })
}

/// A service selects a pod when its non-empty selector is a subset of the pod's labels
fn selector_matches(service: &Service, labels: &BTreeMap<String, String>) -> bool {
    match service.spec.as_ref().and_then(|s| s.selector.as_ref()) {
        Some(selector) if !selector.is_empty() => selector
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value)),
        _ => false,
    }
}

/// Expand an owner reference into the owners it implies.
///
/// A ReplicaSet named `<deployment>-<pod-template-hash>` belongs to that
/// deployment; a Job named `<cronjob>-<digits>` was spawned by that cronjob.
pub fn derive_owners(owner: &OwnerReference, labels: &BTreeMap<String, String>) -> Vec<Owner> {
    let Some(kind) = OwnerKind::from_kind(&owner.kind) else {
        return Vec::new();
    };

    let mut owners = vec![Owner::new(kind, owner.name.clone())];

    match kind {
        OwnerKind::ReplicaSet => {
            if let Some(deployment) = labels
                .get(POD_TEMPLATE_HASH)
                .and_then(|hash| owner.name.strip_suffix(hash.as_str()))
                .and_then(|rest| rest.strip_suffix('-'))
                .filter(|name| !name.is_empty())
            {
                owners.push(Owner::new(OwnerKind::Deployment, deployment));
            }
        }
        OwnerKind::Job => {
            if let Some((cronjob, suffix)) = owner.name.rsplit_once('-') {
                if !cronjob.is_empty()
                    && !suffix.is_empty()
                    && suffix.chars().all(|c| c.is_ascii_digit())
                {
                    owners.push(Owner::new(OwnerKind::CronJob, cronjob));
                }
            }
        }
        _ => {}
    }

    owners
}

/// Record every digest the pod's container statuses expose
fn register_images(manifest: &mut ImageManifest, pod: &Pod) {
    let spec_images: HashMap<&str, &str> = pod
        .spec
        .iter()
        .flat_map(|spec| {
            spec.containers
                .iter()
                .chain(spec.init_containers.iter().flatten())
        })
        .filter_map(|c| c.image.as_deref().map(|image| (c.name.as_str(), image)))
        .collect();

    let statuses = pod.status.iter().flat_map(|status| {
        status
            .container_statuses
            .iter()
            .flatten()
            .chain(status.init_container_statuses.iter().flatten())
    });

    for status in statuses {
        let candidates = [
            spec_images.get(status.name.as_str()).copied(),
            Some(status.image.as_str()),
        ];
        let Some(readable) = human_readable(&candidates) else {
            continue;
        };

        manifest.insert(&status.image_id, readable);
        manifest.insert(&status.image, readable);
    }
}

/// Prefer a tag reference, then a `repo@digest` reference; never a bare digest
fn human_readable<'a>(candidates: &[Option<&'a str>]) -> Option<&'a str> {
    let present = || candidates.iter().flatten().copied().filter(|c| !c.is_empty());

    present()
        .find(|c| normalize_digest(c).is_none())
        .or_else(|| present().find(|c| c.contains('@')))
}
