//! API server topology source
//!
//! Lists the pods scheduled on this node, all services and the node object,
//! and the cluster event stream used by the leader instance.

use super::{RawTopology, TopologySource};
use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::models::ClusterEvent;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Node, Pod, Service};
use kube::api::{Api, ListParams};
use kube::{Client, Config};
use std::collections::BTreeMap;
use tracing::debug;

/// Topology source backed by the Kubernetes API server
pub struct ApiServerClient {
    client: Client,
    endpoint: String,
    node_name: String,
    collect_node_labels: bool,
}

impl ApiServerClient {
    /// Client for `apiserver_url`. Inside a pod the service account CA and
    /// token come from the in-cluster environment.
    pub fn new(config: &CollectorConfig) -> Result<Self, CollectorError> {
        let client = Client::try_from(kube_config(config)?).map_err(|e| {
            CollectorError::InvalidConfig(format!("kubernetes client: {}", e))
        })?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &CollectorConfig) -> Self {
        Self {
            client,
            endpoint: config.apiserver_url.trim_end_matches('/').to_string(),
            node_name: config.node_name.clone(),
            collect_node_labels: config.collect_node_labels_as_tags,
        }
    }

    fn error(&self, path: &str, err: kube::Error) -> CollectorError {
        let endpoint = format!("{}{}", self.endpoint, path);
        match err {
            kube::Error::Api(response) => CollectorError::Status {
                endpoint,
                status: response.code,
            },
            kube::Error::SerdeError(e) => CollectorError::Decode {
                endpoint,
                message: e.to_string(),
            },
            other => CollectorError::unreachable(endpoint, other.to_string()),
        }
    }
}

fn kube_config(config: &CollectorConfig) -> Result<Config, CollectorError> {
    let cluster_url: http::Uri = config
        .apiserver_url
        .parse()
        .map_err(|e| CollectorError::InvalidConfig(format!("apiserver_url: {}", e)))?;

    let mut kube_config = match Config::incluster() {
        Ok(in_cluster) => in_cluster,
        Err(e) => {
            debug!(error = %e, "No in-cluster environment, using configured API server settings");
            Config::new(cluster_url.clone())
        }
    };
    kube_config.cluster_url = cluster_url;
    kube_config.accept_invalid_certs = !config.tls_verify;
    kube_config.connect_timeout = Some(config.request_timeout);
    kube_config.read_timeout = Some(config.request_timeout);

    if let Some(path) = config.apiserver_token_path.as_ref().filter(|p| p.exists()) {
        kube_config.auth_info.token_file = Some(path.display().to_string());
    }

    Ok(kube_config)
}

/// Most recent timestamp the event carries, in unix seconds
pub fn event_timestamp(event: &Event) -> Option<i64> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.first_timestamp.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .map(|dt| dt.timestamp())
}

fn cluster_event(event: Event) -> Option<ClusterEvent> {
    let timestamp = event_timestamp(&event)?;
    let involved = event.involved_object;

    Some(ClusterEvent {
        namespace: involved
            .namespace
            .or(event.metadata.namespace)
            .unwrap_or_default(),
        kind: involved.kind.unwrap_or_default(),
        name: involved.name.unwrap_or_default(),
        reason: event.reason.unwrap_or_default(),
        message: event.message.unwrap_or_default(),
        event_type: event.type_.unwrap_or_else(|| "Normal".to_string()),
        timestamp,
        uid: involved.uid,
        event_uid: event.metadata.uid,
    })
}

#[async_trait]
impl TopologySource for ApiServerClient {
    async fn fetch_topology(&self) -> Result<RawTopology, CollectorError> {
        let on_node = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let pods = Api::<Pod>::all(self.client.clone())
            .list(&on_node)
            .await
            .map_err(|e| self.error("/api/v1/pods", e))?
            .items;

        let services = Api::<Service>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|e| self.error("/api/v1/services", e))?
            .items;

        let node_labels = if self.collect_node_labels {
            Api::<Node>::all(self.client.clone())
                .get(&self.node_name)
                .await
                .map_err(|e| self.error("/api/v1/nodes", e))?
                .metadata
                .labels
                .unwrap_or_default()
        } else {
            BTreeMap::new()
        };

        debug!(
            pods = pods.len(),
            services = services.len(),
            node_labels = node_labels.len(),
            "Fetched topology from API server"
        );

        Ok(RawTopology {
            pods,
            services,
            node_labels,
        })
    }

    async fn fetch_events(&self, since: i64) -> Result<Vec<ClusterEvent>, CollectorError> {
        let events = Api::<Event>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|e| self.error("/api/v1/events", e))?;

        let mut events: Vec<ClusterEvent> = events
            .items
            .into_iter()
            .filter_map(cluster_event)
            .filter(|event| event.timestamp >= since)
            .collect();
        events.sort_by_key(|event| event.timestamp);

        Ok(events)
    }

    async fn check_health(&self) -> Result<(), CollectorError> {
        let request = http::Request::get("/healthz")
            .body(Vec::new())
            .map_err(|e| CollectorError::InvalidConfig(format!("healthz request: {}", e)))?;
        let body = self
            .client
            .request_text(request)
            .await
            .map_err(|e| self.error("/healthz", e))?;

        if body.trim() == "ok" {
            Ok(())
        } else {
            Err(CollectorError::Decode {
                endpoint: format!("{}/healthz", self.endpoint),
                message: format!("unexpected healthz body {:?}", body.trim()),
            })
        }
    }
}
