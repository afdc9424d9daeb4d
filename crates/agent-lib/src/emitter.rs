//! Service checks and cluster events

use crate::models::{
    CheckTarget, ClusterEvent, Event, EventAlertType, FetchStatus, LeaderState, ServiceCheck,
    ServiceCheckResult,
};
use crate::tags::TagSet;
use tracing::debug;

/// Converts per-cycle health results and cluster events into submissions
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    static_tags: TagSet,
}

impl EventEmitter {
    pub fn new(static_tags: TagSet) -> Self {
        Self { static_tags }
    }

    /// Build this cycle's events and service checks.
    ///
    /// Service checks are emitted by every instance. Cluster events are
    /// emitted only by the leader.
    pub fn emit(
        &self,
        fetch_status: &FetchStatus,
        results: Vec<ServiceCheckResult>,
        cluster_events: &[ClusterEvent],
        leader: LeaderState,
    ) -> (Vec<Event>, Vec<ServiceCheck>) {
        let now = chrono::Utc::now().timestamp();
        let checks = self.service_checks(fetch_status, results, now);

        let events = if leader.is_leader() {
            cluster_events.iter().map(|e| self.event(e)).collect()
        } else {
            if !cluster_events.is_empty() {
                debug!(suppressed = cluster_events.len(), "Not leader, suppressing cluster events");
            }
            Vec::new()
        };

        (events, checks)
    }

    fn service_checks(
        &self,
        fetch_status: &FetchStatus,
        results: Vec<ServiceCheckResult>,
        timestamp: i64,
    ) -> Vec<ServiceCheck> {
        // The kubelet check reflects both the stats fetch and the healthz check
        let mut kubelet: Option<ServiceCheckResult> = None;
        let mut others = Vec::new();
        for result in results {
            match result.target {
                CheckTarget::Kubelet => {
                    kubelet = Some(match kubelet {
                        Some(previous) if previous.status >= result.status => previous,
                        _ => result,
                    });
                }
                CheckTarget::ApiServer => others.push(result),
            }
        }

        let fetch_check = ServiceCheckResult {
            target: CheckTarget::Kubelet,
            status: fetch_status.status,
            message: fetch_status.message.clone(),
            tags: TagSet::new(),
        };
        let kubelet = match kubelet {
            Some(healthz) if healthz.status >= fetch_check.status => healthz,
            _ => fetch_check,
        };

        std::iter::once(kubelet)
            .chain(others)
            .map(|result| ServiceCheck {
                check: result.target.check_name().to_string(),
                status: result.status,
                message: result.message,
                tags: self.static_tags.merged(&result.tags),
                timestamp,
            })
            .collect()
    }

    fn event(&self, event: &ClusterEvent) -> Event {
        let mut tags = self.static_tags.clone();
        if !event.namespace.is_empty() {
            tags.set("kube_namespace", event.namespace.as_str());
        }
        tags.set("kube_kind", event.kind.as_str());
        tags.set("kube_name", event.name.as_str());
        if !event.reason.is_empty() {
            tags.set("reason", event.reason.as_str());
        }

        let object = if event.namespace.is_empty() {
            event.name.clone()
        } else {
            format!("{}/{}", event.namespace, event.name)
        };

        Event {
            title: format!("{} {}: {}", event.kind, object, event.reason),
            text: event.message.clone(),
            tags,
            timestamp: event.timestamp,
            alert_type: if event.event_type == "Warning" {
                EventAlertType::Warning
            } else {
                EventAlertType::Info
            },
            aggregation_key: event.uid.clone(),
        }
    }
}
