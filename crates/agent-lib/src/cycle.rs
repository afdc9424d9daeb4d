//! One collection pass: fetch, refresh, normalize, emit
//!
//! Every stage degrades instead of failing: an unreachable kubelet still
//! yields service checks and topology metrics, a failed topology refresh
//! still yields container metrics with the previous tags.

use crate::collector::{RetryPolicy, StatFetcher, StatSource};
use crate::config::CollectorConfig;
use crate::emitter::EventEmitter;
use crate::leader::LeaderSignal;
use crate::models::{
    CheckTarget, ClusterEvent, Event, FetchStatus, LeaderState, Metric, ServiceCheck,
    ServiceCheckResult, ServiceCheckStatus,
};
use crate::normalizer::{pods_running, MetricNormalizer};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::tagger::TagResolver;
use crate::topology::{RefreshOutcome, TopologyFetcher, TopologySource, TopologyStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Everything one cycle produced, ready for submission
#[derive(Debug, Clone)]
pub struct CycleOutput {
    pub metrics: Vec<Metric>,
    pub events: Vec<Event>,
    pub service_checks: Vec<ServiceCheck>,
    pub fetch_status: FetchStatus,
    pub topology: RefreshOutcome,
}

impl CycleOutput {
    pub fn service_check(&self, target: CheckTarget) -> Option<&ServiceCheck> {
        self.service_checks
            .iter()
            .find(|c| c.check == target.check_name())
    }
}

/// Runs collection cycles; owns all state carried between them
pub struct CycleOrchestrator {
    stat_fetcher: StatFetcher,
    topology: TopologyFetcher,
    resolver: TagResolver,
    normalizer: MetricNormalizer,
    emitter: EventEmitter,
    leader: Arc<dyn LeaderSignal>,
    /// Timestamp of the newest cluster event already emitted
    event_cursor: i64,
    /// Keys of the events already emitted at `event_cursor`
    emitted_at_cursor: HashSet<String>,
    max_events_per_cycle: usize,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl CycleOrchestrator {
    pub fn from_config(
        config: &CollectorConfig,
        stats: Arc<dyn StatSource>,
        topology: Arc<dyn TopologySource>,
        leader: Arc<dyn LeaderSignal>,
    ) -> Self {
        let store = TopologyStore::new();
        let resolver = TagResolver::new(store.clone(), config);

        Self {
            stat_fetcher: StatFetcher::new(stats, RetryPolicy::from_config(config)),
            topology: TopologyFetcher::from_config(config, topology, store),
            emitter: EventEmitter::new(resolver.static_tags().clone()),
            resolver,
            normalizer: MetricNormalizer::new(),
            leader,
            // Only events that happen after startup are emitted
            event_cursor: chrono::Utc::now().timestamp(),
            emitted_at_cursor: HashSet::new(),
            max_events_per_cycle: config.max_events_per_cycle,
            metrics: AgentMetrics::new(),
            logger: StructuredLogger::new(config.node_name.clone()),
        }
    }

    pub fn store(&self) -> &TopologyStore {
        self.topology.store()
    }

    pub fn resolver(&self) -> &TagResolver {
        &self.resolver
    }

    pub fn event_cursor(&self) -> i64 {
        self.event_cursor
    }

    /// Run one cycle. Never fails; degraded stages show up in the
    /// returned service checks.
    pub async fn run_cycle(&mut self) -> CycleOutput {
        let start = Instant::now();
        let leader = self.leader.state();

        let (stats, fetch_status) = self.stat_fetcher.fetch().await;
        self.metrics
            .record_fetch(fetch_status.attempts, fetch_status.status != ServiceCheckStatus::Ok);

        let mut checks = Vec::with_capacity(2);
        if fetch_status.is_critical() {
            // Already retried; probing again would only add another timeout
            self.logger.log_kubelet_unreachable(
                fetch_status.attempts,
                fetch_status.message.as_deref().unwrap_or_default(),
            );
        } else {
            checks.push(self.stat_fetcher.health_check().await);
        }

        let refresh = self.topology.refresh(false).await;
        match &refresh {
            RefreshOutcome::Refreshed { pods } => self.logger.log_topology_refreshed(*pods),
            RefreshOutcome::Failed(error) => {
                self.metrics.inc_topology_refresh_failures();
                self.logger.log_topology_refresh_failed(error);
            }
            RefreshOutcome::Unchanged | RefreshOutcome::Disabled => {}
        }

        // Per-node signal: checked by every instance whatever its role
        checks.push(apiserver_check(self.topology.health_check().await, &refresh));

        let batch = self.normalizer.normalize_batch(&stats, &self.resolver);
        self.metrics.add_malformed_records(batch.malformed);
        self.metrics.set_containers_collected(batch.containers);

        let mapping = self.resolver.snapshot();
        let now = chrono::Utc::now().timestamp();
        let mut metrics = batch.metrics;
        metrics.extend(pods_running(&self.resolver, &mapping, now));
        self.metrics.set_topology(
            mapping.pod_count(),
            mapping.age(Instant::now()).map(|age| age.as_secs()),
        );

        let cluster_events = self.cluster_events(leader).await;
        let (events, service_checks) =
            self.emitter.emit(&fetch_status, checks, &cluster_events, leader);

        self.metrics.add_metrics_emitted(metrics.len());
        self.metrics.add_events_emitted(events.len());
        let elapsed = start.elapsed();
        self.metrics.observe_cycle_latency(elapsed.as_secs_f64());

        debug!(
            metrics = metrics.len(),
            events = events.len(),
            service_checks = service_checks.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Collection cycle complete"
        );

        CycleOutput {
            metrics,
            events,
            service_checks,
            fetch_status,
            topology: refresh,
        }
    }

    /// New cluster events for the leader, capped per cycle.
    ///
    /// Timestamps have second resolution, so the cursor second is listed
    /// again every cycle and events already emitted in it are skipped.
    async fn cluster_events(&mut self, leader: LeaderState) -> Vec<ClusterEvent> {
        if !leader.is_leader() {
            return Vec::new();
        }

        let listed = match self.topology.source().fetch_events(self.event_cursor).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Failed to list cluster events");
                return Vec::new();
            }
        };

        let cursor = self.event_cursor;
        let mut events: Vec<ClusterEvent> = listed
            .into_iter()
            .filter(|e| {
                e.timestamp > cursor
                    || (e.timestamp == cursor && !self.emitted_at_cursor.contains(&e.key()))
            })
            .collect();
        events.sort_by_key(|e| e.timestamp);

        if events.len() > self.max_events_per_cycle {
            debug!(
                available = events.len(),
                cap = self.max_events_per_cycle,
                "Capping cluster events for this cycle"
            );
            events.truncate(self.max_events_per_cycle);
        }

        if let Some(newest) = events.last().map(|e| e.timestamp) {
            if newest > self.event_cursor {
                self.event_cursor = newest;
                self.emitted_at_cursor.clear();
            }
            self.emitted_at_cursor.extend(
                events
                    .iter()
                    .filter(|e| e.timestamp == newest)
                    .map(ClusterEvent::key),
            );
        }
        events
    }
}

/// A failed refresh means tags are stale even when the API server answers
fn apiserver_check(healthz: ServiceCheckResult, refresh: &RefreshOutcome) -> ServiceCheckResult {
    match refresh {
        RefreshOutcome::Failed(error) if healthz.status == ServiceCheckStatus::Ok => {
            ServiceCheckResult::warning(
                CheckTarget::ApiServer,
                format!("topology refresh failed: {}", error),
            )
        }
        _ => healthz,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectorError;
    use crate::leader::StaticLeader;
    use crate::models::{RawContainerStat, LABEL_CONTAINER_NAME, LABEL_POD_NAME, LABEL_POD_NAMESPACE};
    use crate::topology::RawTopology;
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeKubelet {
        calls: AtomicUsize,
        reachable: AtomicBool,
    }

    impl FakeKubelet {
        fn new(reachable: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reachable: AtomicBool::new(reachable),
            }
        }
    }

    #[async_trait]
    impl StatSource for FakeKubelet {
        async fn fetch_stats(&self) -> Result<Vec<RawContainerStat>, CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(CollectorError::unreachable("http://kubelet:4194", "connection refused"));
            }
            Ok(vec![
                RawContainerStat {
                    name: "/".to_string(),
                    cpu_usage_total: Some(1),
                    ..Default::default()
                },
                RawContainerStat {
                    name: "/kubepods/podabc/0123".to_string(),
                    container_id: "0123".to_string(),
                    labels: [
                        (LABEL_POD_NAMESPACE, "default"),
                        (LABEL_POD_NAME, "web-5d8f7c9b4-abcde"),
                        (LABEL_CONTAINER_NAME, "nginx"),
                    ]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                    timestamp: 1_709_287_210,
                    cpu_usage_total: Some(1_000),
                    ..Default::default()
                },
            ])
        }

        async fn check_health(&self) -> Result<(), CollectorError> {
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(CollectorError::unreachable("http://kubelet:10255", "connection refused"))
            }
        }
    }

    struct FakeApiServer {
        failing: AtomicBool,
        events: Mutex<Vec<ClusterEvent>>,
        event_calls: AtomicUsize,
    }

    impl FakeApiServer {
        fn new() -> Self {
            Self {
                failing: AtomicBool::new(false),
                events: Mutex::new(Vec::new()),
                event_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TopologySource for FakeApiServer {
        async fn fetch_topology(&self) -> Result<RawTopology, CollectorError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CollectorError::Status {
                    endpoint: "https://apiserver".into(),
                    status: 503,
                });
            }
            let pod = Pod {
                metadata: ObjectMeta {
                    name: Some("web-5d8f7c9b4-abcde".to_string()),
                    namespace: Some("default".to_string()),
                    labels: Some(
                        [("pod-template-hash".to_string(), "5d8f7c9b4".to_string())]
                            .into_iter()
                            .collect(),
                    ),
                    owner_references: Some(vec![OwnerReference {
                        kind: "ReplicaSet".to_string(),
                        name: "web-5d8f7c9b4".to_string(),
                        controller: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                spec: None,
                status: Some(PodStatus {
                    phase: Some("Running".to_string()),
                    ..Default::default()
                }),
            };
            Ok(RawTopology {
                pods: vec![pod],
                ..Default::default()
            })
        }

        async fn fetch_events(&self, since: i64) -> Result<Vec<ClusterEvent>, CollectorError> {
            self.event_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.timestamp >= since)
                .cloned()
                .collect())
        }

        async fn check_health(&self) -> Result<(), CollectorError> {
            Ok(())
        }
    }

    fn config() -> CollectorConfig {
        CollectorConfig {
            node_name: "node-a".to_string(),
            retries: 2,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn cluster_event(timestamp: i64) -> ClusterEvent {
        ClusterEvent {
            namespace: "default".to_string(),
            kind: "Pod".to_string(),
            name: "web-5d8f7c9b4-abcde".to_string(),
            reason: "BackOff".to_string(),
            message: "Back-off restarting failed container".to_string(),
            event_type: "Warning".to_string(),
            timestamp,
            uid: None,
            event_uid: None,
        }
    }

    #[tokio::test]
    async fn test_unreachable_kubelet_degrades_cycle() {
        let kubelet = Arc::new(FakeKubelet::new(false));
        let apiserver = Arc::new(FakeApiServer::new());
        let mut orchestrator = CycleOrchestrator::from_config(
            &config(),
            kubelet.clone(),
            apiserver,
            Arc::new(StaticLeader(false)),
        );

        for cycle in 1..=3 {
            let output = orchestrator.run_cycle().await;

            assert_eq!(kubelet.calls.load(Ordering::SeqCst), cycle * 3);
            assert!(output.fetch_status.is_critical());

            let kubelet_checks: Vec<_> = output
                .service_checks
                .iter()
                .filter(|c| c.check == "kubernetes.kubelet.check")
                .collect();
            assert_eq!(kubelet_checks.len(), 1);
            assert_eq!(kubelet_checks[0].status, ServiceCheckStatus::Critical);

            assert!(!output.metrics.iter().any(|m| m.name.starts_with("kubernetes.cpu")));
            assert!(output.metrics.iter().any(|m| m.name == "kubernetes.pods.running"));
            assert_eq!(
                output.service_check(CheckTarget::ApiServer).map(|c| c.status),
                Some(ServiceCheckStatus::Ok)
            );
        }
    }

    #[tokio::test]
    async fn test_healthy_cycle_tags_container_metrics() {
        let mut orchestrator = CycleOrchestrator::from_config(
            &config(),
            Arc::new(FakeKubelet::new(true)),
            Arc::new(FakeApiServer::new()),
            Arc::new(StaticLeader(false)),
        );

        let output = orchestrator.run_cycle().await;

        assert_eq!(output.topology, RefreshOutcome::Refreshed { pods: 1 });
        let cpu = output
            .metrics
            .iter()
            .find(|m| m.name == "kubernetes.cpu.usage.total")
            .unwrap();
        assert!(cpu.tags.contains("kube_deployment", "web"));
        assert!(cpu.tags.contains("pod_name", "web-5d8f7c9b4-abcde"));
        // The cgroup root never produces container metrics
        assert_eq!(
            output
                .metrics
                .iter()
                .filter(|m| m.name == "kubernetes.cpu.usage.total")
                .count(),
            1
        );
        assert_eq!(
            output.service_check(CheckTarget::Kubelet).map(|c| c.status),
            Some(ServiceCheckStatus::Ok)
        );
    }

    #[tokio::test]
    async fn test_topology_failure_keeps_tags_and_warns() {
        let apiserver = Arc::new(FakeApiServer::new());
        let mut config = config();
        config.service_tag_update_freq = Duration::ZERO;
        let mut orchestrator = CycleOrchestrator::from_config(
            &config,
            Arc::new(FakeKubelet::new(true)),
            apiserver.clone(),
            Arc::new(StaticLeader(false)),
        );

        let first = orchestrator.run_cycle().await;
        apiserver.failing.store(true, Ordering::SeqCst);
        let second = orchestrator.run_cycle().await;

        assert!(matches!(second.topology, RefreshOutcome::Failed(_)));
        let tags = |output: &CycleOutput| {
            output
                .metrics
                .iter()
                .find(|m| m.name == "kubernetes.cpu.usage.total")
                .map(|m| m.tags.clone())
        };
        assert_eq!(tags(&first), tags(&second));
        assert_eq!(
            second.service_check(CheckTarget::ApiServer).map(|c| c.status),
            Some(ServiceCheckStatus::Warning)
        );
    }

    #[tokio::test]
    async fn test_only_leader_emits_events() {
        let apiserver = Arc::new(FakeApiServer::new());
        let mut follower = CycleOrchestrator::from_config(
            &config(),
            Arc::new(FakeKubelet::new(true)),
            apiserver.clone(),
            Arc::new(StaticLeader(false)),
        );
        let cursor = follower.event_cursor();
        apiserver
            .events
            .lock()
            .unwrap()
            .extend([cluster_event(cursor + 1), cluster_event(cursor + 2)]);

        let output = follower.run_cycle().await;
        assert!(output.events.is_empty());
        assert_eq!(apiserver.event_calls.load(Ordering::SeqCst), 0);

        let mut leader = CycleOrchestrator::from_config(
            &config(),
            Arc::new(FakeKubelet::new(true)),
            apiserver.clone(),
            Arc::new(StaticLeader(true)),
        );
        leader.event_cursor = cursor;

        let output = leader.run_cycle().await;
        assert_eq!(output.events.len(), 2);
        assert_eq!(leader.event_cursor(), cursor + 2);

        // Already emitted events are not repeated
        let output = leader.run_cycle().await;
        assert!(output.events.is_empty());
    }

    #[tokio::test]
    async fn test_events_capped_per_cycle() {
        let apiserver = Arc::new(FakeApiServer::new());
        let mut config = config();
        config.max_events_per_cycle = 2;
        let mut leader = CycleOrchestrator::from_config(
            &config,
            Arc::new(FakeKubelet::new(true)),
            apiserver.clone(),
            Arc::new(StaticLeader(true)),
        );
        let cursor = leader.event_cursor();
        apiserver
            .events
            .lock()
            .unwrap()
            .extend((1..=5).map(|i| cluster_event(cursor + i)));

        let first = leader.run_cycle().await;
        assert_eq!(first.events.len(), 2);
        let second = leader.run_cycle().await;
        assert_eq!(second.events.len(), 2);
        assert_eq!(leader.event_cursor(), cursor + 4);
    }

    #[tokio::test]
    async fn test_capped_events_within_one_second_are_not_lost() {
        let apiserver = Arc::new(FakeApiServer::new());
        let mut config = config();
        config.max_events_per_cycle = 2;
        let mut leader = CycleOrchestrator::from_config(
            &config,
            Arc::new(FakeKubelet::new(true)),
            apiserver.clone(),
            Arc::new(StaticLeader(true)),
        );
        let second = leader.event_cursor() + 1;
        apiserver.events.lock().unwrap().extend(["a", "b", "c"].map(|uid| ClusterEvent {
            event_uid: Some(uid.to_string()),
            ..cluster_event(second)
        }));

        let first = leader.run_cycle().await;
        let next = leader.run_cycle().await;
        let last = leader.run_cycle().await;

        assert_eq!(first.events.len(), 2);
        assert_eq!(next.events.len(), 1);
        assert!(last.events.is_empty());
        assert_eq!(leader.event_cursor(), second);
    }

    #[tokio::test]
    async fn test_apiserver_check_independent_of_leadership() {
        let mut config = config();
        config.collect_service_tags = false;

        for is_leader in [false, true] {
            let mut orchestrator = CycleOrchestrator::from_config(
                &config,
                Arc::new(FakeKubelet::new(true)),
                Arc::new(FakeApiServer::new()),
                Arc::new(StaticLeader(is_leader)),
            );
            let output = orchestrator.run_cycle().await;

            assert_eq!(output.topology, RefreshOutcome::Disabled);
            assert_eq!(
                output.service_check(CheckTarget::ApiServer).map(|c| c.status),
                Some(ServiceCheckStatus::Ok)
            );
        }
    }
}
