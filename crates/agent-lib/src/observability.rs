//! Observability infrastructure for the kubelet agent
//!
//! Provides:
//! - Prometheus self-metrics (cycle latency, fetch retries, topology freshness)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter,
    IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for cycle latency (in seconds). Cycles include retry
/// stalls, so the buckets reach well past a typical interval.
const CYCLE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    cycle_latency_seconds: Histogram,
    stat_fetch_attempts: IntCounter,
    stat_fetch_failures: IntCounter,
    containers_collected: IntGauge,
    metrics_emitted: IntCounter,
    events_emitted: IntCounter,
    malformed_records: IntCounter,
    topology_refresh_failures: IntCounter,
    topology_pods: IntGauge,
    topology_age_seconds: IntGauge,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "kubelet_agent_cycle_latency_seconds",
                "Time spent running one collection cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            stat_fetch_attempts: register_int_counter!(
                "kubelet_agent_stat_fetch_attempts_total",
                "Kubelet stats requests, including retries"
            )
            .expect("Failed to register stat_fetch_attempts"),

            stat_fetch_failures: register_int_counter!(
                "kubelet_agent_stat_fetch_failures_total",
                "Cycles whose kubelet stats fetch failed after retries"
            )
            .expect("Failed to register stat_fetch_failures"),

            containers_collected: register_int_gauge!(
                "kubelet_agent_containers_collected",
                "Containers normalized in the last cycle"
            )
            .expect("Failed to register containers_collected"),

            metrics_emitted: register_int_counter!(
                "kubelet_agent_metrics_emitted_total",
                "Metric points handed to the submission side"
            )
            .expect("Failed to register metrics_emitted"),

            events_emitted: register_int_counter!(
                "kubelet_agent_events_emitted_total",
                "Cluster events handed to the submission side"
            )
            .expect("Failed to register events_emitted"),

            malformed_records: register_int_counter!(
                "kubelet_agent_malformed_records_total",
                "Container records skipped as malformed"
            )
            .expect("Failed to register malformed_records"),

            topology_refresh_failures: register_int_counter!(
                "kubelet_agent_topology_refresh_failures_total",
                "Failed API server topology refreshes"
            )
            .expect("Failed to register topology_refresh_failures"),

            topology_pods: register_int_gauge!(
                "kubelet_agent_topology_pods",
                "Pods in the current topology mapping"
            )
            .expect("Failed to register topology_pods"),

            topology_age_seconds: register_int_gauge!(
                "kubelet_agent_topology_age_seconds",
                "Age of the current topology mapping"
            )
            .expect("Failed to register topology_age_seconds"),
        }
    }
}

/// Agent self-metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AgentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMetrics").finish_non_exhaustive()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn record_fetch(&self, attempts: u32, failed: bool) {
        self.inner().stat_fetch_attempts.inc_by(u64::from(attempts));
        if failed {
            self.inner().stat_fetch_failures.inc();
        }
    }

    pub fn set_containers_collected(&self, count: usize) {
        self.inner().containers_collected.set(count as i64);
    }

    pub fn add_metrics_emitted(&self, count: usize) {
        self.inner().metrics_emitted.inc_by(count as u64);
    }

    pub fn add_events_emitted(&self, count: usize) {
        self.inner().events_emitted.inc_by(count as u64);
    }

    pub fn add_malformed_records(&self, count: usize) {
        self.inner().malformed_records.inc_by(count as u64);
    }

    pub fn inc_topology_refresh_failures(&self) {
        self.inner().topology_refresh_failures.inc();
    }

    /// Update topology gauges; `age_secs` is `None` before the first refresh
    pub fn set_topology(&self, pods: usize, age_secs: Option<u64>) {
        self.inner().topology_pods.set(pods as i64);
        self.inner()
            .topology_age_seconds
            .set(age_secs.map(|a| a as i64).unwrap_or(-1));
    }
}

/// Structured logger for agent lifecycle events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, kubelet_url: &str, apiserver_url: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            kubelet_url = %kubelet_url,
            apiserver_url = %apiserver_url,
            "Kubelet agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Kubelet agent shutting down"
        );
    }

    pub fn log_topology_refreshed(&self, pods: usize) {
        info!(
            event = "topology_refreshed",
            node = %self.node_name,
            pods = pods,
            "Topology mapping replaced"
        );
    }

    pub fn log_topology_refresh_failed(&self, error: &str) {
        warn!(
            event = "topology_refresh_failed",
            node = %self.node_name,
            error = %error,
            "Topology refresh failed, serving previous mapping"
        );
    }

    pub fn log_kubelet_unreachable(&self, attempts: u32, message: &str) {
        warn!(
            event = "kubelet_unreachable",
            node = %self.node_name,
            attempts = attempts,
            error = %message,
            "Kubelet unreachable after retries, no container metrics this cycle"
        );
    }
}
