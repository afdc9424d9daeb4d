//! Collection scheduling
//!
//! Runs one collection cycle per tick. Cycles never overlap: a cycle that
//! outlasts the interval delays the next tick instead of racing it.

use crate::cycle::{CycleOrchestrator, CycleOutput};
use crate::health::{components, HealthRegistry};
use anyhow::Result;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the collection loop
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Base collection interval (default: 15 seconds)
    pub interval: Duration,
    /// Maximum random delay before the first cycle (default: 1 second)
    pub jitter: Duration,
    /// Channel buffer size for cycle outputs
    pub buffer_size: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            jitter: Duration::from_secs(1),
            buffer_size: 16,
        }
    }
}

/// Periodic driver for a [`CycleOrchestrator`]
pub struct CollectionLoop {
    orchestrator: CycleOrchestrator,
    config: CollectionConfig,
    output_tx: mpsc::Sender<CycleOutput>,
    health: Option<HealthRegistry>,
}

impl CollectionLoop {
    pub fn new(
        orchestrator: CycleOrchestrator,
        config: CollectionConfig,
    ) -> (Self, mpsc::Receiver<CycleOutput>) {
        let (output_tx, output_rx) = mpsc::channel(config.buffer_size.max(1));

        let loop_instance = Self {
            orchestrator,
            config,
            output_tx,
            health: None,
        };

        (loop_instance, output_rx)
    }

    /// Report each cycle's service checks to `health`
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Run until `shutdown` fires or the output receiver is dropped
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            jitter_ms = self.config.jitter.as_millis() as u64,
            "Starting collection loop"
        );

        // Spread agents on different nodes across the interval
        let start = Instant::now() + Duration::from_millis(rand_jitter(self.config.jitter.as_millis() as u64));
        let mut ticker = interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycle_count = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cycle_count += 1;
                    if !self.run_once(cycle_count).await {
                        warn!("Cycle output receiver closed, stopping collection loop");
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!(cycles = cycle_count, "Shutting down collection loop");
                    break;
                }
            }
        }
    }

    /// Run one cycle and forward its output. Returns false once nobody is
    /// listening any more.
    async fn run_once(&mut self, cycle: u64) -> bool {
        let output = self.orchestrator.run_cycle().await;

        if let Some(health) = &self.health {
            health.apply_service_checks(&output.service_checks).await;
            health.apply_topology(&output.topology).await;
            health.set_healthy(components::COLLECTOR).await;
            health.set_ready(true).await;
        }

        debug!(
            cycle,
            metrics = output.metrics.len(),
            events = output.events.len(),
            "Forwarding cycle output"
        );

        self.output_tx.send(output).await.is_ok()
    }
}

/// Generate a random jitter value between 0 and max_ms
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }

    // Clock-derived spread is enough to desynchronize nodes
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    now % max_ms
}

/// Builder for the collection loop
pub struct CollectionLoopBuilder {
    orchestrator: Option<CycleOrchestrator>,
    health: Option<HealthRegistry>,
    config: CollectionConfig,
}

impl CollectionLoopBuilder {
    pub fn new() -> Self {
        Self {
            orchestrator: None,
            health: None,
            config: CollectionConfig::default(),
        }
    }

    pub fn orchestrator(mut self, orchestrator: CycleOrchestrator) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn build(self) -> Result<(CollectionLoop, mpsc::Receiver<CycleOutput>)> {
        let orchestrator = self
            .orchestrator
            .ok_or_else(|| anyhow::anyhow!("Cycle orchestrator is required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Collection interval must be greater than zero");
        }

        let (collection_loop, rx) = CollectionLoop::new(orchestrator, self.config);
        match self.health {
            Some(health) => Ok((collection_loop.with_health(health), rx)),
            None => Ok((collection_loop, rx)),
        }
    }
}

impl Default for CollectionLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::StatSource;
    use crate::config::CollectorConfig;
    use crate::error::CollectorError;
    use crate::health::ComponentStatus;
    use crate::leader::StaticLeader;
    use crate::models::{ClusterEvent, RawContainerStat};
    use crate::topology::{RawTopology, TopologySource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingKubelet {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StatSource for CountingKubelet {
        async fn fetch_stats(&self) -> Result<Vec<RawContainerStat>, CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn check_health(&self) -> Result<(), CollectorError> {
            Ok(())
        }
    }

    struct EmptyApiServer;

    #[async_trait]
    impl TopologySource for EmptyApiServer {
        async fn fetch_topology(&self) -> Result<RawTopology, CollectorError> {
            Ok(RawTopology::default())
        }

        async fn fetch_events(&self, _since: i64) -> Result<Vec<ClusterEvent>, CollectorError> {
            Ok(Vec::new())
        }

        async fn check_health(&self) -> Result<(), CollectorError> {
            Err(CollectorError::unreachable("https://apiserver", "timed out"))
        }
    }

    fn orchestrator(kubelet: Arc<CountingKubelet>) -> CycleOrchestrator {
        CycleOrchestrator::from_config(
            &CollectorConfig::default(),
            kubelet,
            Arc::new(EmptyApiServer),
            Arc::new(StaticLeader(true)),
        )
    }

    #[test]
    fn test_collection_config_default() {
        let config = CollectionConfig::default();
        assert_eq!(config.interval, Duration::from_secs(15));
        assert_eq!(config.jitter, Duration::from_secs(1));
    }

    #[test]
    fn test_rand_jitter() {
        let jitter = rand_jitter(1000);
        assert!(jitter < 1000);

        // Zero max should return zero
        assert_eq!(rand_jitter(0), 0);
    }

    #[test]
    fn test_builder_requires_orchestrator() {
        assert!(CollectionLoopBuilder::new().build().is_err());
    }

    #[test]
    fn test_builder_rejects_zero_interval() {
        let kubelet = Arc::new(CountingKubelet {
            calls: AtomicUsize::new(0),
        });
        let result = CollectionLoopBuilder::new()
            .orchestrator(orchestrator(kubelet))
            .interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_loop_forwards_outputs_until_shutdown() {
        let kubelet = Arc::new(CountingKubelet {
            calls: AtomicUsize::new(0),
        });
        let health = HealthRegistry::new();
        let (collection_loop, mut rx) = CollectionLoopBuilder::new()
            .orchestrator(orchestrator(kubelet.clone()))
            .health(health.clone())
            .interval(Duration::from_millis(10))
            .jitter(Duration::ZERO)
            .build()
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(collection_loop.run(shutdown_rx));

        let first = rx.recv().await.unwrap();
        assert!(first.service_checks.len() >= 2);
        let _second = rx.recv().await.unwrap();

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(kubelet.calls.load(Ordering::SeqCst) >= 2);
        let status = health.health().await;
        assert_eq!(
            status.components[components::APISERVER].status,
            ComponentStatus::Degraded
        );
        assert!(health.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_loop_stops_when_receiver_dropped() {
        let kubelet = Arc::new(CountingKubelet {
            calls: AtomicUsize::new(0),
        });
        let (collection_loop, rx) = CollectionLoopBuilder::new()
            .orchestrator(orchestrator(kubelet))
            .interval(Duration::from_millis(10))
            .jitter(Duration::ZERO)
            .build()
            .unwrap();
        drop(rx);

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::time::timeout(Duration::from_secs(5), collection_loop.run(shutdown_rx))
            .await
            .unwrap();
    }
}
