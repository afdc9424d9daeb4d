//! Kubelet Agent - node-level Kubernetes telemetry collector
//!
//! This binary runs as a DaemonSet on each Kubernetes node, collecting
//! container stats from the local kubelet, enriching them with pod topology
//! from the API server and handing metrics, events and service checks to
//! the submission side.

use anyhow::{Context, Result};
use kubelet_agent_lib::{
    collector::{CollectionLoopBuilder, KubeletClient},
    cycle::{CycleOrchestrator, CycleOutput},
    health::{components, HealthRegistry},
    leader::{leader_for, FileLeader, LeaderSignal, StaticLeader},
    observability::{AgentMetrics, StructuredLogger},
    topology::ApiServerClient,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = config::AgentConfig::load()?;
    let collector_config = config.collector_config();
    info!(node_name = %config.node_name, "Agent configured");

    let health_registry = HealthRegistry::new();
    for component in [
        components::COLLECTOR,
        components::KUBELET,
        components::APISERVER,
        components::TOPOLOGY,
    ] {
        health_registry.register(component).await;
    }

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION, &config.kubelet_url, &config.apiserver_url);

    let kubelet = KubeletClient::new(&collector_config).context("Failed to build kubelet client")?;
    let apiserver =
        ApiServerClient::new(&collector_config).context("Failed to build API server client")?;

    let elected: Arc<dyn LeaderSignal> = match &config.leader_file {
        Some(path) => Arc::new(FileLeader::new(path)),
        // Only reachable with election disabled, see AgentConfig::validate
        None => Arc::new(StaticLeader(false)),
    };
    let leader = leader_for(collector_config.leader_election_enabled, elected);

    let orchestrator = CycleOrchestrator::from_config(
        &collector_config,
        Arc::new(kubelet),
        Arc::new(apiserver),
        leader,
    );

    let (collection_loop, output_rx) = CollectionLoopBuilder::new()
        .orchestrator(orchestrator)
        .health(health_registry.clone())
        .interval(config.collection_interval())
        .jitter(config.jitter())
        .build()?;

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let loop_handle = tokio::spawn(collection_loop.run(shutdown_rx));
    let drain_handle = tokio::spawn(drain_outputs(output_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    logger.log_shutdown("SIGINT received");

    let _ = shutdown_tx.send(());
    loop_handle.await.context("Collection loop panicked")?;
    drain_handle.await.context("Output drain panicked")?;
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Stand-in for the submission transport: logs what each cycle produced
async fn drain_outputs(mut rx: mpsc::Receiver<CycleOutput>) {
    while let Some(output) = rx.recv().await {
        for check in &output.service_checks {
            debug!(
                check = %check.check,
                status = %check.status,
                message = ?check.message,
                tags = ?check.tags.to_strings(),
                "Service check"
            );
        }
        for event in &output.events {
            debug!(title = %event.title, tags = ?event.tags.to_strings(), "Cluster event");
        }
        debug!(
            metrics = output.metrics.len(),
            events = output.events.len(),
            fetch_attempts = output.fetch_status.attempts,
            "Cycle output submitted"
        );
    }
}
