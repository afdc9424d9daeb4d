//! Node-level kubelet telemetry collector
//!
//! This crate provides the core functionality for:
//! - Container stats collection from the kubelet's cAdvisor endpoint
//! - Pod topology (services, owners, node labels) from the API server
//! - Tag resolution and metric normalization
//! - Service checks and leader-gated cluster events
//! - Health checks and self-observability

pub mod client;
pub mod collector;
pub mod config;
pub mod cycle;
pub mod emitter;
pub mod error;
pub mod health;
pub mod leader;
pub mod models;
pub mod normalizer;
pub mod observability;
pub mod tagger;
pub mod tags;
pub mod topology;

pub use collector::{CollectionConfig, CollectionLoop, CollectionLoopBuilder, KubeletClient, StatFetcher, StatSource};
pub use config::CollectorConfig;
pub use cycle::{CycleOrchestrator, CycleOutput};
pub use emitter::EventEmitter;
pub use error::CollectorError;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use leader::{FileLeader, LeaderHandle, LeaderSignal, StaticLeader};
pub use models::*;
pub use normalizer::MetricNormalizer;
pub use observability::{AgentMetrics, StructuredLogger};
pub use tagger::TagResolver;
pub use tags::{Tag, TagSet};
pub use topology::{ApiServerClient, TopologyFetcher, TopologyMapping, TopologySource, TopologyStore};
