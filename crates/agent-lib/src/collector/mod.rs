//! Container stats collection from the kubelet
//!
//! This module provides the stat source trait, the kubelet/cAdvisor
//! implementation and the retrying fetcher, plus the loop that runs
//! collection cycles on a fixed schedule.

mod fetcher;
mod kubelet;
mod r#loop;

pub use fetcher::{RetryPolicy, StatFetcher};
pub use kubelet::{extract_container_id, parse_subcontainers, KubeletClient, SUBCONTAINERS_PATH};
pub use r#loop::{CollectionConfig, CollectionLoop, CollectionLoopBuilder};

use crate::error::CollectorError;
use crate::models::RawContainerStat;
use async_trait::async_trait;

/// Trait for raw container stats sources
#[async_trait]
pub trait StatSource: Send + Sync {
    /// Fetch one sample per cgroup entry
    async fn fetch_stats(&self) -> Result<Vec<RawContainerStat>, CollectorError>;

    /// Check the kubelet's own health endpoint
    async fn check_health(&self) -> Result<(), CollectorError>;

    /// Whether stats collection is switched on
    fn stats_enabled(&self) -> bool {
        true
    }
}
