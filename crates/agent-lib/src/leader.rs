//! Leader signal for cluster-scoped duties
//!
//! Election itself happens outside the agent; the collector only reads the
//! current answer once per cycle.

use crate::models::LeaderState;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Source of the per-cycle leadership answer
pub trait LeaderSignal: Send + Sync {
    fn is_leader(&self) -> bool;

    fn state(&self) -> LeaderState {
        LeaderState(self.is_leader())
    }
}

/// Fixed answer, used when election is disabled or in tests
#[derive(Debug, Clone, Copy)]
pub struct StaticLeader(pub bool);

impl LeaderSignal for StaticLeader {
    fn is_leader(&self) -> bool {
        self.0
    }
}

/// Shared flag flipped by external election plumbing
#[derive(Debug, Clone, Default)]
pub struct LeaderHandle {
    leader: Arc<AtomicBool>,
}

impl LeaderHandle {
    pub fn new(initial: bool) -> Self {
        Self {
            leader: Arc::new(AtomicBool::new(initial)),
        }
    }

    pub fn set(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

impl LeaderSignal for LeaderHandle {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

/// Leader while a marker file exists, as written by an election sidecar
#[derive(Debug, Clone)]
pub struct FileLeader {
    path: PathBuf,
}

impl FileLeader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LeaderSignal for FileLeader {
    fn is_leader(&self) -> bool {
        self.path.exists()
    }
}

/// With election disabled this instance is the only one and always leads
pub fn leader_for(election_enabled: bool, elected: Arc<dyn LeaderSignal>) -> Arc<dyn LeaderSignal> {
    if election_enabled {
        elected
    } else {
        Arc::new(StaticLeader(true))
    }
}
