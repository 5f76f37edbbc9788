//! Watch-driven synchronization engine.
//!
//! Consumes per-kind [`SourceEvent`](cmdb_core::SourceEvent) streams, projects
//! them into rows and writes them through a single-writer [`Store`](cmdb_persist::Store).
//! A [`SyncGate`] reports when every kind has applied its first full replay.

#![forbid(unsafe_code)]

mod engine;
mod gate;
mod mock;
mod pipeline;

pub use engine::{EngineHandle, SyncEngine};
pub use gate::SyncGate;
pub use mock::MockSource;
pub use pipeline::{Applied, ApplyError, KindCounters, Pipeline, SyncStats};

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Processing lanes per kind.
    pub lanes: usize,
    /// Bound of every source and lane queue.
    pub queue_cap: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { lanes: 4, queue_cap: 2048 }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let lanes = std::env::var("CMDB_LANES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(d.lanes);
        let queue_cap = std::env::var("CMDB_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(d.queue_cap);
        Self { lanes: lanes.max(1), queue_cap: queue_cap.max(1) }
    }
}
