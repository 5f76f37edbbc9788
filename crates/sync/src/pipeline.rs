//! Projector + store write path for a single event, with failure accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cmdb_core::{project, ProjectError, Projection, ResourceKind, WatchEvent};
use cmdb_persist::{Store, StoreError};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Upserted,
    /// `existed` is false when the key was already absent.
    Deleted { existed: bool },
}

#[derive(Debug, Default)]
struct KindStats {
    upserts: AtomicU64,
    deletes: AtomicU64,
    absent_deletes: AtomicU64,
    write_failures: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounters {
    pub upserts: u64,
    pub deletes: u64,
    pub absent_deletes: u64,
    /// Writes that failed and were dropped; the next full replay repairs them.
    pub write_failures: u64,
    /// Events that could not be projected (missing key).
    pub skipped: u64,
}

/// Engine-wide counters, shared with the query side.
#[derive(Debug, Default)]
pub struct SyncStats {
    pods: KindStats,
    nodes: KindStats,
}

impl SyncStats {
    fn of(&self, kind: ResourceKind) -> &KindStats {
        match kind {
            ResourceKind::Pod => &self.pods,
            ResourceKind::Node => &self.nodes,
        }
    }

    pub fn counters(&self, kind: ResourceKind) -> KindCounters {
        let s = self.of(kind);
        KindCounters {
            upserts: s.upserts.load(Ordering::Relaxed),
            deletes: s.deletes.load(Ordering::Relaxed),
            absent_deletes: s.absent_deletes.load(Ordering::Relaxed),
            write_failures: s.write_failures.load(Ordering::Relaxed),
            skipped: s.skipped.load(Ordering::Relaxed),
        }
    }

    pub fn write_failures(&self) -> u64 {
        ResourceKind::ALL.iter().map(|k| self.counters(*k).write_failures).sum()
    }
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    stats: Arc<SyncStats>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, stats: Arc<SyncStats>) -> Self {
        Self { store, stats }
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Project and write one event.
    pub fn apply(&self, ev: &WatchEvent) -> Result<Applied, ApplyError> {
        match project(ev)? {
            Projection::Upsert(row) => {
                self.store.upsert(&row)?;
                Ok(Applied::Upserted)
            }
            Projection::Delete(t) => {
                let existed = self.store.delete(t.kind, &t.key)?;
                Ok(Applied::Deleted { existed })
            }
        }
    }

    /// Apply and account. Failures are logged and counted, never propagated:
    /// the lane moves on to its next event.
    pub fn handle(&self, ev: &WatchEvent) {
        let kind = ev.kind();
        let stats = self.stats.of(kind);
        match self.apply(ev) {
            Ok(Applied::Upserted) => {
                stats.upserts.fetch_add(1, Ordering::Relaxed);
                debug!(%kind, event = ?ev.event_type(), key = ev.key().unwrap_or(""), obj = %describe(ev), "upserted");
            }
            Ok(Applied::Deleted { existed }) => {
                stats.deletes.fetch_add(1, Ordering::Relaxed);
                if !existed {
                    stats.absent_deletes.fetch_add(1, Ordering::Relaxed);
                }
                debug!(%kind, event = ?ev.event_type(), key = ev.key().unwrap_or(""), existed, "deleted");
            }
            Err(ApplyError::Project(e)) => {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                counter!("cmdb_events_skipped_total", 1u64, "kind" => kind.as_str());
                warn!(%kind, event = ?ev.event_type(), obj = %describe(ev), error = %e, "event skipped");
            }
            Err(ApplyError::Store(e)) => {
                stats.write_failures.fetch_add(1, Ordering::Relaxed);
                counter!("cmdb_write_failures_total", 1u64, "kind" => kind.as_str());
                error!(%kind, event = ?ev.event_type(), key = ev.key().unwrap_or(""), error = %e, "store write failed; dropped until next replay");
            }
        }
    }
}

fn describe(ev: &WatchEvent) -> String {
    match ev {
        WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.display_name(),
        WatchEvent::DeletedAmbiguous(t) => t.key.clone(),
    }
}
