//! Query facade over the mirror.
//!
//! Frontends (CLI today, an HTTP surface later) depend on [`CmdbApi`] only.
//! Reads never block on or mutate synchronization state.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use cmdb_core::{NodeRecord, PodRecord, ResourceKind};
use cmdb_persist::{SqliteStore, Store, StoreError};
use cmdb_sync::{KindCounters, SyncGate, SyncStats};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Request-scoped errors suitable for transport.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum CmdbError {
    #[error("internal: {0}")]
    Internal(String),
}

impl From<StoreError> for CmdbError {
    fn from(e: StoreError) -> Self {
        CmdbError::Internal(e.to_string())
    }
}

pub type CmdbResult<T> = Result<T, CmdbError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindStats {
    pub kind: ResourceKind,
    pub synced: bool,
    pub rows: u64,
    pub counters: KindCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub ready: bool,
    pub kinds: Vec<KindStats>,
}

#[async_trait::async_trait]
pub trait CmdbApi: Send + Sync {
    /// Pods in `namespace` ordered by name, or all pods ordered by namespace
    /// then name. An empty namespace means no filter.
    async fn list_pods(&self, namespace: Option<&str>) -> CmdbResult<Vec<PodRecord>>;

    /// All nodes ordered by name.
    async fn list_nodes(&self) -> CmdbResult<Vec<NodeRecord>>;

    /// True once every kind finished its initial replay; never reverts.
    fn is_ready(&self) -> bool;

    async fn stats(&self) -> CmdbResult<Stats>;
}

/// Serves reads straight from the store, concurrently with synchronization.
pub struct InProcApi {
    store: Arc<SqliteStore>,
    gate: SyncGate,
    stats: Arc<SyncStats>,
}

impl InProcApi {
    pub fn new(store: Arc<SqliteStore>, gate: SyncGate, stats: Arc<SyncStats>) -> Self {
        Self { store, gate, stats }
    }

    async fn blocking<T, F>(&self, op: &'static str, f: F) -> CmdbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
    {
        let t0 = Instant::now();
        let store = Arc::clone(&self.store);
        let res = tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| CmdbError::Internal(e.to_string()))?
            .map_err(CmdbError::from);
        histogram!("cmdb_api_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        if let Err(e) = &res {
            warn!(op, error = %e, "api: read failed");
        }
        res
    }
}

#[async_trait::async_trait]
impl CmdbApi for InProcApi {
    async fn list_pods(&self, namespace: Option<&str>) -> CmdbResult<Vec<PodRecord>> {
        let ns = namespace.filter(|ns| !ns.is_empty()).map(str::to_owned);
        let pods = self.blocking("list_pods", move |s| s.list_pods(ns.as_deref())).await?;
        info!(count = pods.len(), ns = %namespace.unwrap_or("(all)"), "api: list_pods ok");
        Ok(pods)
    }

    async fn list_nodes(&self) -> CmdbResult<Vec<NodeRecord>> {
        let nodes = self.blocking("list_nodes", |s| s.list_nodes()).await?;
        info!(count = nodes.len(), "api: list_nodes ok");
        Ok(nodes)
    }

    fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    async fn stats(&self) -> CmdbResult<Stats> {
        let counts = self.blocking("stats", |s| s.counts()).await?;
        let kinds = self
            .gate
            .kinds()
            .into_iter()
            .map(|kind| KindStats {
                kind,
                synced: self.gate.is_synced(kind),
                rows: match kind {
                    ResourceKind::Pod => counts.pods,
                    ResourceKind::Node => counts.nodes,
                },
                counters: self.stats.counters(kind),
            })
            .collect();
        Ok(Stats { ready: self.gate.is_ready(), kinds })
    }
}
