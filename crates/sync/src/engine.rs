//! Task layout per kind: source -> dispatcher -> N lanes -> pipeline.
//!
//! The dispatcher routes each event to a lane by hash of its store key, so all
//! events of one key are applied in delivery order. Different lanes (and
//! kinds) proceed independently; the store serializes their writes.
//!
//! A `Relisted` marker drains every lane of the kind, then deletes each stored
//! key the snapshot did not contain. Stale rows left by a failed delete or by
//! changes missed while the process was down are removed this way.

use std::sync::Arc;

use cmdb_core::{EventSource, KeyHashPlanner, LanePlanner, ResourceKind, SourceEvent, StoreKey, Tombstone, WatchEvent};
use cmdb_persist::Store;
use metrics::counter;
use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{Pipeline, SyncConfig, SyncGate, SyncStats};

enum LaneMsg {
    Apply(WatchEvent),
    /// Acknowledged once every earlier message of the lane has been applied.
    Barrier(oneshot::Sender<()>),
}

pub struct SyncEngine {
    pipeline: Arc<Pipeline>,
    gate: SyncGate,
    planner: Arc<dyn LanePlanner>,
    cfg: SyncConfig,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn Store>, kinds: &[ResourceKind], cfg: SyncConfig) -> Self {
        let stats = Arc::new(SyncStats::default());
        Self {
            pipeline: Arc::new(Pipeline::new(store, stats)),
            gate: SyncGate::new(kinds),
            planner: Arc::new(KeyHashPlanner::new(cfg.lanes)),
            cfg,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn LanePlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn gate(&self) -> SyncGate {
        self.gate.clone()
    }

    pub fn stats(&self) -> Arc<SyncStats> {
        Arc::clone(self.pipeline.stats())
    }

    /// Start every kind's tasks against `source`.
    pub fn spawn(self, source: Arc<dyn EventSource>) -> EngineHandle {
        let mut tasks = Vec::new();
        let lanes = self.planner.lanes().max(1);
        for kind in self.gate.kinds() {
            let (src_tx, src_rx) = mpsc::channel::<SourceEvent>(self.cfg.queue_cap.max(1));
            tasks.push(tokio::spawn({
                let source = Arc::clone(&source);
                async move {
                    match source.subscribe(kind, src_tx).await {
                        Ok(()) => info!(%kind, "event source finished"),
                        Err(e) => error!(%kind, error = ?e, "event source failed"),
                    }
                }
            }));

            let mut lane_txs = Vec::with_capacity(lanes);
            for lane in 0..lanes {
                let (tx, rx) = mpsc::channel::<LaneMsg>(self.cfg.queue_cap.max(1));
                lane_txs.push(tx);
                tasks.push(tokio::spawn(run_lane(kind, lane, rx, Arc::clone(&self.pipeline))));
            }
            tasks.push(tokio::spawn(run_dispatch(
                kind,
                src_rx,
                lane_txs,
                Arc::clone(&self.planner),
                Arc::clone(&self.pipeline),
                self.gate.clone(),
            )));
            info!(%kind, lanes, "sync pipeline started");
        }
        EngineHandle { tasks, gate: self.gate, stats: Arc::clone(self.pipeline.stats()) }
    }
}

async fn run_dispatch(
    kind: ResourceKind,
    mut rx: mpsc::Receiver<SourceEvent>,
    lanes: Vec<mpsc::Sender<LaneMsg>>,
    planner: Arc<dyn LanePlanner>,
    pipeline: Arc<Pipeline>,
    gate: SyncGate,
) {
    let route = |key: Option<&str>| key.map(|k| planner.plan(kind, k)).unwrap_or(0) % lanes.len();
    let mut barriers: Vec<JoinHandle<()>> = Vec::new();
    while let Some(item) = rx.recv().await {
        match item {
            SourceEvent::Watch(ev) => {
                counter!("cmdb_events_total", 1u64, "kind" => kind.as_str());
                // Keyless events cannot be projected; any lane will do.
                let lane = route(ev.key());
                if lanes[lane].send(LaneMsg::Apply(ev)).await.is_err() {
                    warn!(%kind, lane, "lane closed; stopping dispatcher");
                    return;
                }
            }
            SourceEvent::Relisted { keys, .. } => {
                let Some(acks) = barrier(&lanes).await else {
                    warn!(%kind, "lane closed; stopping dispatcher");
                    return;
                };
                for ack in acks {
                    if ack.await.is_err() {
                        warn!(%kind, "lane dropped during relist; stopping dispatcher");
                        return;
                    }
                }
                let stale = match stale_keys(&pipeline, kind, keys).await {
                    Ok(stale) => stale,
                    Err(e) => {
                        counter!("cmdb_reconcile_failures_total", 1u64, "kind" => kind.as_str());
                        warn!(%kind, error = %e, "listing stored keys failed; stale rows kept until next relist");
                        continue;
                    }
                };
                if !stale.is_empty() {
                    info!(%kind, stale = stale.len(), "removing rows missing from relist");
                }
                for key in stale {
                    counter!("cmdb_reconcile_deletes_total", 1u64, "kind" => kind.as_str());
                    let lane = route(Some(key.as_str()));
                    let ev = WatchEvent::DeletedAmbiguous(Tombstone { kind, key });
                    if lanes[lane].send(LaneMsg::Apply(ev)).await.is_err() {
                        warn!(%kind, lane, "lane closed; stopping dispatcher");
                        return;
                    }
                }
            }
            SourceEvent::InitialSyncDone(synced) => {
                let Some(acks) = barrier(&lanes).await else {
                    warn!(%kind, "lane closed; stopping dispatcher");
                    return;
                };
                let gate = gate.clone();
                barriers.push(tokio::spawn(async move {
                    for ack in acks {
                        if ack.await.is_err() {
                            debug!(kind = %synced, "lane dropped before barrier; gate left unsignaled");
                            return;
                        }
                    }
                    if gate.mark_synced(synced) {
                        info!(kind = %synced, "initial sync complete");
                    }
                }));
            }
        }
    }
    debug!(%kind, "source channel closed; dispatcher exiting");
    drop(lanes);
    for b in barriers {
        let _ = b.await;
    }
}

/// Queue a barrier behind everything already sent to each lane.
async fn barrier(lanes: &[mpsc::Sender<LaneMsg>]) -> Option<Vec<oneshot::Receiver<()>>> {
    let mut acks = Vec::with_capacity(lanes.len());
    for tx in lanes {
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(LaneMsg::Barrier(ack_tx)).await.ok()?;
        acks.push(ack_rx);
    }
    Some(acks)
}

/// Stored keys of `kind` that are not in `listed`, in key order.
async fn stale_keys(pipeline: &Arc<Pipeline>, kind: ResourceKind, listed: Vec<StoreKey>) -> anyhow::Result<Vec<StoreKey>> {
    let store = Arc::clone(pipeline.store());
    let stored = tokio::task::spawn_blocking(move || store.keys(kind)).await??;
    let listed: FxHashSet<StoreKey> = listed.into_iter().collect();
    Ok(stored.into_iter().filter(|k| !listed.contains(k)).collect())
}

async fn run_lane(kind: ResourceKind, lane: usize, mut rx: mpsc::Receiver<LaneMsg>, pipeline: Arc<Pipeline>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            LaneMsg::Apply(ev) => {
                let p = Arc::clone(&pipeline);
                // Write completes before the lane takes its next event.
                if let Err(e) = tokio::task::spawn_blocking(move || p.handle(&ev)).await {
                    error!(%kind, lane, error = %e, "apply task failed");
                }
            }
            LaneMsg::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!(%kind, lane, "lane drained");
}

/// Owns every task of a running engine. Cancellation is all-or-nothing.
pub struct EngineHandle {
    tasks: Vec<JoinHandle<()>>,
    gate: SyncGate,
    stats: Arc<SyncStats>,
}

impl EngineHandle {
    pub fn gate(&self) -> &SyncGate {
        &self.gate
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    /// Abort every task. In-flight blocking writes run to completion.
    pub fn shutdown(self) {
        for t in self.tasks {
            t.abort();
        }
        info!("sync engine stopped");
    }

    /// Wait until every source has finished and all queued events are applied.
    pub async fn join(self) {
        for t in self.tasks {
            if let Err(e) = t.await {
                if !e.is_cancelled() {
                    error!(error = %e, "sync task panicked");
                }
            }
        }
    }
}
