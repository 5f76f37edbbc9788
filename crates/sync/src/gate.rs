//! Readiness barrier: one one-shot latch per subscribed kind.

use std::collections::BTreeMap;
use std::sync::Arc;

use cmdb_core::ResourceKind;
use tokio::sync::watch;
use tracing::warn;

/// Cheap to clone; all clones observe the same latches.
#[derive(Clone)]
pub struct SyncGate {
    latches: Arc<BTreeMap<ResourceKind, watch::Sender<bool>>>,
}

impl SyncGate {
    pub fn new(kinds: &[ResourceKind]) -> Self {
        let latches = kinds.iter().map(|k| (*k, watch::channel(false).0)).collect();
        Self { latches: Arc::new(latches) }
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.latches.keys().copied().collect()
    }

    /// Signal `kind`. Returns true only for the call that flipped the latch.
    pub fn mark_synced(&self, kind: ResourceKind) -> bool {
        match self.latches.get(&kind) {
            Some(tx) => tx.send_if_modified(|synced| !std::mem::replace(synced, true)),
            None => {
                warn!(%kind, "sync signal for a kind that is not gated");
                false
            }
        }
    }

    pub fn is_synced(&self, kind: ResourceKind) -> bool {
        self.latches.get(&kind).map(|tx| *tx.borrow()).unwrap_or(false)
    }

    /// True once every subscribed kind has completed its initial replay.
    pub fn is_ready(&self) -> bool {
        self.latches.values().all(|tx| *tx.borrow())
    }

    pub async fn wait_ready(&self) {
        for tx in self.latches.values() {
            let mut rx = tx.subscribe();
            // Sender is owned by self, so the channel cannot close here.
            let _ = rx.wait_for(|synced| *synced).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn ready_requires_every_kind() {
        let gate = SyncGate::new(&ResourceKind::ALL);
        assert!(!gate.is_ready());
        assert!(gate.mark_synced(ResourceKind::Pod));
        assert!(gate.is_synced(ResourceKind::Pod));
        assert!(!gate.is_ready());
        assert!(gate.mark_synced(ResourceKind::Node));
        assert!(gate.is_ready());
    }

    #[test]
    fn latch_flips_once() {
        let gate = SyncGate::new(&[ResourceKind::Node]);
        assert!(gate.mark_synced(ResourceKind::Node));
        assert!(!gate.mark_synced(ResourceKind::Node));
        assert!(!gate.mark_synced(ResourceKind::Pod));
        assert!(gate.is_ready());
    }

    #[test]
    fn empty_gate_is_ready() {
        assert!(SyncGate::new(&[]).is_ready());
    }

    #[tokio::test]
    async fn wait_ready_wakes_on_last_latch() {
        let gate = SyncGate::new(&ResourceKind::ALL);
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait_ready().await }
        });
        gate.mark_synced(ResourceKind::Node);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        gate.mark_synced(ResourceKind::Pod);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(gate.is_ready());
    }
}
