//! Turns raw list+watch observations into watch events.
//!
//! Tracks the keys seen since the last relist for one kind, which splits
//! applied objects into Added and Modified. Every relist closes with a
//! `Relisted` marker carrying the listed keys; the engine diffs that set
//! against the store and removes the rest as `DeletedAmbiguous`.

use cmdb_core::{Object, ResourceKind, SourceEvent, StoreKey, WatchEvent};
use rustc_hash::FxHashSet;
use tracing::debug;

#[derive(Debug)]
pub enum Observed {
    Applied(Object),
    Deleted(Object),
    /// Complete current state after (re)connecting.
    Relisted(Vec<Object>),
}

pub struct RelistTracker {
    kind: ResourceKind,
    known: FxHashSet<StoreKey>,
    synced: bool,
}

impl RelistTracker {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, known: FxHashSet::default(), synced: false }
    }

    pub fn known(&self) -> usize {
        self.known.len()
    }

    pub fn observe(&mut self, ob: Observed) -> Vec<SourceEvent> {
        match ob {
            Observed::Applied(obj) => {
                let fresh = match obj.store_key() {
                    Some(key) => self.known.insert(key.to_string()),
                    None => true,
                };
                let ev = if fresh { WatchEvent::Added(obj) } else { WatchEvent::Modified(obj) };
                vec![SourceEvent::Watch(ev)]
            }
            Observed::Deleted(obj) => {
                if let Some(key) = obj.store_key() {
                    self.known.remove(key);
                }
                vec![SourceEvent::Watch(WatchEvent::Deleted(obj))]
            }
            Observed::Relisted(list) => self.relist(list),
        }
    }

    fn relist(&mut self, list: Vec<Object>) -> Vec<SourceEvent> {
        let mut next = FxHashSet::default();
        let mut out = Vec::with_capacity(list.len() + 2);
        for obj in list {
            if let Some(key) = obj.store_key() {
                next.insert(key.to_string());
            }
            out.push(SourceEvent::Watch(WatchEvent::Added(obj)));
        }
        let mut keys: Vec<StoreKey> = next.iter().cloned().collect();
        keys.sort_unstable();
        debug!(kind = %self.kind, listed = keys.len(), previously = self.known.len(), "relist");
        out.push(SourceEvent::Relisted { kind: self.kind, keys });
        self.known = next;
        if !self.synced {
            self.synced = true;
            out.push(SourceEvent::InitialSyncDone(self.kind));
        }
        out
    }
}
