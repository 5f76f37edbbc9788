use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use cmdb_core::{EventSource, ResourceKind, SourceEvent};
use tokio::sync::mpsc;

/// Scripted in-memory event source for tests.
///
/// Each kind's script is delivered once, in order. With `hold_open` the
/// subscription then stays open until the engine stops listening, like a live
/// watch with no further changes.
#[derive(Default)]
pub struct MockSource {
    scripts: Mutex<HashMap<ResourceKind, Vec<SourceEvent>>>,
    hold_open: bool,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ResourceKind, events: Vec<SourceEvent>) -> Self {
        if let Ok(scripts) = self.scripts.get_mut() {
            scripts.entry(kind).or_default().extend(events);
        }
        self
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[async_trait::async_trait]
impl EventSource for MockSource {
    async fn subscribe(&self, kind: ResourceKind, tx: mpsc::Sender<SourceEvent>) -> anyhow::Result<()> {
        let script = self
            .scripts
            .lock()
            .map_err(|_| anyhow!("mock source script lock poisoned"))?
            .remove(&kind)
            .unwrap_or_default();
        for ev in script {
            if tx.send(ev).await.is_err() {
                return Ok(());
            }
        }
        if self.hold_open {
            tx.closed().await;
        }
        Ok(())
    }
}
