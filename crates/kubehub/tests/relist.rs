#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cmdb_core::{NodeRecord, Object, PodRecord, ResourceKind, Row, SourceEvent, StoreKey};
use cmdb_kubehub::{Observed, RelistTracker};
use cmdb_persist::{SqliteStore, Store, StoreError, StoreResult};
use cmdb_sync::{MockSource, SyncConfig, SyncEngine};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

static SEQ: AtomicUsize = AtomicUsize::new(0);

struct TempDb(PathBuf);

impl TempDb {
    fn new() -> Self {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        TempDb(std::env::temp_dir().join(format!("cmdb-relist-{}-{}.db", nanos, SEQ.fetch_add(1, Ordering::Relaxed))))
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", self.0.display(), suffix));
        }
    }
}

/// The first delete of `key` fails with an I/O error.
struct DeleteFailsOnce {
    inner: SqliteStore,
    key: &'static str,
    tripped: AtomicBool,
}

impl Store for DeleteFailsOnce {
    fn upsert(&self, row: &Row) -> StoreResult<()> {
        self.inner.upsert(row)
    }

    fn delete(&self, kind: ResourceKind, key: &str) -> StoreResult<bool> {
        if key == self.key && !self.tripped.swap(true, Ordering::SeqCst) {
            let e = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR), None);
            return Err(StoreError::Sqlite(e));
        }
        self.inner.delete(kind, key)
    }

    fn list_pods(&self, namespace: Option<&str>) -> StoreResult<Vec<PodRecord>> {
        self.inner.list_pods(namespace)
    }

    fn list_nodes(&self) -> StoreResult<Vec<NodeRecord>> {
        self.inner.list_nodes()
    }

    fn keys(&self, kind: ResourceKind) -> StoreResult<Vec<StoreKey>> {
        self.inner.keys(kind)
    }
}

fn pod(uid: &str) -> Object {
    Pod {
        metadata: ObjectMeta { uid: Some(uid.into()), name: Some(format!("p-{}", uid)), namespace: Some("default".into()), ..Default::default() },
        ..Default::default()
    }
    .into()
}

fn replay(observations: Vec<Observed>) -> Vec<SourceEvent> {
    let mut tracker = RelistTracker::new(ResourceKind::Pod);
    observations.into_iter().flat_map(|ob| tracker.observe(ob)).collect()
}

async fn sync(store: Arc<dyn Store>, events: Vec<SourceEvent>) {
    let source = MockSource::new().with(ResourceKind::Pod, events);
    let handle = SyncEngine::new(store, &[ResourceKind::Pod], SyncConfig { lanes: 1, queue_cap: 16 }).spawn(Arc::new(source));
    tokio::time::timeout(Duration::from_secs(10), handle.join()).await.expect("engine drained");
}

fn stored(store: &dyn Store) -> Vec<String> {
    store.list_pods(None).unwrap().into_iter().map(|p| p.uid).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_delete_is_repaired_by_next_relist() {
    let db = TempDb::new();
    let store = Arc::new(DeleteFailsOnce { inner: SqliteStore::open(&db.0).unwrap(), key: "u1", tripped: AtomicBool::new(false) });
    let events = replay(vec![
        Observed::Relisted(vec![pod("u1"), pod("u2")]),
        Observed::Deleted(pod("u1")),
        Observed::Relisted(vec![pod("u2")]),
    ]);
    sync(store.clone(), events).await;
    assert_eq!(stored(store.as_ref()), vec!["u2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rows_from_a_previous_run_are_dropped_on_first_relist() {
    let db = TempDb::new();
    {
        let previous = Arc::new(SqliteStore::open(&db.0).unwrap());
        sync(previous, replay(vec![Observed::Relisted(vec![pod("old"), pod("u2")])])).await;
    }

    let store = Arc::new(SqliteStore::open(&db.0).unwrap());
    let source = MockSource::new().with(ResourceKind::Pod, replay(vec![Observed::Relisted(vec![pod("u2")])])).hold_open();
    let engine = SyncEngine::new(store.clone(), &[ResourceKind::Pod], SyncConfig { lanes: 2, queue_cap: 16 });
    let handle = engine.spawn(Arc::new(source));
    tokio::time::timeout(Duration::from_secs(10), handle.gate().wait_ready()).await.expect("gate opened");
    assert_eq!(stored(store.as_ref()), vec!["u2"]);
    handle.shutdown();
}
