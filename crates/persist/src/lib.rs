//! SQLite store for mirrored pod and node records.
//!
//! One writer connection serializes every upsert and delete. Reads go through
//! a second connection so they never wait on the writer lock; in WAL mode they
//! see the last committed state (eventual, not snapshot, consistency across
//! keys).

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use cmdb_core::{NodeRecord, PodRecord, ResourceKind, Row, StoreKey};
use metrics::{counter, histogram};
use rusqlite::{types::Type, Connection, OptionalExtension};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("opening sqlite db at {path}: {source}")]
    Open { path: String, source: rusqlite::Error },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Keyed tables per resource kind. Upsert and delete are idempotent.
pub trait Store: Send + Sync {
    /// Insert or fully replace the mutable fields of the row's record.
    fn upsert(&self, row: &Row) -> StoreResult<()>;
    /// Remove the record for `key`; `Ok(false)` when it was already absent.
    fn delete(&self, kind: ResourceKind, key: &str) -> StoreResult<bool>;
    /// Pods filtered by namespace (ordered by name) or all pods (ordered by namespace, name).
    fn list_pods(&self, namespace: Option<&str>) -> StoreResult<Vec<PodRecord>>;
    /// All nodes ordered by name.
    fn list_nodes(&self) -> StoreResult<Vec<NodeRecord>>;
    /// Every stored key of `kind`, in key order.
    fn keys(&self, kind: ResourceKind) -> StoreResult<Vec<StoreKey>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub pods: u64,
    pub nodes: u64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pods(
    uid        TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    namespace  TEXT NOT NULL,
    phase      TEXT NOT NULL,
    node_name  TEXT NOT NULL,
    pod_ip     TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pods_ns_name ON pods(namespace, name);
CREATE TABLE IF NOT EXISTS nodes(
    name         TEXT PRIMARY KEY,
    labels       TEXT NOT NULL,
    capacity_cpu TEXT NOT NULL,
    capacity_mem TEXT NOT NULL,
    internal_ip  TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);
";

const UPSERT_POD: &str = "
INSERT INTO pods(uid, name, namespace, phase, node_name, pod_ip, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
ON CONFLICT(uid) DO UPDATE SET
    name       = excluded.name,
    namespace  = excluded.namespace,
    phase      = excluded.phase,
    node_name  = excluded.node_name,
    pod_ip     = excluded.pod_ip,
    updated_at = max(pods.updated_at, excluded.updated_at)";

const UPSERT_NODE: &str = "
INSERT INTO nodes(name, labels, capacity_cpu, capacity_mem, internal_ip, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
ON CONFLICT(name) DO UPDATE SET
    labels       = excluded.labels,
    capacity_cpu = excluded.capacity_cpu,
    capacity_mem = excluded.capacity_mem,
    internal_ip  = excluded.internal_ip,
    updated_at   = max(nodes.updated_at, excluded.updated_at)";

const POD_COLS: &str = "uid, name, namespace, phase, node_name, pod_ip, created_at, updated_at";
const NODE_COLS: &str = "name, labels, capacity_cpu, capacity_mem, internal_ip, created_at, updated_at";

/// SQLite-backed store. Synchronous; callers on an async runtime should hop
/// onto the blocking pool.
pub struct SqliteStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
    wal: bool,
}

impl SqliteStore {
    pub fn open_default() -> StoreResult<Self> {
        let path = std::env::var("CMDB_DB_PATH").map(PathBuf::from).unwrap_or_else(|_| default_db_path());
        Self::open(path)
    }

    /// Open (or create) the database and provision both tables.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let started = Instant::now();
        let path = path.as_ref().to_path_buf();
        let writer = connect(&path)?;
        let wal = enable_wal(&writer);
        writer.pragma_update(None, "synchronous", "NORMAL").ok();
        writer.execute_batch(SCHEMA)?;
        let reader = connect(&path)?;
        histogram!("cmdb_store_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %path.display(), "store opened");
        Ok(Self { writer: Mutex::new(writer), reader: Mutex::new(reader), path, wal })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// False when the database refused WAL; reads may then wait on writes.
    pub fn is_wal(&self) -> bool {
        self.wal
    }

    /// Upsert stamping `now` as the observation time. `created_at` is only set
    /// on insert; `updated_at` never moves backwards.
    pub fn upsert_at(&self, row: &Row, now: DateTime<Utc>) -> StoreResult<()> {
        let started = Instant::now();
        let ts = fmt_ts(now);
        let db = self.write_conn()?;
        match row {
            Row::Pod(p) => {
                db.prepare_cached(UPSERT_POD)?
                    .execute((&p.uid, &p.name, &p.namespace, &p.phase, &p.node_name, &p.pod_ip, &ts))?;
            }
            Row::Node(n) => {
                db.prepare_cached(UPSERT_NODE)?
                    .execute((&n.name, &n.labels, &n.cpu_capacity, &n.mem_capacity, &n.internal_ip, &ts))?;
            }
        }
        drop(db);
        histogram!("cmdb_store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("cmdb_store_upserts_total", 1u64, "kind" => row.kind().as_str());
        Ok(())
    }

    pub fn get_pod(&self, uid: &str) -> StoreResult<Option<PodRecord>> {
        let db = self.read_conn()?;
        let sql = format!("SELECT {} FROM pods WHERE uid = ?1", POD_COLS);
        let rec = db.query_row(&sql, [uid], pod_from_row).optional()?;
        Ok(rec)
    }

    pub fn get_node(&self, name: &str) -> StoreResult<Option<NodeRecord>> {
        let db = self.read_conn()?;
        let sql = format!("SELECT {} FROM nodes WHERE name = ?1", NODE_COLS);
        let rec = db.query_row(&sql, [name], node_from_row).optional()?;
        Ok(rec)
    }

    pub fn counts(&self) -> StoreResult<Counts> {
        let db = self.read_conn()?;
        let pods: i64 = db.query_row("SELECT COUNT(*) FROM pods", [], |r| r.get(0))?;
        let nodes: i64 = db.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
        Ok(Counts { pods: pods.max(0) as u64, nodes: nodes.max(0) as u64 })
    }

    fn write_conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.writer.lock().map_err(|_| StoreError::Poisoned)
    }

    fn read_conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.reader.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Store for SqliteStore {
    fn upsert(&self, row: &Row) -> StoreResult<()> {
        self.upsert_at(row, Utc::now())
    }

    fn delete(&self, kind: ResourceKind, key: &str) -> StoreResult<bool> {
        let started = Instant::now();
        let sql = match kind {
            ResourceKind::Pod => "DELETE FROM pods WHERE uid = ?1",
            ResourceKind::Node => "DELETE FROM nodes WHERE name = ?1",
        };
        let removed = self.write_conn()?.prepare_cached(sql)?.execute([key])?;
        histogram!("cmdb_store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("cmdb_store_deletes_total", 1u64, "kind" => kind.as_str());
        debug!(%kind, key, removed, "store delete");
        Ok(removed > 0)
    }

    fn list_pods(&self, namespace: Option<&str>) -> StoreResult<Vec<PodRecord>> {
        let started = Instant::now();
        let db = self.read_conn()?;
        let out = match namespace {
            Some(ns) => {
                let sql = format!("SELECT {} FROM pods WHERE namespace = ?1 ORDER BY name, uid", POD_COLS);
                let mut stmt = db.prepare_cached(&sql)?;
                let rows = stmt.query_map([ns], pod_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!("SELECT {} FROM pods ORDER BY namespace, name, uid", POD_COLS);
                let mut stmt = db.prepare_cached(&sql)?;
                let rows = stmt.query_map([], pod_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        histogram!("cmdb_store_read_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn list_nodes(&self) -> StoreResult<Vec<NodeRecord>> {
        let started = Instant::now();
        let db = self.read_conn()?;
        let sql = format!("SELECT {} FROM nodes ORDER BY name", NODE_COLS);
        let mut stmt = db.prepare_cached(&sql)?;
        let out = stmt.query_map([], node_from_row)?.collect::<Result<Vec<_>, _>>()?;
        histogram!("cmdb_store_read_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn keys(&self, kind: ResourceKind) -> StoreResult<Vec<StoreKey>> {
        let sql = match kind {
            ResourceKind::Pod => "SELECT uid FROM pods ORDER BY uid",
            ResourceKind::Node => "SELECT name FROM nodes ORDER BY name",
        };
        let db = self.read_conn()?;
        let mut stmt = db.prepare_cached(sql)?;
        let keys = stmt.query_map([], |r| r.get(0))?.collect::<Result<Vec<StoreKey>, _>>()?;
        Ok(keys)
    }
}

/// Switch `db` to WAL. Any other resulting mode is logged and reported as false.
fn enable_wal(db: &Connection) -> bool {
    match db.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0)) {
        Ok(mode) if mode.eq_ignore_ascii_case("wal") => {
            debug!(journal_mode = %mode, "sqlite journal mode");
            true
        }
        Ok(mode) => {
            warn!(journal_mode = %mode, "WAL unavailable; reads may wait on writer transactions");
            false
        }
        Err(e) => {
            warn!(error = %e, "enabling WAL failed; reads may wait on writer transactions");
            false
        }
    }
}

fn connect(path: &Path) -> StoreResult<Connection> {
    let db = Connection::open(path).map_err(|source| StoreError::Open { path: path.display().to_string(), source })?;
    db.busy_timeout(Duration::from_secs(5))?;
    Ok(db)
}

fn pod_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<PodRecord> {
    Ok(PodRecord {
        uid: r.get(0)?,
        name: r.get(1)?,
        namespace: r.get(2)?,
        phase: r.get(3)?,
        node_name: r.get(4)?,
        pod_ip: r.get(5)?,
        created_at: ts_col(r, 6)?,
        updated_at: ts_col(r, 7)?,
    })
}

fn node_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRecord> {
    Ok(NodeRecord {
        name: r.get(0)?,
        labels: r.get(1)?,
        cpu_capacity: r.get(2)?,
        mem_capacity: r.get(3)?,
        internal_ip: r.get(4)?,
        created_at: ts_col(r, 5)?,
        updated_at: ts_col(r, 6)?,
    })
}

/// Fixed-width UTC form so that SQL `max()` on the text agrees with time order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ts_col(r: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = r.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn default_db_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".cmdb");
        let _ = std::fs::create_dir_all(&p);
        p.push("cmdb.db");
        return p;
    }
    PathBuf::from("cmdb.db")
}
