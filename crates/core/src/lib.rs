//! Cluster mirror core types: resource kinds, watch events, rows and records.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod project;

pub use project::{project, project_node, project_pod, ProjectError, Projection};

/// Store key: `metadata.uid` for pods, `metadata.name` for nodes.
pub type StoreKey = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pod,
    Node,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Pod, ResourceKind::Node];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Node => "node",
        }
    }

    /// Backing table name.
    pub fn table(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pods",
            ResourceKind::Node => "nodes",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    DeletedAmbiguous,
}

/// A full remote object as delivered by the event source.
#[derive(Debug, Clone)]
pub enum Object {
    Pod(Box<Pod>),
    Node(Box<Node>),
}

impl Object {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Object::Pod(_) => ResourceKind::Pod,
            Object::Node(_) => ResourceKind::Node,
        }
    }

    /// Returns `None` when the identifying metadata field is missing.
    pub fn store_key(&self) -> Option<&str> {
        match self {
            Object::Pod(p) => p.metadata.uid.as_deref(),
            Object::Node(n) => n.metadata.name.as_deref(),
        }
    }

    /// Human readable `namespace/name` (or `name`) for logs.
    pub fn display_name(&self) -> String {
        let meta = match self {
            Object::Pod(p) => &p.metadata,
            Object::Node(n) => &n.metadata,
        };
        let name = meta.name.as_deref().unwrap_or("");
        match meta.namespace.as_deref() {
            Some(ns) => format!("{}/{}", ns, name),
            None => name.to_string(),
        }
    }
}

impl From<Pod> for Object {
    fn from(p: Pod) -> Self {
        Object::Pod(Box::new(p))
    }
}

impl From<Node> for Object {
    fn from(n: Node) -> Self {
        Object::Node(Box::new(n))
    }
}

/// Key-only deletion notice: the final object state was missed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub kind: ResourceKind,
    pub key: StoreKey,
}

/// One lifecycle notification for one resource instance.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
    DeletedAmbiguous(Tombstone),
}

impl WatchEvent {
    pub fn kind(&self) -> ResourceKind {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.kind(),
            WatchEvent::DeletedAmbiguous(t) => t.kind,
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            WatchEvent::Added(_) => EventType::Added,
            WatchEvent::Modified(_) => EventType::Modified,
            WatchEvent::Deleted(_) => EventType::Deleted,
            WatchEvent::DeletedAmbiguous(_) => EventType::DeletedAmbiguous,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.store_key(),
            WatchEvent::DeletedAmbiguous(t) => Some(t.key.as_str()),
        }
    }
}

/// Items emitted by an [`EventSource`] for one resource kind.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Watch(WatchEvent),
    /// A full-snapshot replay has just been emitted; `keys` lists every key it
    /// contained. Stored keys of `kind` outside this set are stale.
    Relisted { kind: ResourceKind, keys: Vec<StoreKey> },
    /// The first full-snapshot replay for this kind has been emitted. Sent once.
    InitialSyncDone(ResourceKind),
}

/// Subscribes to a remote collection of one resource kind.
///
/// Implementations deliver per-key ordered, at-least-once events into `tx`,
/// starting with a full-snapshot replay, and recover connection loss on their
/// own. They return when `tx` is closed or the remote stream ends for good.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync + 'static {
    async fn subscribe(&self, kind: ResourceKind, tx: mpsc::Sender<SourceEvent>) -> anyhow::Result<()>;
}

// ---- rows (projector output) ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRow {
    pub uid: StoreKey,
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub node_name: String,
    pub pod_ip: String,
}

/// `labels` is a comma-joined `key=value` list. Consumers must not rely on
/// its ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
    pub name: StoreKey,
    pub labels: String,
    pub cpu_capacity: String,
    pub mem_capacity: String,
    pub internal_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Pod(PodRow),
    Node(NodeRow),
}

impl Row {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Row::Pod(_) => ResourceKind::Pod,
            Row::Node(_) => ResourceKind::Node,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Row::Pod(p) => &p.uid,
            Row::Node(n) => &n.name,
        }
    }
}

// ---- records (stored state) ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRecord {
    pub uid: StoreKey,
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub node_name: String,
    #[serde(rename = "podIP")]
    pub pod_ip: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub name: StoreKey,
    pub labels: String,
    pub cpu_capacity: String,
    pub mem_capacity: String,
    #[serde(rename = "internalIP")]
    pub internal_ip: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub mod prelude {
    pub use super::{
        EventSource, EventType, NodeRecord, NodeRow, Object, PodRecord, PodRow, ResourceKind, Row, SourceEvent,
        StoreKey, Tombstone, WatchEvent,
    };
    pub use super::{KeyHashPlanner, LanePlanner};
}

// ---- lane planning ----

/// Maps a store key onto one of the processing lanes of its kind. The same key
/// must always map to the same lane.
pub trait LanePlanner: Send + Sync {
    fn plan(&self, kind: ResourceKind, key: &str) -> usize;
    fn lanes(&self) -> usize;
}

/// Default planner: modulo bucketing of a 64-bit FNV-1a hash of the key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeyHashPlanner {
    lanes: u16,
}

impl KeyHashPlanner {
    pub fn new(lanes: usize) -> Self {
        Self { lanes: lanes.clamp(1, u16::MAX as usize) as u16 }
    }
}

impl LanePlanner for KeyHashPlanner {
    fn plan(&self, _kind: ResourceKind, key: &str) -> usize {
        if self.lanes <= 1 {
            return 0;
        }
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        for b in key.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % self.lanes as u64) as usize
    }

    fn lanes(&self) -> usize {
        self.lanes as usize
    }
}
