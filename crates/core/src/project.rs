//! Projection of remote objects onto flat store rows.
//!
//! Pure functions: no I/O, no clock. Timestamps are assigned by the store.

use k8s_openapi::api::core::v1::{Node, Pod};

use crate::{NodeRow, PodRow, ResourceKind, Row, Tombstone, WatchEvent};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProjectError {
    #[error("{kind} object is missing its store key")]
    MissingKey { kind: ResourceKind },
}

/// What the store should do for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Upsert(Row),
    Delete(Tombstone),
}

pub fn project(event: &WatchEvent) -> Result<Projection, ProjectError> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
            let row = match obj {
                crate::Object::Pod(p) => Row::Pod(project_pod(p)?),
                crate::Object::Node(n) => Row::Node(project_node(n)?),
            };
            Ok(Projection::Upsert(row))
        }
        WatchEvent::Deleted(obj) => {
            let kind = obj.kind();
            let key = obj.store_key().ok_or(ProjectError::MissingKey { kind })?;
            Ok(Projection::Delete(Tombstone { kind, key: key.to_string() }))
        }
        WatchEvent::DeletedAmbiguous(t) => Ok(Projection::Delete(t.clone())),
    }
}

pub fn project_pod(pod: &Pod) -> Result<PodRow, ProjectError> {
    let uid = pod.metadata.uid.clone().ok_or(ProjectError::MissingKey { kind: ResourceKind::Pod })?;
    let status = pod.status.as_ref();
    Ok(PodRow {
        uid,
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()).unwrap_or_default(),
        pod_ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
    })
}

pub fn project_node(node: &Node) -> Result<NodeRow, ProjectError> {
    let name = node.metadata.name.clone().ok_or(ProjectError::MissingKey { kind: ResourceKind::Node })?;
    let status = node.status.as_ref();
    let capacity = |res: &str| {
        status
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get(res))
            .map(|q| q.0.clone())
            .unwrap_or_default()
    };
    let internal_ip = status
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| a.address.clone())
        .unwrap_or_default();
    Ok(NodeRow {
        name,
        labels: flatten_labels(node.metadata.labels.iter().flatten()),
        cpu_capacity: capacity("cpu"),
        mem_capacity: capacity("memory"),
        internal_ip,
    })
}

/// `k=v` pairs joined by commas, in iteration order of the source map.
fn flatten_labels<'a>(labels: impl Iterator<Item = (&'a String, &'a String)>) -> String {
    labels.map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}
