//! Kubernetes event source: client bootstrap and list+watch wiring

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use cmdb_core::{EventSource, Object, ResourceKind, SourceEvent};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod tracker;

pub use tracker::{Observed, RelistTracker};

/// Source tuning read from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceConfig {
    /// Interval of forced full-snapshot replays; `None` disables them.
    pub relist: Option<Duration>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { relist: Some(Duration::from_secs(300)) }
    }
}

impl SourceConfig {
    pub fn from_env() -> Self {
        let secs = std::env::var("CMDB_RELIST_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(300);
        Self::with_relist_secs(secs)
    }

    pub fn with_relist_secs(secs: u64) -> Self {
        Self { relist: (secs > 0).then(|| Duration::from_secs(secs)) }
    }
}

/// Build a client from an explicit kubeconfig file, or infer one (in-cluster
/// service account, `KUBECONFIG`, `~/.kube/config`), then probe the API server.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let client = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("loading kubeconfig {}", path.display()))?;
            Client::try_from(cfg).context("building kube client")?
        }
        None => Client::try_default().await.context("inferring kube config")?,
    };
    let version = client.apiserver_version().await.context("probing API server")?;
    info!(version = %version.git_version, "connected to control plane");
    Ok(client)
}

/// List+watch over every namespace for pods and nodes.
pub struct KubeSource {
    client: Client,
    cfg: SourceConfig,
}

impl KubeSource {
    pub fn new(client: Client, cfg: SourceConfig) -> Self {
        Self { client, cfg }
    }
}

#[async_trait::async_trait]
impl EventSource for KubeSource {
    async fn subscribe(&self, kind: ResourceKind, tx: mpsc::Sender<SourceEvent>) -> Result<()> {
        match kind {
            ResourceKind::Pod => run_watch(Api::<Pod>::all(self.client.clone()), kind, self.cfg.relist, tx).await,
            ResourceKind::Node => run_watch(Api::<Node>::all(self.client.clone()), kind, self.cfg.relist, tx).await,
        }
    }
}

fn observed<K>(ev: Event<K>) -> Observed
where
    Object: From<K>,
{
    match ev {
        Event::Applied(o) => Observed::Applied(o.into()),
        Event::Deleted(o) => Observed::Deleted(o.into()),
        Event::Restarted(list) => Observed::Relisted(list.into_iter().map(Object::from).collect()),
    }
}

/// Drive one kind's watcher until `tx` closes. Watch errors are retried with
/// backoff and never returned. When `relist` is set the watcher is rebuilt on
/// that interval, which replays the full snapshot.
async fn run_watch<K>(api: Api<K>, kind: ResourceKind, relist: Option<Duration>, tx: mpsc::Sender<SourceEvent>) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    Object: From<K>,
{
    let mut tracker = RelistTracker::new(kind);
    let mut pass: u64 = 0;
    loop {
        pass += 1;
        let stream = watcher::watcher(api.clone(), watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        let reconcile = async {
            match relist {
                Some(every) => tokio::time::sleep(every).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(reconcile);
        info!(%kind, pass, "watcher started");
        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = &mut reconcile => {
                    info!(%kind, "periodic reconciliation; restarting watcher");
                    break;
                }
            };
            let Some(item) = item else {
                warn!(%kind, "watcher stream ended");
                return Ok(());
            };
            match item {
                Ok(ev) => {
                    for out in tracker.observe(observed(ev)) {
                        if let SourceEvent::Watch(w) = &out {
                            counter!("cmdb_source_events_total", 1u64, "kind" => kind.as_str(), "type" => event_label(w.event_type()));
                        }
                        if tx.send(out).await.is_err() {
                            debug!(%kind, "event receiver closed; stopping watcher");
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    counter!("cmdb_watch_errors_total", 1u64, "kind" => kind.as_str());
                    warn!(%kind, error = %e, "watch error; retrying with backoff");
                }
            }
        }
    }
}

fn event_label(t: cmdb_core::EventType) -> &'static str {
    match t {
        cmdb_core::EventType::Added => "added",
        cmdb_core::EventType::Modified => "modified",
        cmdb_core::EventType::Deleted => "deleted",
        cmdb_core::EventType::DeletedAmbiguous => "deleted_ambiguous",
    }
}
