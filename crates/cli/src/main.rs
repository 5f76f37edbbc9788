use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use cmdb_api::{CmdbApi, InProcApi};
use cmdb_core::ResourceKind;
use cmdb_kubehub::{KubeSource, SourceConfig};
use cmdb_persist::{SqliteStore, Store};
use cmdb_sync::{SyncConfig, SyncEngine};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Log filter directives, e.g. `info,cmdb_sync=debug`.
const LOG_ENV: &str = "CMDB_LOG";
/// `host:port` for the Prometheus scrape endpoint; unset disables export.
const METRICS_ENV: &str = "CMDB_METRICS_ADDR";

#[derive(Parser, Debug)]
#[command(name = "cmdbctl", version, about = "Cluster mirror CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database path (default: ~/.cmdb/cmdb.db)
    #[arg(long = "db", global = true, env = "CMDB_DB_PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror pods and nodes of every namespace into the store
    Sync {
        /// Kubeconfig file (default: in-cluster, $KUBECONFIG or ~/.kube/config)
        #[arg(long = "kubeconfig")]
        kubeconfig: Option<PathBuf>,
        /// Exit once the initial sync of every kind is applied
        #[arg(long = "until-ready", action = ArgAction::SetTrue)]
        until_ready: bool,
        /// Processing lanes per kind
        #[arg(long = "lanes", env = "CMDB_LANES", default_value_t = 4)]
        lanes: usize,
        /// Seconds between forced full relists (0 disables)
        #[arg(long = "relist-secs", env = "CMDB_RELIST_SECS", default_value_t = 300)]
        relist_secs: u64,
    },
    /// List mirrored pods
    Pods {
        /// Only pods in this namespace
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
    /// List mirrored nodes
    Nodes,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    let Ok(raw) = std::env::var(METRICS_ENV) else { return };
    let addr: SocketAddr = match raw.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(env = METRICS_ENV, value = %raw, error = %e, "not a host:port; metrics export disabled");
            return;
        }
    };
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        warn!(%addr, error = %e, "metrics exporter not installed");
        return;
    }
    info!(%addr, "serving Prometheus metrics");
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteStore> {
    let store = match db {
        Some(path) => SqliteStore::open(&path),
        None => SqliteStore::open_default(),
    };
    store.context("provisioning store")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { kubeconfig, until_ready, lanes, relist_secs } => {
            let store = Arc::new(open_store(cli.db)?);
            let client = cmdb_kubehub::connect(kubeconfig.as_deref()).await?;
            let source = Arc::new(KubeSource::new(client, SourceConfig::with_relist_secs(relist_secs)));
            let cfg = SyncConfig { lanes: lanes.max(1), ..SyncConfig::from_env() };
            info!(lanes = cfg.lanes, queue_cap = cfg.queue_cap, relist_secs, db = %store.path().display(), "sync invoked");

            let engine = SyncEngine::new(store.clone(), &ResourceKind::ALL, cfg);
            let api = InProcApi::new(store, engine.gate(), engine.stats());
            let handle = engine.spawn(source);
            let gate = handle.gate().clone();

            tokio::spawn({
                let gate = gate.clone();
                async move {
                    gate.wait_ready().await;
                    info!("initial sync applied for every kind; mirror is query-safe");
                }
            });

            if until_ready {
                tokio::select! {
                    _ = gate.wait_ready() => {}
                    _ = signal::ctrl_c() => info!("Ctrl-C received before initial sync completed"),
                }
                let stats = api.stats().await?;
                match cli.output {
                    Output::Human => {
                        println!("ready: {}", stats.ready);
                        for k in &stats.kinds {
                            println!(
                                "{:<5} rows={:<6} upserts={:<6} deletes={:<6} write_failures={}",
                                k.kind, k.rows, k.counters.upserts, k.counters.deletes, k.counters.write_failures
                            );
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                }
            } else {
                signal::ctrl_c().await.context("waiting for Ctrl-C")?;
                info!("Ctrl-C received; shutting down sync");
            }

            let failures = handle.stats().write_failures();
            if failures > 0 {
                warn!(failures, "store writes were dropped during this run; mirror may lag until the next relist");
            }
            handle.shutdown();
        }
        Commands::Pods { namespace } => {
            let store = open_store(cli.db)?;
            let ns = namespace.as_deref().filter(|ns| !ns.is_empty());
            let pods = store.list_pods(ns)?;
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<40} {:<10} {:<16} {:<15} AGE", "NAMESPACE", "NAME", "PHASE", "NODE", "IP");
                    for p in pods {
                        println!(
                            "{:<16} {:<40} {:<10} {:<16} {:<15} {}",
                            p.namespace, p.name, or_dash(&p.phase), or_dash(&p.node_name), or_dash(&p.pod_ip), render_age(p.created_at)
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&pods)?),
            }
        }
        Commands::Nodes => {
            let store = open_store(cli.db)?;
            let nodes = store.list_nodes()?;
            match cli.output {
                Output::Human => {
                    println!("{:<24} {:<15} {:<8} {:<14} AGE", "NAME", "INTERNAL-IP", "CPU", "MEMORY");
                    for n in nodes {
                        println!(
                            "{:<24} {:<15} {:<8} {:<14} {}",
                            n.name, or_dash(&n.internal_ip), or_dash(&n.cpu_capacity), or_dash(&n.mem_capacity), render_age(n.created_at)
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&nodes)?),
            }
        }
    }

    Ok(())
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() { "-" } else { s }
}

/// Time since the record was first observed, in its two largest units.
fn render_age(created: DateTime<Utc>) -> String {
    let age = (Utc::now() - created).max(Duration::zero());
    let (days, hours, mins) = (age.num_days(), age.num_hours() % 24, age.num_minutes() % 60);
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", age.num_seconds())
    }
}
