use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tender_controller::workload::replicas_of;
use tender_controller::{Controller, ControllerConfig};
use tender_core::{instances_match, labels_for, ObjectKey};
use tender_kubehub::{kube_client, watch_resources, KubeStore, MemStore, ObjectStore};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tenderctl", version, about = "Tender: keeps Memcached clusters at their declared size")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all for `run`, current context for `inspect`)
    #[arg(long = "ns", global = true, env = "TENDER_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current cluster until interrupted
    Run(Tuning),
    /// Show desired vs observed state of one Memcached
    Inspect {
        /// Memcached name, or `namespace/name`
        name: String,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Run the controller against an in-memory cluster and print what it converges to
    Demo {
        /// Initial size
        #[arg(long = "size", default_value_t = 3)]
        size: u32,
        /// Size to scale to once the first size has settled
        #[arg(long = "scale-to")]
        scale_to: Option<u32>,
        #[command(flatten)]
        tuning: Tuning,
    },
}

/// Flags override env vars, which override built-in defaults.
#[derive(clap::Args, Debug, Default)]
struct Tuning {
    /// Concurrent reconciliations
    #[arg(long = "workers", env = "TENDER_WORKERS")]
    workers: Option<usize>,
    /// Seconds to wait before re-checking a freshly scaled Memcached
    #[arg(long = "drift-cooldown-secs", env = "TENDER_DRIFT_COOLDOWN_SECS")]
    drift_cooldown_secs: Option<u64>,
    /// Deadline of one reconciliation in seconds
    #[arg(long = "reconcile-timeout-secs", env = "TENDER_RECONCILE_TIMEOUT_SECS")]
    reconcile_timeout_secs: Option<u64>,
    /// Deadline of one API call in seconds
    #[arg(long = "call-timeout-secs", env = "TENDER_CALL_TIMEOUT_SECS")]
    call_timeout_secs: Option<u64>,
    /// First retry delay after a failed reconciliation, in milliseconds
    #[arg(long = "backoff-base-ms", env = "TENDER_BACKOFF_BASE_MS")]
    backoff_base_ms: Option<u64>,
    /// Longest retry delay, in seconds
    #[arg(long = "backoff-max-secs", env = "TENDER_BACKOFF_MAX_SECS")]
    backoff_max_secs: Option<u64>,
    /// Capacity of the watch event channel
    #[arg(long = "queue-cap", env = "TENDER_QUEUE_CAP")]
    queue_cap: Option<usize>,
}

impl Tuning {
    fn config(&self, namespace: Option<String>) -> ControllerConfig {
        let mut cfg = ControllerConfig::from_env();
        if let Some(n) = self.workers.filter(|n| *n > 0) { cfg.workers = n; }
        if let Some(s) = self.drift_cooldown_secs { cfg.drift_cooldown = Duration::from_secs(s); }
        if let Some(s) = self.reconcile_timeout_secs { cfg.reconcile_timeout = Duration::from_secs(s); }
        if let Some(s) = self.call_timeout_secs { cfg.call_timeout = Duration::from_secs(s); }
        if let Some(ms) = self.backoff_base_ms.filter(|n| *n > 0) { cfg.backoff_base = Duration::from_millis(ms); }
        if let Some(s) = self.backoff_max_secs { cfg.backoff_max = Duration::from_secs(s); }
        if let Some(n) = self.queue_cap.filter(|n| *n > 0) { cfg.queue_cap = n; }
        if namespace.is_some() { cfg.namespace = namespace; }
        cfg
    }
}

fn init_tracing() {
    let env = std::env::var("TENDER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TENDER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TENDER_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(tuning) => run(tuning.config(cli.namespace)).await,
        Commands::Inspect { name, tuning } => {
            let client = kube_client().await?;
            let key = inspect_key(&name, cli.namespace.as_deref(), client.default_namespace())?;
            let store = KubeStore::new(client, tuning.config(None).call_timeout);
            let report = inspect(&store, &key).await?;
            print_report(&report, cli.output)
        }
        Commands::Demo { size, scale_to, tuning } => {
            let cfg = tuning.config(cli.namespace);
            let ns = cfg.namespace.clone().unwrap_or_else(|| "default".to_string());
            demo(cfg, ObjectKey::new(ns, "demo"), size, scale_to, cli.output).await
        }
    }
}

async fn run(cfg: ControllerConfig) -> Result<()> {
    let client = kube_client().await?;
    let store = Arc::new(KubeStore::new(client.clone(), cfg.call_timeout));
    let (tx, rx) = mpsc::channel(cfg.queue_cap);
    let watcher = tokio::spawn({
        let ns = cfg.namespace.clone();
        async move {
            if let Err(e) = watch_resources(client, ns.as_deref(), tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });

    let handle = Controller::new(store, cfg).start(rx);
    signal::ctrl_c().await.context("waiting for interrupt")?;
    info!("interrupt received; shutting down");
    watcher.abort();
    handle.shutdown().await;
    Ok(())
}

/// `ns/name` wins; a bare name uses `--ns`, then the client's default namespace.
fn inspect_key(arg: &str, namespace: Option<&str>, default_ns: &str) -> Result<ObjectKey> {
    if arg.contains('/') {
        return Ok(ObjectKey::parse(arg)?);
    }
    Ok(ObjectKey::new(namespace.unwrap_or(default_ns), arg))
}

#[derive(Debug, Serialize)]
struct Report {
    namespace: String,
    name: String,
    size: u32,
    /// Replica count of the owned Deployment; `None` when it does not exist yet.
    replicas: Option<i32>,
    ready_replicas: Option<i32>,
    /// Instances recorded in status.
    nodes: Vec<String>,
    /// Instances currently matching the selector.
    live: Vec<String>,
    in_sync: bool,
    created: Option<DateTime<Utc>>,
}

async fn inspect(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Report> {
    let m = store
        .get_memcached(key)
        .await
        .with_context(|| format!("reading memcached {}", key))?
        .with_context(|| format!("memcached {} not found", key))?;
    let deployment = store.get_deployment(key).await.with_context(|| format!("reading deployment {}", key))?;
    let mut live: Vec<String> = store
        .list_pods(&key.namespace, &labels_for(&key.name))
        .await
        .context("listing pods")?
        .into_iter()
        .filter_map(|p| p.metadata.name)
        .collect();
    live.sort();

    let nodes = m.status.map(|s| s.nodes).unwrap_or_default();
    let replicas = deployment.as_ref().map(replicas_of);
    let ready_replicas = deployment.as_ref().and_then(|d| d.status.as_ref()).and_then(|s| s.ready_replicas);
    let in_sync = replicas.map(i64::from) == Some(i64::from(m.spec.size)) && instances_match(&nodes, &live);
    Ok(Report {
        namespace: key.namespace.clone(),
        name: key.name.clone(),
        size: m.spec.size,
        replicas,
        ready_replicas,
        nodes,
        live,
        in_sync,
        created: m.metadata.creation_timestamp.map(|t| t.0),
    })
}

fn print_report(r: &Report, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(r)?),
        Output::Human => {
            let opt = |v: Option<i32>| v.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
            println!("NAMESPACE   NAME                 SIZE  REPLICAS  READY  SYNCED  AGE");
            println!(
                "{:<11} {:<20} {:<5} {:<9} {:<6} {:<7} {}",
                r.namespace,
                r.name,
                r.size,
                opt(r.replicas),
                opt(r.ready_replicas),
                if r.in_sync { "yes" } else { "no" },
                render_age(r.created, Utc::now()),
            );
            println!("nodes: {}", if r.nodes.is_empty() { "-".to_string() } else { r.nodes.join(", ") });
            if !instances_match(&r.nodes, &r.live) {
                println!("live:  {}", if r.live.is_empty() { "-".to_string() } else { r.live.join(", ") });
            }
        }
    }
    Ok(())
}

fn render_age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (now - created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

/// Drive the controller against [`MemStore`], playing the part of the cluster:
/// pods follow the Deployment, and the Memcached is re-applied so status catches up.
async fn demo(cfg: ControllerConfig, key: ObjectKey, size: u32, scale_to: Option<u32>, output: Output) -> Result<()> {
    let store = Arc::new(MemStore::new());
    let rx = store.subscribe(cfg.queue_cap);
    let handle = Controller::new(store.clone() as Arc<dyn ObjectStore>, cfg).start(rx);

    let mut result = Ok(());
    for target in std::iter::once(size).chain(scale_to) {
        info!(key = %key, size = target, "applying memcached");
        store.apply_memcached(&key, target);
        if let Err(e) = settle(&store, &key, target).await {
            result = Err(e);
            break;
        }
        print_report(&inspect(&*store, &key).await?, output)?;
    }
    handle.shutdown().await;
    result
}

async fn settle(store: &MemStore, key: &ObjectKey, size: u32) -> Result<()> {
    let want = i32::try_from(size).context("size exceeds replica range")?;
    let converged = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let Some(d) = store.deployment(key) else { continue };
            if replicas_of(&d) != want {
                continue;
            }
            store.run_replicas(key);
            let nodes = store.memcached(key).and_then(|m| m.status).map(|s| s.nodes).unwrap_or_default();
            if nodes.len() == size as usize {
                break;
            }
            // Pods are not watched; nudge the Memcached so status is recomputed
            store.apply_memcached(key, size);
        }
    })
    .await;
    converged.map_err(|_| anyhow::anyhow!("{} did not converge to size {} within 10s", key, size))
}
