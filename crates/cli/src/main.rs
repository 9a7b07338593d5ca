use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{api::Api, core::DynamicObject};
use meridian_controller::{CancellationToken, Controller, ControllerConfig};
use meridian_kubehub::{reflect, KubePersistence};
use meridian_store::LocalCache;
use tokio::signal;
use tracing::{error, info, warn};

mod reconcile;

use reconcile::ObservedGeneration;

#[derive(Parser, Debug)]
#[command(name = "meridianctl", version, about = "Meridian controller host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until SIGINT/SIGTERM
    Run(RunArgs),
    /// Print the effective controller configuration as JSON
    Config(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Only watch Deployments in this namespace (default: all namespaces)
    #[arg(long = "ns", env = "MERIDIAN_NAMESPACE")]
    namespace: Option<String>,
    /// Topology site kind, e.g. "v1/Node" or "cluster.example.dev/v1alpha1/Cluster"
    #[arg(long = "site-gvk", env = "MERIDIAN_SITE_GVK", default_value = "v1/Node")]
    site_gvk: String,
    /// Workers per queue
    #[arg(long, env = "MERIDIAN_WORKERS", default_value_t = 2)]
    workers: usize,
    /// Requeues before a failing key is dropped
    #[arg(long = "max-retries", env = "MERIDIAN_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,
    /// Label marking derived Deployments
    #[arg(long = "owned-by-label", env = "MERIDIAN_OWNED_BY_LABEL", default_value = meridian_core::DEFAULT_OWNED_BY_LABEL)]
    owned_by_label: String,
    /// First retry delay for a failing key, doubled on each further failure
    #[arg(long = "base-delay-ms", env = "MERIDIAN_BASE_DELAY_MS", default_value_t = 5)]
    base_delay_ms: u64,
    /// Upper bound on the per-key retry delay
    #[arg(long = "max-delay-secs", env = "MERIDIAN_MAX_DELAY_SECS", default_value_t = 1000)]
    max_delay_secs: u64,
    /// Overall retry rate across all keys
    #[arg(long, env = "MERIDIAN_QPS", default_value_t = 10.0)]
    qps: f64,
    #[arg(long, env = "MERIDIAN_BURST", default_value_t = 100)]
    burst: u32,
    /// Seconds to wait for the initial listings
    #[arg(long = "sync-timeout-secs", env = "MERIDIAN_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    sync_timeout_secs: u64,
}

impl RunArgs {
    fn config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.max(1),
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            qps: self.qps,
            burst: self.burst,
            owned_by_label: self.owned_by_label.clone(),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("MERIDIAN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MERIDIAN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MERIDIAN_METRICS_ADDR; expected host:port");
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM; only SIGINT stops the controller"),
        }
    }
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "cannot listen for SIGINT");
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.config();
    let client = meridian_kubehub::get_kube_client().await?;
    let shutdown = CancellationToken::new();

    let deployments = Arc::new(LocalCache::<Deployment>::new("deployments"));
    let sites = Arc::new(LocalCache::<DynamicObject>::new("sites"));

    let controller = Controller::new(
        config.clone(),
        deployments.clone(),
        Arc::new(ObservedGeneration::new(config.owned_by_label.clone())),
        Arc::new(KubePersistence::<Deployment>::new(client.clone())),
        shutdown.clone(),
    );

    let deploy_api: Api<Deployment> = match args.namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let site_api = meridian_kubehub::site_api(client.clone(), &args.site_gvk).await?;

    let watchers = [
        tokio::spawn(reflect(deploy_api, Arc::clone(&deployments), controller.primary_bridge())),
        tokio::spawn(reflect(site_api, Arc::clone(&sites), controller.topology_bridge())),
    ];

    info!(ns = ?args.namespace, site_gvk = %args.site_gvk, "waiting for caches to sync");
    tokio::time::timeout(config.sync_timeout, async {
        tokio::join!(deployments.wait_synced(), sites.wait_synced());
    })
    .await
    .context("timed out waiting for caches to sync")?;
    info!(deployments = deployments.current().len(), sites = sites.current().len(), "caches synced");

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    controller.start(config.workers).await;
    for w in watchers {
        w.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await?,
        Commands::Config(args) => println!("{}", serde_json::to_string_pretty(&args.config())?),
    }
    Ok(())
}
