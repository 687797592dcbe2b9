mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use ep_server::{serve_api, serve_nodes};
use ep_storage::{FjallBackend, MemStore, SyncStorage};
use ep_sync::{ControlPlane, LogNotifier, PlaneConfig};

use crate::config::{Backend, Config};

#[derive(clap::Parser, Debug)]
#[command(name = "edgeplane-apid", about = "Edge node config sync and command dispatch")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0:18000")]
    api_addr: String,
    #[arg(long, default_value = "0.0.0.0:18001")]
    node_addr: String,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides storage.data_dir
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Keep everything in memory regardless of storage.backend
    #[arg(long)]
    memory: bool,
    /// Identifies this process in the hello frame; random when unset
    #[arg(long)]
    instance_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let api_addr: SocketAddr = cli
        .api_addr
        .parse()
        .with_context(|| format!("invalid api_addr: {}", cli.api_addr))?;
    let node_addr: SocketAddr = cli
        .node_addr
        .parse()
        .with_context(|| format!("invalid node_addr: {}", cli.node_addr))?;
    let instance_id = cli.instance_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let backend = if cli.memory { Backend::Memory } else { config.storage.backend };
    let data_dir = cli.data_dir.unwrap_or_else(|| PathBuf::from(&config.storage.data_dir));

    tracing::info!(
        instance_id = %instance_id,
        api_addr = %api_addr,
        node_addr = %node_addr,
        backend = ?backend,
        "api node starting"
    );

    let plane_config = config.plane();
    match backend {
        Backend::Memory => run(Arc::new(MemStore::new()), plane_config, instance_id, api_addr, node_addr).await,
        Backend::Fjall => {
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("cannot create data_dir {}", data_dir.display()))?;
            let store = FjallBackend::open(&data_dir)
                .with_context(|| format!("cannot open store at {}", data_dir.display()))?;
            run(Arc::new(store), plane_config, instance_id, api_addr, node_addr).await
        }
    }
}

async fn run<S: SyncStorage>(
    store: Arc<S>,
    config: PlaneConfig,
    instance_id: String,
    api_addr: SocketAddr,
    node_addr: SocketAddr,
) -> anyhow::Result<()> {
    let (plane, events) = ControlPlane::new(store, Arc::new(LogNotifier), config, instance_id);
    let supervisor = plane.start(events);

    let served = tokio::select! {
        res = async {
            tokio::try_join!(serve_api(api_addr, plane.clone()), serve_nodes(node_addr, plane.clone()))
        } => res.map(|_| ()),
        res = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            res.context("failed to listen for ctrl-c")
        }
    };

    supervisor.shutdown().await;
    served
}
