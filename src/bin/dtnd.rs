//! `dtnd` — the DTN node daemon (spec §14). Loads the three JSON config
//! files, wires up C1-C6, and runs the dispatcher's periodic sweeps until
//! shutdown. Out of scope per spec §1: CLI helper apps (`bpgen`, `bping`,
//! `bpsink`, ...), config hot-reload, the telemetry websocket GUI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use hdtn_node::{Dispatcher, IdentityMasker, NodeConfig, StorageEngine, TracingObserver};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "dtnd", version, about = "DTN store-and-forward node daemon")]
struct Args {
    /// Path to the storage/induct/outduct/LTP config JSON file. If omitted,
    /// built-in defaults are used (spec §10: thin, no schema validation).
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Overrides `tryToRestoreFromDisk` from the config file.
    #[arg(long)]
    restore_from_disk: bool,

    /// Node's own EID node number, overriding the config file's `node_id`.
    #[arg(long)]
    node_id: Option<u64>,
}

fn load_config(args: &Args) -> Result<NodeConfig, hdtn_node::NodeError> {
    let mut config = match &args.config_file {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|source| {
                hdtn_node::error::ConfigError::Io { path: path.display().to_string(), source }
            })?;
            serde_json::from_str(&text).map_err(|source| hdtn_node::error::ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        }
        None => {
            warn!("no --config-file given, running with built-in defaults");
            NodeConfig {
                node_id: 1,
                storage: hdtn_node::config::StorageConfig::default(),
                inducts: Vec::new(),
                outducts: Vec::new(),
                ltp_engines: Vec::new(),
                default_priority: 1,
                ingress_queue_capacity: 4096,
            }
        }
    };
    if args.restore_from_disk {
        config.storage.try_to_restore_from_disk = true;
    }
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dtnd=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(node_id = config.node_id, "starting dtnd");

    let storage = match StorageEngine::open(&config.storage) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to open storage engine: {e}");
            std::process::exit(1);
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(
        storage,
        Duration::from_secs(30),
        Arc::new(IdentityMasker),
        Arc::new(TracingObserver),
        config.ingress_queue_capacity,
    ));

    for outduct_config in &config.outducts {
        info!(
            next_hop = %outduct_config.next_hop_eid,
            cl = ?outduct_config.convergence_layer,
            "outduct configured (convergence-layer I/O is an external collaborator, see spec §1/§6)"
        );
    }
    for ltp_config in &config.ltp_engines {
        info!(engine_id = ltp_config.engine_id, port = ltp_config.bind_port, "LTP engine configured");
    }

    let sweep_dispatcher = dispatcher.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            if let Err(e) = sweep_dispatcher.sweep_expired_storage() {
                warn!("expiration sweep failed: {e}");
            }
            if let Err(e) = sweep_dispatcher.poll_custody_timers(Instant::now()) {
                warn!("custody timer sweep failed: {e}");
            }
        }
    });

    info!("dtnd running; waiting for shutdown signal");
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested, draining");

    sweep_task.abort();
    info!("dtnd stopped");
}
