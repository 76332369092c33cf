//! hived, the fleet coordination daemon
//!
//! Connects to the host Lightning node's adapter socket, opens the store,
//! wires every component together and runs until interrupted. Startup is the
//! only place that may refuse to run: a missing host connection or a corrupt
//! store aborts here, while everything later is recovered in place.

use clap::Parser;
use hive::bridge::{Bridge, BridgeConfig};
use hive::config::HiveConfig;
use hive::contribution::Ledger;
use hive::control::ControlServer;
use hive::dispatcher::Dispatcher;
use hive::governance::Governance;
use hive::handshake::Handshake;
use hive::intent::IntentManager;
use hive::loops::{shutdown_channel, spawn_event_pump, spawn_workers};
use hive::membership::Membership;
use hive::node::{ExecutorRpc, HostNode, RpcGateway, UnixHostNode};
use hive::planner::Planner;
use hive::state::StateManager;
use hive::store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "hived", version, about = "Hive: fleet coordination overlay")]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Host node adapter socket (overrides config)
    #[arg(long)]
    host_socket: Option<PathBuf>,

    /// Control socket path (overrides config)
    #[arg(long)]
    control_socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hive=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = match HiveConfig::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("cannot load configuration: {e}");
            return;
        }
    };
    if let Some(dir) = args.data_dir {
        cfg.data_dir = dir;
    }
    if let Some(path) = args.host_socket {
        cfg.host_socket = path;
    }
    if let Some(path) = args.control_socket {
        cfg.control_socket = path;
    }
    let cfg = Arc::new(cfg);

    info!("hived v{VERSION} starting");

    // Irrecoverable initialisation failures refuse to start.
    if let Err(e) = std::fs::create_dir_all(&cfg.data_dir) {
        error!("cannot create data dir {}: {e}", cfg.data_dir.display());
        return;
    }
    let store = match Store::open(&cfg.data_dir.join("store")) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("cannot open store (corrupt state?): {e}");
            return;
        }
    };

    let (event_tx, event_rx) = mpsc::channel(1024);
    let adapter = match UnixHostNode::connect(&cfg.host_socket, event_tx).await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("cannot reach host node: {e}");
            return;
        }
    };
    info!("host node id: {}", adapter.local_id());

    let host: Arc<dyn HostNode> = Arc::new(RpcGateway::new(
        adapter.clone(),
        Duration::from_secs(cfg.rpc_lock_timeout_secs),
        Duration::from_secs(cfg.rpc_timeout_secs),
    ));

    let bridge = Arc::new(Bridge::new(
        Arc::new(ExecutorRpc::new(adapter)),
        BridgeConfig::from_hive(&cfg),
    ));
    if let Err(e) = bridge.detect_features().await {
        warn!("running without executor: {e}");
    }

    let state = Arc::new(StateManager::new(store.clone(), cfg.clone()));
    let intents = Arc::new(IntentManager::new(store.clone(), cfg.clone()));
    let ledger = match Ledger::new(store.clone(), cfg.clone()) {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            error!("cannot initialise contribution ledger: {e}");
            return;
        }
    };
    let membership = Arc::new(Membership::new(store.clone(), cfg.clone(), ledger.clone()));
    let governance = Arc::new(Governance::new(store.clone(), cfg.clone(), bridge.clone()));
    let handshake = Arc::new(Handshake::new(store.clone(), cfg.clone()));
    let planner = Arc::new(Planner::new(
        store.clone(),
        cfg.clone(),
        bridge.clone(),
        intents.clone(),
        membership.clone(),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        cfg.clone(),
        host,
        state,
        intents,
        membership,
        ledger,
        governance,
        handshake,
        planner,
        bridge,
    ));

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let mut tasks = spawn_workers(dispatcher.clone(), shutdown_rx.clone());
    tasks.push(spawn_event_pump(dispatcher.clone(), event_rx, shutdown_rx.clone()));

    let control = Arc::new(ControlServer::new(dispatcher.clone()));
    let control_path = cfg.control_socket.clone();
    let control_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = control.serve(&control_path, control_shutdown).await {
            error!("control surface failed: {e}");
        }
    }));

    match dispatcher.store.hive_id() {
        Ok(Some(hive_id)) => info!("member of hive {hive_id}"),
        Ok(None) => info!("no hive yet, use `hivectl initiate` or `hivectl join`"),
        Err(e) => warn!("cannot read hive id: {e}"),
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    if let Err(e) = dispatcher.store.flush() {
        warn!("final flush failed: {e}");
    }
}
