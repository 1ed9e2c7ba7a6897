//! fleetctl daemon entrypoint: wires the Miner Supervisor, Stats
//! Aggregator, Profile Manager, Event Hub, and P2P Controller/Worker
//! together behind the HTTP control surface.

mod config;
mod p2p_bridge;

use config::DaemonConfig;
use fleetctl_backends::BackendRegistry;
use fleetctl_core::{EventHub, ProfileManager, SessionTracker, StatsAggregator, Supervisor};
use fleetctl_p2p::{Controller, NodeIdentity, Worker};
use fleetctl_store::HashrateStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, info};

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] fleetctl_store::StoreError),
    #[error(transparent)]
    P2p(#[from] fleetctl_p2p::P2pError),
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = DaemonConfig::from_env()?;
    info!(node_name = %config.node_name, http_bind = %config.http_bind, "starting fleetctl daemon");

    let registry = Arc::new(BackendRegistry::with_defaults());
    let event_hub = Arc::new(EventHub::new());

    let store = Arc::new(match &config.db_path {
        Some(path) => HashrateStore::open(path).await?,
        None => HashrateStore::disabled(),
    });
    let sessions = Arc::new(SessionTracker::new());

    let supervisor = Arc::new(Supervisor::new(
        registry,
        config.install_dir.clone(),
        event_hub.clone(),
        sessions.clone(),
        store.clone(),
    ));

    let profiles = Arc::new(ProfileManager::load(config.profiles_path.clone()).await);

    let stats_aggregator = Arc::new(StatsAggregator::new(supervisor.clone(), store.clone(), event_hub.clone(), sessions));
    stats_aggregator.spawn();

    let identity = Arc::new(NodeIdentity::load_or_create(&config.identity_path, config.node_name.clone(), config.node_role).await?);
    info!(node_id = %identity.id, public_key = %fleetctl_p2p::identity::log_safe_key_prefix(&identity.public_key().to_bytes()), "node identity ready");

    let controller = Arc::new(Controller::new(identity.id));
    let worker = Arc::new(Worker::new(identity.id, supervisor.clone()));

    let allowed_peers = if config.peer_public_keys.is_empty() { None } else { Some(Arc::new(config.peer_public_keys.clone())) };

    if let Some(p2p_bind) = config.p2p_bind {
        let identity = identity.clone();
        let allowed_peers = allowed_peers.clone();
        let controller = controller.clone();
        let worker = worker.clone();
        tokio::spawn(async move {
            if let Err(e) = p2p_bridge::run_listener(p2p_bind, identity, allowed_peers, controller, worker).await {
                error!(error = %e, "p2p listener exited");
            }
        });
    }

    for peer_addr in config.dial_peers.clone() {
        let identity = identity.clone();
        let allowed_peers = allowed_peers.clone();
        let controller = controller.clone();
        let worker = worker.clone();
        tokio::spawn(p2p_bridge::dial_peer(peer_addr, identity, allowed_peers, controller, worker));
    }

    let state = Arc::new(fleetctl_server::AppState {
        supervisor: supervisor.clone(),
        profiles,
        event_hub,
        store,
        controller,
        started_at: SystemTime::now(),
        allowed_ws_origins: config.allowed_ws_origins.clone(),
    });

    let app = fleetctl_server::router(state);
    let listener = tokio::net::TcpListener::bind(config.http_bind).await?;
    info!(addr = %config.http_bind, "http control surface listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    stats_aggregator.stop();
    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
