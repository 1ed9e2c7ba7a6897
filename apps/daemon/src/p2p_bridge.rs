//! Wires the Controller/Worker request plumbing onto real TCP sockets
//! (spec §4.I/§4.J): a listener for inbound peer connections and dialers
//! for the peers this node is configured to reach out to.

use fleetctl_p2p::{Controller, Message, NodeId, NodeIdentity, Peer, PeerRole, Worker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tracing::{info, warn};

const HANDOFF_WAIT: std::time::Duration = std::time::Duration::from_millis(20);
const HANDOFF_ATTEMPTS: u32 = 100;

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Builds the per-connection message handler. `establish` hands us messages
/// before it returns the `Connection` we'd reply through, so replies wait
/// on a short-lived cell rather than threading the connection in up front.
fn make_handler(controller: Arc<Controller>, worker: Arc<Worker>) -> (Arc<OnceCell<fleetctl_p2p::transport::Connection>>, Arc<dyn Fn(Message) + Send + Sync>) {
    let cell: Arc<OnceCell<fleetctl_p2p::transport::Connection>> = Arc::new(OnceCell::new());
    let cell_for_handler = cell.clone();

    let handler = Arc::new(move |message: Message| {
        let controller = controller.clone();
        let worker = worker.clone();
        let cell = cell_for_handler.clone();
        tokio::spawn(async move {
            if message.reply_to.is_some() {
                controller.resolve_reply(message).await;
                return;
            }

            let reply = worker.handle(message).await;
            for _ in 0..HANDOFF_ATTEMPTS {
                if let Some(connection) = cell.get() {
                    if let Err(e) = connection.send(&reply).await {
                        warn!(error = %e, "failed to send reply to peer");
                    }
                    return;
                }
                tokio::time::sleep(HANDOFF_WAIT).await;
            }
            warn!("dropping reply: connection handle never became available");
        });
    });

    (cell, handler)
}

async fn register_if_unknown(controller: &Controller, peer_id: NodeId, public_key: [u8; 32], address: &str) {
    if controller.has_peer(peer_id).await {
        return;
    }
    controller
        .register_peer(Peer {
            id: peer_id,
            name: peer_id.to_string(),
            address: address.to_string(),
            role: PeerRole::Dual,
            public_key,
            added_at: now_unix(),
            connected: false,
            ping_ms: 50.0,
            hops: 1,
            geo_km: 0.0,
            score: 0.0,
            last_seen: now_unix(),
            state: fleetctl_p2p::PeerState::Registered,
        })
        .await;
}

/// Accepts inbound peer connections for the lifetime of the process.
pub async fn run_listener(
    bind_addr: SocketAddr,
    identity: Arc<NodeIdentity>,
    allowed_peers: Option<Arc<Vec<[u8; 32]>>>,
    controller: Arc<Controller>,
    worker: Arc<Worker>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "p2p listener bound");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "p2p accept failed");
                continue;
            }
        };

        let identity = identity.clone();
        let allowed_peers = allowed_peers.clone();
        let controller = controller.clone();
        let worker = worker.clone();

        tokio::spawn(async move {
            let ws = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(error = %e, %peer_addr, "p2p handshake (websocket upgrade) failed");
                    return;
                }
            };

            let (cell, handler) = make_handler(controller.clone(), worker.clone());
            match fleetctl_p2p::transport::establish(ws, identity, false, allowed_peers, handler).await {
                Ok(connection) => {
                    register_if_unknown(&controller, connection.peer_id, connection.peer_public_key, &peer_addr.to_string()).await;
                    controller.attach_connection(connection.peer_id, connection.clone()).await;
                    let _ = cell.set(connection);
                    info!(%peer_addr, "inbound p2p peer connected");
                }
                Err(e) => warn!(error = %e, %peer_addr, "p2p establish failed"),
            }
        });
    }
}

/// Dials one configured peer, retrying with backoff on failure, and
/// attaches the resulting connection once established.
pub async fn dial_peer(
    addr: String,
    identity: Arc<NodeIdentity>,
    allowed_peers: Option<Arc<Vec<[u8; 32]>>>,
    controller: Arc<Controller>,
    worker: Arc<Worker>,
) {
    const MIN_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);
    const MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(60);
    const LIVENESS_POLL: std::time::Duration = std::time::Duration::from_secs(5);
    let mut backoff = MIN_BACKOFF;

    loop {
        match tokio_tungstenite::connect_async(addr.as_str()).await {
            Ok((ws, _response)) => {
                let (cell, handler) = make_handler(controller.clone(), worker.clone());
                match fleetctl_p2p::transport::establish(ws, identity.clone(), true, allowed_peers.clone(), handler).await {
                    Ok(connection) => {
                        register_if_unknown(&controller, connection.peer_id, connection.peer_public_key, &addr).await;
                        controller.attach_connection(connection.peer_id, connection.clone()).await;
                        let _ = cell.set(connection.clone());
                        info!(%addr, "dialed p2p peer");
                        backoff = MIN_BACKOFF;

                        while connection.is_alive().await {
                            tokio::time::sleep(LIVENESS_POLL).await;
                        }
                        warn!(%addr, "p2p peer connection dropped, redialing");
                        continue;
                    }
                    Err(e) => warn!(error = %e, %addr, "p2p establish with dialed peer failed"),
                }
            }
            Err(e) => warn!(error = %e, %addr, "p2p dial failed, retrying"),
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
