//! Controller / Worker (spec §4.J): request/response plumbing over the
//! transport, plus the peer table and nearest-peer selection used to route
//! outbound commands.

use crate::identity::NodeId;
use crate::kdtree::KdTree;
use crate::message::{Message, MessageType};
use crate::peer::{Peer, PeerState};
use crate::transport::Connection;
use crate::{P2pError, Result};
use fleetctl_backends::{Config, Stats};
use fleetctl_core::Supervisor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

struct PeerHandle {
    peer: Peer,
    connection: Option<Connection>,
}

/// Issues commands to remote workers and resolves their replies. Holds one
/// pending oneshot per in-flight request, keyed by message id (spec §4.J).
pub struct Controller {
    self_id: NodeId,
    peers: RwLock<HashMap<NodeId, PeerHandle>>,
    pending: RwLock<HashMap<Uuid, oneshot::Sender<Message>>>,
}

impl Controller {
    pub fn new(self_id: NodeId) -> Self {
        Self { self_id, peers: RwLock::new(HashMap::new()), pending: RwLock::new(HashMap::new()) }
    }

    pub async fn register_peer(&self, peer: Peer) {
        self.peers.write().await.insert(peer.id, PeerHandle { peer, connection: None });
    }

    pub async fn has_peer(&self, peer_id: NodeId) -> bool {
        self.peers.read().await.contains_key(&peer_id)
    }

    pub async fn attach_connection(&self, peer_id: NodeId, connection: Connection) {
        if let Some(handle) = self.peers.write().await.get_mut(&peer_id) {
            handle.peer.state = handle.peer.state.transition(PeerState::Connected);
            handle.peer.connected = true;
            handle.connection = Some(connection);
        }
    }

    pub async fn disconnect(&self, peer_id: NodeId) -> Result<()> {
        let connection = {
            let mut peers = self.peers.write().await;
            let Some(handle) = peers.get_mut(&peer_id) else {
                return Err(P2pError::PeerNotFound(peer_id.to_string()));
            };
            handle.peer.connected = false;
            handle.peer.state = handle.peer.state.transition(PeerState::Closed);
            handle.connection.take()
        };
        if let Some(connection) = connection {
            connection.graceful_close().await;
        }
        Ok(())
    }

    /// Delivers a reply to the pending request it answers. No-op if the
    /// request already timed out and its entry was removed.
    pub async fn resolve_reply(&self, reply: Message) {
        let Some(reply_to) = reply.reply_to else {
            return;
        };
        if let Some(tx) = self.pending.write().await.remove(&reply_to) {
            let _ = tx.send(reply);
        }
    }

    /// Registers a oneshot for `msg.id`, sends it, waits up to `request_timeout`,
    /// and always removes the pending entry on return (spec §4.J).
    async fn send_request(&self, peer_id: NodeId, msg: Message, request_timeout: Duration) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(msg.id, tx);

        let connection = {
            let peers = self.peers.read().await;
            peers.get(&peer_id).and_then(|h| h.connection.clone()).ok_or_else(|| P2pError::PeerNotFound(peer_id.to_string()))?
        };

        if let Err(e) = connection.send(&msg).await {
            self.pending.write().await.remove(&msg.id);
            return Err(e);
        }

        let result = timeout(request_timeout, rx).await;
        self.pending.write().await.remove(&msg.id);

        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(P2pError::Closed),
            Err(_) => Err(P2pError::Timeout),
        }
    }

    pub async fn ping_peer(&self, peer_id: NodeId) -> Result<Duration> {
        let start = std::time::Instant::now();
        let msg = Message::new(self.self_id, peer_id, MessageType::Ping);
        self.send_request(peer_id, msg, DEFAULT_REQUEST_TIMEOUT).await?;
        Ok(start.elapsed())
    }

    pub async fn get_remote_stats(&self, peer_id: NodeId, instance_name: &str) -> Result<Stats> {
        let msg = Message::new(self.self_id, peer_id, MessageType::GetStats { instance_name: instance_name.to_string() });
        let reply = self.send_request(peer_id, msg, DEFAULT_REQUEST_TIMEOUT).await?;
        match reply.payload {
            MessageType::StatsReply { stats } => Ok(stats),
            MessageType::Ack { error: Some(e), .. } => Err(P2pError::Security(e)),
            _ => Err(P2pError::Security("unexpected reply type for get_remote_stats".into())),
        }
    }

    pub async fn start_remote_miner(&self, peer_id: NodeId, backend_kind: &str, config: Config) -> Result<()> {
        let msg = Message::new(self.self_id, peer_id, MessageType::StartMiner { backend_kind: backend_kind.to_string(), config });
        let reply = self.send_request(peer_id, msg, DEFAULT_REQUEST_TIMEOUT).await?;
        ack_to_result(reply)
    }

    pub async fn stop_remote_miner(&self, peer_id: NodeId, instance_name: &str) -> Result<()> {
        let msg = Message::new(self.self_id, peer_id, MessageType::StopMiner { instance_name: instance_name.to_string() });
        let reply = self.send_request(peer_id, msg, DEFAULT_REQUEST_TIMEOUT).await?;
        ack_to_result(reply)
    }

    pub async fn get_remote_logs(&self, peer_id: NodeId, instance_name: &str, lines: usize) -> Result<Vec<String>> {
        let msg = Message::new(self.self_id, peer_id, MessageType::GetLogs { instance_name: instance_name.to_string(), lines });
        let reply = self.send_request(peer_id, msg, DEFAULT_REQUEST_TIMEOUT).await?;
        match reply.payload {
            MessageType::LogsReply { lines } => Ok(lines),
            MessageType::Ack { error: Some(e), .. } => Err(P2pError::Security(e)),
            _ => Err(P2pError::Security("unexpected reply type for get_remote_logs".into())),
        }
    }

    /// Parallel fan-out stats across every connected peer; a peer that
    /// errors is omitted from the result rather than failing the batch.
    pub async fn get_all_stats(&self, instance_name: &str) -> HashMap<NodeId, Stats> {
        let peer_ids: Vec<NodeId> = {
            let peers = self.peers.read().await;
            peers.values().filter(|h| h.peer.connected).map(|h| h.peer.id).collect()
        };

        let futures = peer_ids.into_iter().map(|id| async move { (id, self.get_remote_stats(id, instance_name).await) });
        let results = futures_util::future::join_all(futures).await;

        results.into_iter().filter_map(|(id, res)| match res {
            Ok(stats) => Some((id, stats)),
            Err(e) => {
                warn!(peer_id = %id, error = %e, "get_all_stats: peer fan-out failed");
                None
            }
        }).collect()
    }

    pub async fn select_optimal_peer(&self) -> Option<NodeId> {
        let peers: Vec<Peer> = self.peers.read().await.values().map(|h| h.peer.clone()).collect();
        KdTree::build(peers).select_optimal().map(|p| p.id)
    }

    pub async fn select_nearest_peers(&self, n: usize) -> Vec<NodeId> {
        let peers: Vec<Peer> = self.peers.read().await.values().map(|h| h.peer.clone()).collect();
        KdTree::build(peers).select_nearest(n).into_iter().map(|p| p.id).collect()
    }
}

fn ack_to_result(reply: Message) -> Result<()> {
    match reply.payload {
        MessageType::Ack { ok: true, .. } => Ok(()),
        MessageType::Ack { error: Some(e), .. } => Err(P2pError::Security(e)),
        MessageType::Ack { ok: false, error: None } => Err(P2pError::Security("remote operation failed".into())),
        _ => Err(P2pError::Security("unexpected reply type".into())),
    }
}

/// Runs on the receiving side: dispatches inbound commands to the local
/// Supervisor/Stats/Logs and replies with `reply_to = request.id` (spec
/// §4.J). On failure, replies with a typed error ack rather than dropping
/// the request.
pub struct Worker {
    self_id: NodeId,
    supervisor: Arc<Supervisor>,
}

impl Worker {
    pub fn new(self_id: NodeId, supervisor: Arc<Supervisor>) -> Self {
        Self { self_id, supervisor }
    }

    pub async fn handle(&self, request: Message) -> Message {
        let result = self.dispatch(&request.payload).await;
        match result {
            Ok(payload) => request.reply(self.self_id, payload),
            Err(e) => request.reply(self.self_id, MessageType::Ack { ok: false, error: Some(e.to_string()) }),
        }
    }

    async fn dispatch(&self, payload: &MessageType) -> fleetctl_core::Result<MessageType> {
        match payload {
            MessageType::Ping => Ok(MessageType::Pong),
            MessageType::GetStats { instance_name } => {
                let instance = self.supervisor.get_instance(instance_name).await?;
                let stats = instance.get_stats().await?;
                Ok(MessageType::StatsReply { stats })
            }
            MessageType::StartMiner { backend_kind, config } => {
                self.supervisor.start_miner(backend_kind, config.clone()).await?;
                Ok(MessageType::Ack { ok: true, error: None })
            }
            MessageType::StopMiner { instance_name } => {
                self.supervisor.stop_miner(instance_name).await?;
                Ok(MessageType::Ack { ok: true, error: None })
            }
            MessageType::GetLogs { instance_name, lines } => {
                let instance = self.supervisor.get_instance(instance_name).await?;
                Ok(MessageType::LogsReply { lines: instance.get_logs(*lines).await })
            }
            _ => Ok(MessageType::Ack { ok: false, error: Some("unsupported command".to_string()) }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_reply_is_a_no_op_without_a_pending_entry() {
        let controller = Controller::new(NodeId::new());
        let reply = Message::new(NodeId::new(), NodeId::new(), MessageType::Pong);
        controller.resolve_reply(reply).await;
        assert!(controller.pending.read().await.is_empty());
    }

    #[tokio::test]
    async fn select_optimal_peer_on_empty_table_is_none() {
        let controller = Controller::new(NodeId::new());
        assert!(controller.select_optimal_peer().await.is_none());
    }
}
