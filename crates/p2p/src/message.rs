//! Wire message schema (spec §3): control, command, response, and event
//! frames exchanged over the encrypted transport.

use crate::identity::NodeId;
use crate::peer::PeerRole;
use fleetctl_backends::Stats;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageType {
    // control
    Handshake { node_id: NodeId, name: String, role: PeerRole, public_key: [u8; 32], nonce: [u8; 24] },
    /// Transport-level keepalive; never dispatched to a handler. Distinct
    /// from `Ping`, which is a `Controller::ping_peer` request awaiting a
    /// `Pong` reply.
    Heartbeat,
    Ping,
    Pong,
    // commands
    GetStats { instance_name: String },
    StartMiner { backend_kind: String, config: fleetctl_backends::Config },
    StopMiner { instance_name: String },
    GetLogs { instance_name: String, lines: usize },
    // responses
    StatsReply { stats: Stats },
    Ack { ok: bool, error: Option<String> },
    LogsReply { lines: Vec<String> },
    // events
    MinerEvent { event: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from: NodeId,
    pub to: NodeId,
    pub reply_to: Option<Uuid>,
    pub ts: i64,
    pub payload: MessageType,
}

impl Message {
    pub fn new(from: NodeId, to: NodeId, payload: MessageType) -> Self {
        Self { id: Uuid::new_v4(), from, to, reply_to: None, ts: now_unix(), payload }
    }

    pub fn reply(&self, from: NodeId, payload: MessageType) -> Self {
        Self { id: Uuid::new_v4(), from, to: self.from, reply_to: Some(self.id), ts: now_unix(), payload }
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_carries_the_original_message_id() {
        let from = NodeId::new();
        let to = NodeId::new();
        let request = Message::new(from, to, MessageType::Ping);
        let reply = request.reply(to, MessageType::Pong);
        assert_eq!(reply.reply_to, Some(request.id));
        assert_eq!(reply.to, from);
    }

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message::new(NodeId::new(), NodeId::new(), MessageType::GetStats { instance_name: "xmrig-rx0".into() });
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.id, msg.id);
    }
}
