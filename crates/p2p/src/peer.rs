//! Peer registry entries and the per-peer connection state machine
//! (spec §3, §4.J).

use crate::identity::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Controller,
    Worker,
    Dual,
}

/// `Registered -> Dialing -> HandshakeInProgress -> Connected -> (Closed | Errored)`.
/// Transitions are idempotent; reconnect is caller-initiated (spec §4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Registered,
    Dialing,
    HandshakeInProgress,
    Connected,
    Closed,
    Errored,
}

impl PeerState {
    /// Applies a transition; returns the resulting state. Moving to a state
    /// already reached, or advancing from a terminal state, is a no-op
    /// rather than an error (idempotent transitions per spec §4.J).
    pub fn transition(self, to: PeerState) -> PeerState {
        if self == to {
            return self;
        }
        match self {
            PeerState::Closed | PeerState::Errored => self,
            _ => to,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    pub role: PeerRole,
    pub public_key: [u8; 32],
    pub added_at: i64,
    pub connected: bool,
    pub ping_ms: f64,
    pub hops: u32,
    pub geo_km: f64,
    pub score: f64,
    pub last_seen: i64,
    #[serde(skip)]
    pub state: PeerState,
}

impl Peer {
    /// Recomputes `score` from ping, hop count, geo distance, and current
    /// connectivity, used as the k-d tree's (100-score) axis for nearest-peer
    /// selection.
    pub fn recompute_score(&mut self) {
        let ping_component = 1.0 / (1.0 + self.ping_ms / 100.0);
        let hops_component = 1.0 / (1.0 + self.hops as f64);
        let geo_component = 1.0 / (1.0 + self.geo_km / 1000.0);
        let reliability = if self.connected { 1.0 } else { 0.25 };

        self.score = (40.0 * ping_component + 25.0 * hops_component + 20.0 * geo_component + 15.0 * reliability)
            .clamp(0.0, 100.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> Peer {
        Peer {
            id: NodeId::new(),
            name: "peer-a".into(),
            address: "127.0.0.1:9000".into(),
            role: PeerRole::Worker,
            public_key: [0u8; 32],
            added_at: 0,
            connected: true,
            ping_ms: 10.0,
            hops: 1,
            geo_km: 100.0,
            score: 0.0,
            last_seen: 0,
            state: PeerState::Registered,
        }
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let closed = PeerState::Closed;
        assert_eq!(closed.transition(PeerState::Connected), PeerState::Closed);
    }

    #[test]
    fn transitions_are_idempotent_for_same_state() {
        let connected = PeerState::Connected;
        assert_eq!(connected.transition(PeerState::Connected), PeerState::Connected);
    }

    #[test]
    fn lower_ping_yields_higher_score() {
        let mut near = test_peer();
        near.ping_ms = 5.0;
        near.recompute_score();

        let mut far = test_peer();
        far.ping_ms = 500.0;
        far.recompute_score();

        assert!(near.score > far.score);
    }
}
