//! P2P Transport and Controller/Worker (spec §4.I/§4.J): length-framed,
//! encrypted WebSocket links between fleetctl nodes, and the
//! request/response plumbing that lets one node drive mining on another.
//! New relative to the teacher (which has no peer-to-peer surface);
//! grounded on the corpus's `tokio-tungstenite` WebSocket idiom and
//! `x25519-dalek`/`chacha20poly1305` for the session crypto.

pub mod control;
pub mod identity;
pub mod kdtree;
pub mod message;
pub mod peer;
pub mod transport;

pub use control::{Controller, Worker};
pub use identity::{NodeId, NodeIdentity};
pub use message::{Message, MessageType};
pub use peer::{Peer, PeerRole, PeerState};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum P2pError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("security: {0}")]
    Security(String),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("connection closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for P2pError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        P2pError::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, P2pError>;

/// Hard cap on a single decoded frame, checked before any buffer is
/// allocated for it (spec §4.I).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
