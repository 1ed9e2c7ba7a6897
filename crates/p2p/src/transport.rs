//! Encrypted, rate-limited, deduplicated WebSocket transport (spec §4.I).
//!
//! Wire format: `4-byte BE length || nonce(12) || AEAD-ciphertext`. The
//! length prefix is checked against `MAX_FRAME_SIZE` before any buffer for
//! the frame body is allocated. Session keys come from an X25519 key
//! agreement fed through HKDF-SHA256; since X25519 keys can't sign, mutual
//! authentication falls out of key confirmation instead of a detached
//! signature: a peer that didn't derive the same shared secret can't
//! produce a frame the other side will decrypt.

use crate::identity::{log_safe_key_prefix, NodeId, NodeIdentity};
use crate::message::{Message, MessageType};
use crate::{P2pError, Result, MAX_FRAME_SIZE};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use futures_util::{SinkExt, StreamExt};
use hkdf::Hkdf;
use lru::LruCache;
use sha2::Sha256;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MISSED_HEARTBEAT_LIMIT: u32 = 2;
const DEDUP_CAPACITY: usize = 4096;
const RATE_LIMIT_CAPACITY: f64 = 50.0;
const RATE_LIMIT_REFILL_PER_SEC: f64 = 10.0;
const OUTBOUND_CAPACITY: usize = 256;

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self { capacity, tokens: capacity, refill_per_sec, last_refill: Instant::now() }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct SessionKeys {
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    send_prefix: [u8; 4],
    recv_prefix: [u8; 4],
    send_counter: AtomicU64,
    recv_counter: AtomicU64,
}

fn derive_session_keys(identity: &NodeIdentity, peer_public: &PublicKey) -> SessionKeys {
    let shared = identity.secret().diffie_hellman(peer_public);
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 72];
    hk.expand(b"fleetctl-p2p-session", &mut okm).expect("72 bytes is a valid HKDF-SHA256 output length");

    let my_bytes = identity.public_key().to_bytes();
    let peer_bytes = peer_public.to_bytes();
    let i_am_a = my_bytes < peer_bytes;

    let (a_key, b_key) = (&okm[0..32], &okm[32..64]);
    let (a_prefix, b_prefix) = (&okm[64..68], &okm[68..72]);

    let (send_key, recv_key, send_prefix, recv_prefix) =
        if i_am_a { (a_key, b_key, a_prefix, b_prefix) } else { (b_key, a_key, b_prefix, a_prefix) };

    SessionKeys {
        send: ChaCha20Poly1305::new(Key::from_slice(send_key)),
        recv: ChaCha20Poly1305::new(Key::from_slice(recv_key)),
        send_prefix: send_prefix.try_into().expect("4-byte slice"),
        recv_prefix: recv_prefix.try_into().expect("4-byte slice"),
        send_counter: AtomicU64::new(0),
        recv_counter: AtomicU64::new(0),
    }
}

fn encode_frame(keys: &SessionKeys, plaintext: &[u8]) -> Result<Vec<u8>> {
    let counter = keys.send_counter.fetch_add(1, Ordering::SeqCst);
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[..4].copy_from_slice(&keys.send_prefix);
    nonce_bytes[4..].copy_from_slice(&counter.to_be_bytes());

    let ciphertext = keys
        .send
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| P2pError::Security("frame encryption failed".into()))?;

    let body_len = (12 + ciphertext.len()) as u32;
    let mut framed = Vec::with_capacity(4 + body_len as usize);
    framed.extend_from_slice(&body_len.to_be_bytes());
    framed.extend_from_slice(&nonce_bytes);
    framed.extend_from_slice(&ciphertext);
    Ok(framed)
}

/// Decrypts a frame and enforces the per-direction replay counter: a nonce
/// counter at or below the last seen value is rejected (spec §4.I: "per
/// direction counters to prevent replay").
fn decode_frame(keys: &SessionKeys, framed: &[u8]) -> Result<Vec<u8>> {
    if framed.len() < 4 {
        return Err(P2pError::Security("frame shorter than length prefix".into()));
    }
    let body_len = u32::from_be_bytes(framed[0..4].try_into().expect("4 bytes")) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(P2pError::FrameTooLarge(body_len));
    }
    let body = &framed[4..];
    if body.len() != body_len {
        return Err(P2pError::Security("frame length does not match declared size".into()));
    }
    if body.len() < 12 {
        return Err(P2pError::Security("frame missing nonce".into()));
    }

    let nonce_bytes = &body[..12];
    if nonce_bytes[..4] != keys.recv_prefix {
        return Err(P2pError::Security("frame nonce prefix mismatch".into()));
    }
    let counter = u64::from_be_bytes(nonce_bytes[4..12].try_into().expect("8 bytes"));
    let previous = keys.recv_counter.fetch_max(counter.wrapping_add(1), Ordering::SeqCst);
    if counter < previous {
        return Err(P2pError::Security("replayed or out-of-order frame counter".into()));
    }

    let ciphertext = &body[12..];
    keys.recv
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| P2pError::Security("frame decryption failed".into()))
}

type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

enum OutboundItem {
    Data(Vec<u8>),
    Close,
}

/// One established, authenticated peer link. Cloning shares the same
/// outbound queue and liveness state.
#[derive(Clone)]
pub struct Connection {
    pub peer_id: NodeId,
    pub peer_public_key: [u8; 32],
    outbound: mpsc::Sender<OutboundItem>,
    last_seen: Arc<RwLock<Instant>>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    pub async fn send(&self, message: &Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(P2pError::Closed);
        }
        let bytes = serde_json::to_vec(message)?;
        self.outbound
            .send(OutboundItem::Data(bytes))
            .await
            .map_err(|_| P2pError::Closed)
    }

    /// Signals the write loop to drain queued frames then close, rather
    /// than tearing down the socket immediately (spec §4.I cooperative
    /// close).
    pub async fn graceful_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(OutboundItem::Close).await;
    }

    pub async fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.last_seen.read().await.elapsed() < HEARTBEAT_INTERVAL * (MISSED_HEARTBEAT_LIMIT + 1)
    }
}

/// Runs the handshake, derives session keys, and spawns the read/write/
/// heartbeat tasks for one already-connected WebSocket. Returns once the
/// handshake completes; the connection continues running in the background.
pub async fn establish<S>(
    mut ws: S,
    identity: Arc<NodeIdentity>,
    is_initiator: bool,
    allowed_peers: Option<Arc<Vec<[u8; 32]>>>,
    on_message: MessageHandler,
) -> Result<Connection>
where
    S: futures_util::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin
        + Send
        + 'static,
{
    let my_nonce: [u8; 24] = rand::random();
    let handshake = serde_json::to_vec(&MessageType::Handshake {
        node_id: identity.id,
        name: identity.name.clone(),
        role: identity.role,
        public_key: identity.public_key().to_bytes(),
        nonce: my_nonce,
    })?;

    if is_initiator {
        ws.send(WsMessage::Binary(handshake)).await?;
    }

    let peer_msg = ws.next().await.ok_or(P2pError::Closed)??;
    let WsMessage::Binary(peer_bytes) = peer_msg else {
        return Err(P2pError::Security("expected binary handshake frame".into()));
    };
    let peer_handshake: MessageType = serde_json::from_slice(&peer_bytes)?;
    let MessageType::Handshake { node_id: peer_id, public_key: peer_key_bytes, .. } = peer_handshake else {
        return Err(P2pError::Security("expected Handshake as first frame".into()));
    };

    if !is_initiator {
        ws.send(WsMessage::Binary(handshake)).await?;
    }

    if let Some(allowed) = &allowed_peers {
        if !allowed.iter().any(|k| k == &peer_key_bytes) {
            warn!(key = %log_safe_key_prefix(&peer_key_bytes), "rejecting handshake from peer not in allow-list");
            return Err(P2pError::Security("peer public key not in allow-list".into()));
        }
    }

    info!(key = %log_safe_key_prefix(&peer_key_bytes), "handshake complete");

    let peer_public = PublicKey::from(peer_key_bytes);
    let keys = Arc::new(derive_session_keys(&identity, &peer_public));

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundItem>(OUTBOUND_CAPACITY);
    let last_seen = Arc::new(RwLock::new(Instant::now()));
    let closed = Arc::new(AtomicBool::new(false));

    let (mut sink, mut stream) = {
        let (s, r) = ws.split();
        (s, r)
    };

    let writer_keys = keys.clone();
    let writer_closed = closed.clone();
    tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            match item {
                OutboundItem::Data(plaintext) => match encode_frame(&writer_keys, &plaintext) {
                    Ok(framed) => {
                        if sink.send(WsMessage::Binary(framed)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode outbound frame"),
                },
                OutboundItem::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
        writer_closed.store(true, Ordering::SeqCst);
    });

    let reader_keys = keys;
    let reader_last_seen = last_seen.clone();
    let reader_closed = closed.clone();
    let rate_limiter = Mutex::new(TokenBucket::new(RATE_LIMIT_CAPACITY, RATE_LIMIT_REFILL_PER_SEC));
    let dedup: Mutex<LruCache<uuid::Uuid, ()>> = Mutex::new(LruCache::new(NonZeroUsize::new(DEDUP_CAPACITY).expect("nonzero")));
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let Ok(WsMessage::Binary(framed)) = item else {
                continue;
            };

            if !rate_limiter.lock().await.try_take() {
                debug!("inbound message dropped by per-peer rate limiter");
                continue;
            }

            let plaintext = match decode_frame(&reader_keys, &framed) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                    continue;
                }
            };

            let message: Message = match serde_json::from_slice(&plaintext) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "dropping malformed message body");
                    continue;
                }
            };

            {
                let mut cache = dedup.lock().await;
                if cache.put(message.id, ()).is_some() {
                    continue;
                }
            }

            *reader_last_seen.write().await = Instant::now();

            if matches!(message.payload, MessageType::Heartbeat) {
                continue;
            }

            let handler = on_message.clone();
            tokio::spawn(async move { handler(message) });
        }
        reader_closed.store(true, Ordering::SeqCst);
    });

    let heartbeat_outbound = outbound_tx.clone();
    let heartbeat_last_seen = last_seen.clone();
    let heartbeat_closed = closed.clone();
    let self_id = identity.id;
    tokio::spawn(async move {
        let mut missed = 0u32;
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if heartbeat_closed.load(Ordering::SeqCst) {
                return;
            }

            let heartbeat = Message::new(self_id, peer_id, MessageType::Heartbeat);
            let Ok(bytes) = serde_json::to_vec(&heartbeat) else { return };
            if heartbeat_outbound.send(OutboundItem::Data(bytes)).await.is_err() {
                return;
            }

            if heartbeat_last_seen.read().await.elapsed() > HEARTBEAT_INTERVAL {
                missed += 1;
                if missed > MISSED_HEARTBEAT_LIMIT {
                    warn!(?peer_id, "closing connection after missed heartbeats");
                    let _ = heartbeat_outbound.send(OutboundItem::Close).await;
                    heartbeat_closed.store(true, Ordering::SeqCst);
                    return;
                }
            } else {
                missed = 0;
            }
        }
    });

    Ok(Connection { peer_id, peer_public_key: peer_key_bytes, outbound: outbound_tx, last_seen, closed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerRole;

    #[test]
    fn encode_then_decode_round_trips() {
        let a = NodeIdentity::generate("a", PeerRole::Worker);
        let b = NodeIdentity::generate("b", PeerRole::Controller);

        let a_keys = derive_session_keys(&a, &b.public_key());
        let b_keys = derive_session_keys(&b, &a.public_key());

        let framed = encode_frame(&a_keys, b"hello").unwrap();
        let decoded = decode_frame(&b_keys, &framed).unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn replayed_counter_is_rejected() {
        let a = NodeIdentity::generate("a", PeerRole::Worker);
        let b = NodeIdentity::generate("b", PeerRole::Controller);
        let a_keys = derive_session_keys(&a, &b.public_key());
        let b_keys = derive_session_keys(&b, &a.public_key());

        let framed = encode_frame(&a_keys, b"first").unwrap();
        decode_frame(&b_keys, &framed).unwrap();

        let replayed = framed.clone();
        assert!(decode_frame(&b_keys, &replayed).is_err());
    }

    #[test]
    fn oversized_declared_length_is_rejected_before_allocation() {
        let mut framed = vec![0u8; 4];
        framed[0..4].copy_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        let a = NodeIdentity::generate("a", PeerRole::Worker);
        let b = NodeIdentity::generate("b", PeerRole::Controller);
        let keys = derive_session_keys(&a, &b.public_key());
        assert!(matches!(decode_frame(&keys, &framed), Err(P2pError::FrameTooLarge(_))));
    }
}
