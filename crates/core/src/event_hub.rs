//! Event Hub (spec §4.H): fans lifecycle and stats events out to subscribed
//! clients (REST/WS handlers, the P2P worker). Grounded on the teacher's
//! `telemetry.rs` broadcast-channel pattern, narrowed to a per-client bounded
//! mpsc registry so one slow client can be dropped without starving the
//! others.

use fleetctl_backends::Stats;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

const OUTBOX_CAPACITY: usize = 256;
const SEND_DEADLINE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    MinerStarted { instance_name: String },
    MinerStopped { instance_name: String },
    MinerError { instance_name: String, message: String },
    MinerStats { instance_name: String, stats: Stats },
    ProfileChanged { profile_id: String },
}

impl Event {
    pub fn miner_started(instance_name: &str) -> Self {
        Event::MinerStarted { instance_name: instance_name.to_string() }
    }

    pub fn miner_stopped(instance_name: &str) -> Self {
        Event::MinerStopped { instance_name: instance_name.to_string() }
    }

    pub fn miner_error(instance_name: &str, message: impl Into<String>) -> Self {
        Event::MinerError { instance_name: instance_name.to_string(), message: message.into() }
    }

    pub fn miner_stats(instance_name: &str, stats: Stats) -> Self {
        Event::MinerStats { instance_name: instance_name.to_string(), stats }
    }

    pub fn profile_changed(profile_id: &str) -> Self {
        Event::ProfileChanged { profile_id: profile_id.to_string() }
    }
}

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

pub struct EventHub {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Event>>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self { subscribers: RwLock::new(HashMap::new()) }
    }

    /// Registers a new client outbox and returns its receiver plus an id for
    /// later unsubscription.
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::SeqCst);
        self.subscribers.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.remove(&id);
    }

    /// Broadcasts to every subscriber with a short send deadline; a
    /// subscriber that can't keep up is dropped rather than blocking the
    /// publisher (spec §4.H: "drop slow clients rather than back-pressure
    /// the whole hub").
    pub async fn publish(&self, event: Event) {
        let subscribers = self.subscribers.read().await;
        let mut dead = Vec::new();
        for (&id, tx) in subscribers.iter() {
            match tokio::time::timeout(SEND_DEADLINE, tx.send(event.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => dead.push(id),
            }
        }
        drop(subscribers);

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                warn!(subscriber_id = id, "dropping slow or closed event subscriber");
                subscribers.remove(&id);
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn stop(&self) {
        self.subscribers.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let hub = EventHub::new();
        let (_id, mut rx) = hub.subscribe().await;
        hub.publish(Event::miner_started("xmrig-rx0")).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::MinerStarted { instance_name } if instance_name == "xmrig-rx0"));
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_client() {
        let hub = EventHub::new();
        let (id, _rx) = hub.subscribe().await;
        assert_eq!(hub.subscriber_count().await, 1);
        hub.unsubscribe(id).await;
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn slow_client_is_dropped_not_blocked() {
        let hub = EventHub::new();
        let (_id, rx) = hub.subscribe().await;
        // Fill the outbox without draining it.
        for _ in 0..OUTBOX_CAPACITY {
            hub.publish(Event::miner_started("x")).await;
        }
        hub.publish(Event::miner_started("x")).await;
        assert_eq!(hub.subscriber_count().await, 0);
        drop(rx);
    }
}
