//! Mining session bookkeeping: tracks open/close of a miner run and the
//! aggregated totals reported to the Hashrate Store, grounded on the
//! teacher's `mining_history.rs::MiningRecord`.

use fleetctl_backends::Stats;
use fleetctl_store::{HashrateStore, SessionRecord};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use uuid::Uuid;

struct OpenSession {
    id: String,
    backend_kind: String,
    started_at: i64,
    shares_total: u64,
    shares_good: u64,
    hashrate_samples: Vec<f64>,
}

/// Owns the currently-open session per instance name; the Stats Aggregator
/// feeds it stats samples and the Supervisor closes a session on stop.
pub struct SessionTracker {
    open: RwLock<HashMap<String, OpenSession>>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self { open: RwLock::new(HashMap::new()) }
    }

    pub async fn open_session(&self, store: &HashrateStore, instance_name: &str, backend_kind: &str) -> fleetctl_store::Result<()> {
        let id = Uuid::new_v4().to_string();
        let started_at = now_unix();

        store
            .open_session(&SessionRecord {
                id: id.clone(),
                instance_name: instance_name.to_string(),
                backend_kind: backend_kind.to_string(),
                started_at,
            })
            .await?;

        self.open.write().await.insert(
            instance_name.to_string(),
            OpenSession {
                id,
                backend_kind: backend_kind.to_string(),
                started_at,
                shares_total: 0,
                shares_good: 0,
                hashrate_samples: Vec::new(),
            },
        );
        Ok(())
    }

    pub async fn is_open(&self, instance_name: &str) -> bool {
        self.open.read().await.contains_key(instance_name)
    }

    pub async fn record_stats(&self, instance_name: &str, stats: &Stats) {
        let mut guard = self.open.write().await;
        if let Some(session) = guard.get_mut(instance_name) {
            session.shares_total = stats.shares_total;
            session.shares_good = stats.shares_good;
            session.hashrate_samples.push(stats.hashrate);
        }
    }

    pub async fn close_session(&self, store: &HashrateStore, instance_name: &str) -> fleetctl_store::Result<()> {
        let session = { self.open.write().await.remove(instance_name) };
        let Some(session) = session else {
            return Ok(());
        };

        let avg_hashrate = if session.hashrate_samples.is_empty() {
            0.0
        } else {
            session.hashrate_samples.iter().sum::<f64>() / session.hashrate_samples.len() as f64
        };

        store
            .close_session(
                instance_name,
                now_unix(),
                session.shares_total,
                session.shares_total.saturating_sub(session.shares_good),
                avg_hashrate,
            )
            .await
    }
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_without_open_is_a_no_op() {
        let tracker = SessionTracker::new();
        let store = HashrateStore::disabled();
        tracker.close_session(&store, "ghost").await.unwrap();
    }

    #[tokio::test]
    async fn record_stats_updates_only_open_sessions() {
        let tracker = SessionTracker::new();
        let stats = Stats { hashrate: 123.0, shares_good: 5, shares_total: 6, ..Default::default() };
        tracker.record_stats("xmrig-rx0", &stats).await;
        assert!(tracker.open.read().await.get("xmrig-rx0").is_none());
    }

    #[tokio::test]
    async fn open_record_close_round_trips_through_the_store() {
        let path = std::env::temp_dir().join(format!("fleetctl-session-test-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let store = HashrateStore::open(&path).await.unwrap();
        let tracker = SessionTracker::new();

        assert!(!tracker.is_open("xmrig-rx0").await);
        tracker.open_session(&store, "xmrig-rx0", "xmrig").await.unwrap();
        assert!(tracker.is_open("xmrig-rx0").await);

        let stats = Stats { hashrate: 123.0, shares_good: 5, shares_total: 6, ..Default::default() };
        tracker.record_stats("xmrig-rx0", &stats).await;

        tracker.close_session(&store, "xmrig-rx0").await.unwrap();
        assert!(!tracker.is_open("xmrig-rx0").await);

        let _ = std::fs::remove_file(&path);
    }
}
