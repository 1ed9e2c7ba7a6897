//! Stats Aggregator (spec §4.E): periodic fan-out stats collection,
//! high→low resolution downsampling, and DB retention cleanup. Grounded on
//! the teacher's `benchmark.rs` periodic-task-under-a-cancellation-token
//! pattern, generalized from a single adapter to parallel fan-out across the
//! whole instance map.

use crate::event_hub::{Event, EventHub};
use crate::session::SessionTracker;
use crate::supervisor::Supervisor;
use fleetctl_store::{HashrateStore, Resolution};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;
use tracing::{error, info, warn};

const COLLECT_INTERVAL: Duration = Duration::from_secs(10);
const PER_CALL_DEADLINE: Duration = Duration::from_secs(5);
const JOIN_DEADLINE: Duration = Duration::from_secs(8);
const DEFAULT_REDUCE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_HI_RETENTION: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_LO_RETENTION_DAYS: i64 = 30;

pub struct StatsAggregator {
    supervisor: Arc<Supervisor>,
    store: Arc<HashrateStore>,
    event_hub: Arc<EventHub>,
    sessions: Arc<SessionTracker>,
    stop: Arc<AtomicBool>,
}

impl StatsAggregator {
    pub fn new(supervisor: Arc<Supervisor>, store: Arc<HashrateStore>, event_hub: Arc<EventHub>, sessions: Arc<SessionTracker>) -> Self {
        Self { supervisor, store, event_hub, sessions, stop: Arc::new(AtomicBool::new(false)) }
    }

    /// Spawns the Collect and DB Cleanup tasks; both honour `stop()` as the
    /// sole cancellation source and finish their current iteration before
    /// exiting (spec §4.E).
    pub fn spawn(self: &Arc<Self>) {
        let collect = self.clone();
        tokio::spawn(async move { collect.run_collect_loop().await });

        let cleanup = self.clone();
        tokio::spawn(async move { cleanup.run_cleanup_loop().await });
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    async fn run_collect_loop(&self) {
        let mut last_reduce = SystemTime::now();
        while !self.stop.load(Ordering::SeqCst) {
            tokio::time::sleep(COLLECT_INTERVAL).await;
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.collect_once().await;

            if last_reduce.elapsed().unwrap_or_default() >= DEFAULT_REDUCE_INTERVAL {
                self.reduce_once().await;
                last_reduce = SystemTime::now();
            }
        }
    }

    async fn collect_once(&self) {
        let summaries = self.supervisor.list_miners().await;

        let tasks: Vec<_> = summaries
            .into_iter()
            .map(|summary| {
                let supervisor = &self.supervisor;
                async move {
                    let instance = supervisor.get_instance(&summary.name).await.ok()?;
                    match timeout(PER_CALL_DEADLINE, instance.get_stats()).await {
                        Ok(Ok(stats)) => Some((summary.name, summary.backend_kind, stats)),
                        Ok(Err(e)) => {
                            warn!(instance_name = %summary.name, error = %e, "stats collection failed, keeping previous value");
                            None
                        }
                        Err(_) => {
                            warn!(instance_name = %summary.name, "stats collection timed out");
                            None
                        }
                    }
                }
            })
            .collect();

        let results = match timeout(JOIN_DEADLINE, futures::future::join_all(tasks)).await {
            Ok(results) => results,
            Err(_) => {
                warn!("stats collection batch exceeded join deadline");
                return;
            }
        };

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        for result in results.into_iter().flatten() {
            let (name, backend_kind, stats) = result;

            if let Ok(instance) = self.supervisor.get_instance(&name).await {
                instance.add_hashrate_point(now, stats.hashrate as i64).await;
            }

            let point = fleetctl_store::HashratePoint {
                miner_name: name.clone(),
                backend_kind,
                timestamp: now,
                hashrate: stats.hashrate as i64,
                resolution: Resolution::High,
            };
            if let Err(e) = self.store.insert_hashrate_points(&[point]).await {
                error!(instance_name = %name, error = %e, "failed to persist hashrate point");
            }

            if !self.sessions.is_open(&name).await {
                if let Err(e) = self.sessions.open_session(&self.store, &name, &backend_kind).await {
                    error!(instance_name = %name, error = %e, "failed to open mining session");
                }
            }
            self.sessions.record_stats(&name, &stats).await;
            self.event_hub.publish(Event::miner_stats(&name, stats)).await;
        }
    }

    async fn reduce_once(&self) {
        let summaries = self.supervisor.list_miners().await;
        let now = SystemTime::now();

        for summary in summaries {
            let Ok(instance) = self.supervisor.get_instance(&summary.name).await else {
                continue;
            };
            let reduced = instance.reduce_hashrate_history(DEFAULT_HI_RETENTION, now).await;
            if reduced.is_empty() {
                continue;
            }

            let points: Vec<_> = reduced
                .into_iter()
                .map(|p| fleetctl_store::HashratePoint {
                    miner_name: summary.name.clone(),
                    backend_kind: summary.backend_kind.clone(),
                    timestamp: p.timestamp,
                    hashrate: p.hashrate,
                    resolution: Resolution::Low,
                })
                .collect();

            if let Err(e) = self.store.insert_hashrate_points(&points).await {
                error!(instance_name = %summary.name, error = %e, "failed to persist reduced hashrate points");
            }
        }
    }

    async fn run_cleanup_loop(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            tokio::time::sleep(DEFAULT_CLEANUP_INTERVAL).await;
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
            let hi_retention_days = 1; // DEFAULT_HI_RETENTION is 24h; cleanup works in whole days.
            if let Err(e) = self.store.cleanup(hi_retention_days, DEFAULT_LO_RETENTION_DAYS, now).await {
                error!(error = %e, "hashrate store cleanup failed");
            } else {
                info!("hashrate store cleanup completed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_hub::EventHub;
    use fleetctl_backends::BackendRegistry;

    #[tokio::test]
    async fn collect_once_on_empty_supervisor_is_a_no_op() {
        let registry = Arc::new(BackendRegistry::new());
        let dir = std::env::temp_dir().join(format!("fleetctl-stats-test-{}", std::process::id()));
        let hub = Arc::new(EventHub::new());
        let store = Arc::new(HashrateStore::disabled());
        let sessions = Arc::new(SessionTracker::new());
        let supervisor = Arc::new(Supervisor::new(registry, dir, hub.clone(), sessions.clone(), store.clone()));

        let aggregator = StatsAggregator::new(supervisor, store, hub, sessions);
        aggregator.collect_once().await;
    }
}
