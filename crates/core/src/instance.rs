//! Miner Instance (spec §4.B): owns one running backend process, its
//! stdout/stderr ring buffer, hashrate history, and lifecycle state.
//! Generalizes the teacher's `XMRigAdapter`/`CpuminerOptAdapter`
//! process-lifecycle pattern (spawn with piped stdio, `kill_on_drop`,
//! SIGTERM→timeout→SIGKILL) into one backend-agnostic type, and the
//! teacher's `LogBuffer` (diagnostics.rs) ring buffer into a per-instance
//! bounded deque.

use crate::session::SessionTracker;
use crate::{CoreError, Result};
use fleetctl_backends::{BackendKind, Config, Stats};
use fleetctl_store::HashrateStore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{error, info, warn};

pub const DEFAULT_RING_CAPACITY: usize = 10_000;
pub const MAX_RING_CAPACITY: usize = 100_000;
/// High-resolution points are kept roughly every 10s; cap generously so an
/// instance left running doesn't grow its in-memory history unbounded
/// between `reduce_hashrate_history` calls.
const MAX_HI_RES_POINTS: usize = 2_000;
const STOP_GRACE: Duration = Duration::from_secs(3);
const STATS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Exited { code: i32 },
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HashratePoint {
    pub timestamp: i64,
    pub hashrate: i64,
}

/// Monotonic epoch assigned to each spawned process. The exit-watcher
/// captures the epoch in scope at spawn time and, on exit, takes the write
/// lock and clears `child`/`state` only if the stored epoch still matches —
/// this is the central ABA guard from spec §9: a quick stop+start must not
/// let the old watcher clobber the new instance.
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

struct InstanceInner {
    state: InstanceState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    epoch: u64,
    logs: VecDeque<String>,
    hashrate_hi: VecDeque<HashratePoint>,
    last_full_stats: Option<Stats>,
    started_at: SystemTime,
    exited_at: Option<SystemTime>,
}

pub struct MinerInstance {
    pub name: String,
    pub backend_kind: String,
    pub config: Config,
    pub http_port: u16,
    backend: Arc<dyn BackendKind>,
    inner: Arc<RwLock<InstanceInner>>,
    ring_capacity: usize,
}

impl MinerInstance {
    /// Spawns the backend process and returns the instance with its
    /// exit-watcher already running. `config` is immutable after this call
    /// (spec §3: "config immutable after start").
    pub async fn start(
        name: String,
        backend: Arc<dyn BackendKind>,
        config: Config,
        http_port: u16,
        binary_path: &std::path::Path,
        ring_capacity: usize,
        sessions: Arc<SessionTracker>,
        store: Arc<HashrateStore>,
    ) -> Result<Self> {
        config.validate()?;
        let ring_capacity = ring_capacity.clamp(1, MAX_RING_CAPACITY);

        let args = backend.build_args(&name, &config, http_port)?;
        let epoch = NEXT_EPOCH.fetch_add(1, Ordering::SeqCst);

        let mut cmd = Command::new(binary_path);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| CoreError::Internal(format!("launch failed: {e}")))?;
        let stdin = child.stdin.take();

        let inner = Arc::new(RwLock::new(InstanceInner {
            state: InstanceState::Starting,
            child: None,
            stdin,
            epoch,
            logs: VecDeque::with_capacity(ring_capacity.min(1024)),
            hashrate_hi: VecDeque::new(),
            last_full_stats: None,
            started_at: SystemTime::now(),
            exited_at: None,
        }));

        if let Some(stdout) = child.stdout.take() {
            spawn_log_pump(inner.clone(), stdout, ring_capacity);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_pump(inner.clone(), stderr, ring_capacity);
        }

        spawn_exit_watcher(inner.clone(), epoch, &mut child, name.clone(), sessions, store);

        {
            let mut guard = inner.write().await;
            guard.child = Some(child);
            guard.epoch = epoch;
            guard.state = InstanceState::Running;
        }

        info!(instance_name = %name, backend_kind = backend.name(), http_port, "miner instance started");

        Ok(Self {
            name,
            backend_kind: backend.name().to_string(),
            config,
            http_port,
            backend,
            inner,
            ring_capacity,
        })
    }

    pub async fn state(&self) -> InstanceState {
        self.inner.read().await.state.clone()
    }

    /// Sends a termination signal, waits up to `grace` for exit, then
    /// escalates to a hard kill.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let mut guard = self.inner.write().await;
        if !matches!(guard.state, InstanceState::Running) {
            return Ok(());
        }
        guard.state = InstanceState::Stopping;

        let Some(child) = guard.child.as_mut() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = child.id() {
                info!(instance_name = %self.name, pid, "sending SIGTERM");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(instance_name = %self.name, ?status, "instance stopped gracefully");
            }
            Ok(Err(e)) => {
                error!(instance_name = %self.name, error = %e, "error waiting for instance exit");
            }
            Err(_) => {
                warn!(instance_name = %self.name, "graceful stop timed out, sending SIGKILL");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }

        guard.state = InstanceState::Exited { code: 0 };
        guard.exited_at = Some(SystemTime::now());
        guard.child = None;
        guard.stdin = None;
        Ok(())
    }

    /// Snapshots `http_port` under a read lock, releases it, performs the
    /// HTTP GET with a per-request timeout, then re-acquires the write lock
    /// only to store the decoded value (spec §4.B).
    pub async fn get_stats(&self) -> Result<Stats> {
        let state = self.state().await;
        if !matches!(state, InstanceState::Running) {
            return Err(CoreError::Unavailable(format!("{} is not running", self.name)));
        }

        let port = self.http_port;
        let url = self.backend.stats_url(port);

        let client = reqwest::Client::new();
        let resp = timeout(STATS_TIMEOUT, client.get(&url).send())
            .await
            .map_err(|_| CoreError::Remote("stats request timed out".into()))?
            .map_err(|e| CoreError::Remote(e.to_string()))?;

        let body = resp.bytes().await.map_err(|e| CoreError::Remote(e.to_string()))?;
        let stats = self.backend.parse_stats(&body)?;

        let mut guard = self.inner.write().await;
        guard.last_full_stats = Some(stats.clone());
        Ok(stats)
    }

    pub async fn last_stats(&self) -> Option<Stats> {
        self.inner.read().await.last_full_stats.clone()
    }

    /// Returns at most `min(n, 10_000)` most recent lines; `n` is clamped on
    /// entry per spec §4.B.
    pub async fn get_logs(&self, n: usize) -> Vec<String> {
        let n = n.min(DEFAULT_RING_CAPACITY);
        let guard = self.inner.read().await;
        guard.logs.iter().rev().take(n).rev().cloned().collect()
    }

    /// Writes `data` followed by a newline to the process's stdin (spec
    /// §4.G `POST /miners/:name/stdin`). Shell-metacharacter validation
    /// happens at the HTTP layer before this is ever called.
    pub async fn write_stdin(&self, data: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        let Some(stdin) = guard.stdin.as_mut() else {
            return Err(CoreError::Unavailable(format!("{} has no open stdin", self.name)));
        };
        stdin
            .write_all(format!("{data}\n").as_bytes())
            .await
            .map_err(|e| CoreError::Internal(format!("stdin write failed: {e}")))
    }

    pub async fn add_hashrate_point(&self, timestamp: i64, hashrate: i64) {
        let mut guard = self.inner.write().await;
        guard.hashrate_hi.push_back(HashratePoint { timestamp, hashrate });
        while guard.hashrate_hi.len() > MAX_HI_RES_POINTS {
            guard.hashrate_hi.pop_front();
        }
    }

    pub async fn hashrate_history(&self) -> Vec<HashratePoint> {
        self.inner.read().await.hashrate_hi.iter().copied().collect()
    }

    /// Moves points older than `hi_retention` into one per-minute average
    /// per bucket, drops them from the in-memory high-res list, and returns
    /// the computed low-res points for the caller to persist.
    pub async fn reduce_hashrate_history(&self, hi_retention: Duration, now: SystemTime) -> Vec<HashratePoint> {
        let cutoff = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
            - hi_retention.as_secs() as i64;

        let mut guard = self.inner.write().await;
        let (stale, fresh): (Vec<_>, Vec<_>) = guard.hashrate_hi.iter().copied().partition(|p| p.timestamp < cutoff);
        guard.hashrate_hi = fresh.into_iter().collect();
        drop(guard);

        if stale.is_empty() {
            return Vec::new();
        }

        const BUCKET_SECS: i64 = 60;
        let mut buckets: std::collections::BTreeMap<i64, (i64, i64)> = std::collections::BTreeMap::new();
        for point in &stale {
            let bucket = point.timestamp - point.timestamp.rem_euclid(BUCKET_SECS);
            let entry = buckets.entry(bucket).or_insert((0, 0));
            entry.0 += point.hashrate;
            entry.1 += 1;
        }

        buckets
            .into_iter()
            .map(|(bucket, (sum, count))| HashratePoint {
                timestamp: bucket,
                hashrate: sum / count.max(1),
            })
            .collect()
    }

    pub async fn started_at(&self) -> SystemTime {
        self.inner.read().await.started_at
    }
}

fn spawn_log_pump(inner: Arc<RwLock<InstanceInner>>, pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static, capacity: usize) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut guard = inner.write().await;
            guard.logs.push_back(line);
            while guard.logs.len() > capacity {
                guard.logs.pop_front();
            }
        }
    });
}

fn spawn_exit_watcher(
    inner: Arc<RwLock<InstanceInner>>,
    epoch: u64,
    child: &mut Child,
    instance_name: String,
    sessions: Arc<SessionTracker>,
    store: Arc<HashrateStore>,
) {
    // Polls via try_wait against the InstanceInner.child slot rather than
    // owning the Child directly, since stop() also needs &mut access to it.
    let pid = child.id();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        loop {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let mut guard = inner.write().await;
            if guard.epoch != epoch {
                // A newer instance has taken this slot; exit silently. This
                // is the ABA guard: never clear a successor's state.
                return;
            }
            let Some(child) = guard.child.as_mut() else {
                return;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    if guard.epoch != epoch {
                        return;
                    }
                    guard.state = InstanceState::Exited {
                        code: status.code().unwrap_or(-1),
                    };
                    guard.exited_at = Some(SystemTime::now());
                    guard.child = None;
                    guard.stdin = None;
                    drop(guard);
                    warn!(pid, ?status, "miner process exited");
                    if let Err(e) = sessions.close_session(&store, &instance_name).await {
                        error!(instance_name = %instance_name, error = %e, "failed to close mining session on crash");
                    }
                    return;
                }
                Ok(None) => continue,
                Err(e) => {
                    if guard.epoch != epoch {
                        return;
                    }
                    guard.state = InstanceState::Failed { reason: e.to_string() };
                    guard.child = None;
                    drop(guard);
                    if let Err(close_err) = sessions.close_session(&store, &instance_name).await {
                        error!(instance_name = %instance_name, error = %close_err, "failed to close mining session after wait error");
                    }
                    error!(instance_name = %instance_name, error = %e, "error polling miner process");
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashrate_point_buckets_to_minute() {
        let point = HashratePoint { timestamp: 125, hashrate: 10 };
        assert_eq!(point.timestamp - point.timestamp.rem_euclid(60), 120);
    }
}
