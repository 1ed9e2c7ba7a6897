//! Embedded SQL time-series + session store (spec §4.D). New relative to the
//! teacher, which persists only flat JSON; grounded on the corpus's `sqlx`
//! SQLite idiom for local telemetry stores. Single-writer discipline: the
//! pool is capped at one connection, every operation takes the process-wide
//! `RwLock` (write lock for writes, read lock for reads) before touching the
//! pool, and a `None` inner pool makes every operation a silent no-op — so
//! callers never have to branch on whether persistence is configured.

mod queries;
mod schema;

pub use queries::{HashratePoint, Resolution, SessionRecord};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store operation timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Operations bound their DB interaction to at least this long (spec §4.D).
const MIN_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HashrateStore {
    pool: RwLock<Option<SqlitePool>>,
}

impl HashrateStore {
    /// A store with no backing pool: every write is a no-op, every read
    /// returns empty. Used when persistence is disabled or not yet opened.
    pub fn disabled() -> Self {
        Self {
            pool: RwLock::new(None),
        }
    }

    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(MIN_OPERATION_TIMEOUT)
            .connect_with(options)
            .await?;

        schema::migrate(&pool).await?;

        Ok(Self {
            pool: RwLock::new(Some(pool)),
        })
    }

    /// Batch-inserts hashrate points inside a single transaction. A no-op on
    /// a disabled store.
    pub async fn insert_hashrate_points(&self, points: &[HashratePoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let guard = self.pool.write().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(());
        };
        queries::insert_hashrate_points(pool, points).await
    }

    pub async fn hashrate_history(
        &self,
        miner_name: &str,
        since: i64,
        until: i64,
        resolution: Resolution,
    ) -> Result<Vec<HashratePoint>> {
        let guard = self.pool.read().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        queries::hashrate_history(pool, miner_name, since, until, resolution).await
    }

    pub async fn open_session(&self, session: &SessionRecord) -> Result<()> {
        let guard = self.pool.write().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(());
        };
        queries::insert_session(pool, session).await
    }

    pub async fn close_session(
        &self,
        instance_name: &str,
        stopped_at: i64,
        total_shares: u64,
        rejected_shares: u64,
        avg_hashrate: f64,
    ) -> Result<()> {
        let guard = self.pool.write().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(());
        };
        queries::close_session(pool, instance_name, stopped_at, total_shares, rejected_shares, avg_hashrate).await
    }

    /// Deletes `hashrate_history` rows older than `retention_days` and
    /// applies the symmetric policy to `miner_sessions` (Open Question,
    /// resolved in DESIGN.md: same retention window unless configured
    /// otherwise).
    pub async fn cleanup(&self, hashrate_retention_days: i64, session_retention_days: i64, now: i64) -> Result<()> {
        let guard = self.pool.write().await;
        let Some(pool) = guard.as_ref() else {
            return Ok(());
        };
        let hashrate_cutoff = now - hashrate_retention_days * 86_400;
        let session_cutoff = now - session_retention_days * 86_400;
        queries::cleanup(pool, hashrate_cutoff, session_cutoff).await
    }

    pub fn is_enabled(&self) -> bool {
        // Best-effort, non-blocking check used by health/info endpoints.
        self.pool.try_read().map(|g| g.is_some()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_store_is_a_silent_no_op() {
        let store = HashrateStore::disabled();
        store
            .insert_hashrate_points(&[HashratePoint {
                miner_name: "xmrig-rx0".into(),
                backend_kind: "xmrig".into(),
                timestamp: 1,
                hashrate: 100,
                resolution: Resolution::High,
            }])
            .await
            .unwrap();

        let points = store
            .hashrate_history("xmrig-rx0", 0, i64::MAX, Resolution::High)
            .await
            .unwrap();
        assert!(points.is_empty());
        assert!(!store.is_enabled());
    }

    #[tokio::test]
    async fn open_creates_and_migrates_a_fresh_db() {
        let dir = std::env::temp_dir().join(format!("fleetctl-store-test-{}", std::process::id()));
        let db_path = dir.join("mining.db");
        let store = HashrateStore::open(&db_path).await.unwrap();
        assert!(store.is_enabled());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn retention_cleanup_drops_only_stale_points() {
        let dir = std::env::temp_dir().join(format!("fleetctl-store-test2-{}", std::process::id()));
        let db_path = dir.join("mining.db");
        let store = HashrateStore::open(&db_path).await.unwrap();

        let now = 1_000_000i64;
        let day = 86_400i64;
        let points = vec![
            HashratePoint {
                miner_name: "xmrig-rx0".into(),
                backend_kind: "xmrig".into(),
                timestamp: now - 35 * day,
                hashrate: 10,
                resolution: Resolution::High,
            },
            HashratePoint {
                miner_name: "xmrig-rx0".into(),
                backend_kind: "xmrig".into(),
                timestamp: now - 25 * day,
                hashrate: 20,
                resolution: Resolution::High,
            },
            HashratePoint {
                miner_name: "xmrig-rx0".into(),
                backend_kind: "xmrig".into(),
                timestamp: now - 5 * day,
                hashrate: 30,
                resolution: Resolution::High,
            },
        ];
        store.insert_hashrate_points(&points).await.unwrap();
        store.cleanup(30, 30, now).await.unwrap();

        let remaining = store
            .hashrate_history("xmrig-rx0", 0, i64::MAX, Resolution::High)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|p| p.timestamp >= now - 30 * day));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
