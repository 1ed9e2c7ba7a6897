use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    High,
    Low,
}

impl Resolution {
    fn as_str(self) -> &'static str {
        match self {
            Resolution::High => "high",
            Resolution::Low => "low",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "low" => Resolution::Low,
            _ => Resolution::High,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashratePoint {
    pub miner_name: String,
    pub backend_kind: String,
    pub timestamp: i64,
    pub hashrate: i64,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub instance_name: String,
    pub backend_kind: String,
    pub started_at: i64,
}

pub async fn insert_hashrate_points(pool: &SqlitePool, points: &[HashratePoint]) -> crate::Result<()> {
    let mut tx = pool.begin().await?;
    for point in points {
        sqlx::query(
            "INSERT INTO hashrate_history (miner_name, backend_kind, timestamp, hashrate, resolution) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&point.miner_name)
        .bind(&point.backend_kind)
        .bind(point.timestamp)
        .bind(point.hashrate)
        .bind(point.resolution.as_str())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn hashrate_history(
    pool: &SqlitePool,
    miner_name: &str,
    since: i64,
    until: i64,
    resolution: Resolution,
) -> crate::Result<Vec<HashratePoint>> {
    let rows = sqlx::query(
        "SELECT miner_name, backend_kind, timestamp, hashrate, resolution FROM hashrate_history \
         WHERE miner_name = ?1 AND resolution = ?2 AND timestamp >= ?3 AND timestamp <= ?4 \
         ORDER BY timestamp ASC",
    )
    .bind(miner_name)
    .bind(resolution.as_str())
    .bind(since)
    .bind(until)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| HashratePoint {
            miner_name: row.get("miner_name"),
            backend_kind: row.get("backend_kind"),
            timestamp: row.get("timestamp"),
            hashrate: row.get("hashrate"),
            resolution: Resolution::from_str(row.get::<String, _>("resolution").as_str()),
        })
        .collect())
}

pub async fn insert_session(pool: &SqlitePool, session: &SessionRecord) -> crate::Result<()> {
    sqlx::query(
        "INSERT INTO miner_sessions (id, instance_name, backend_kind, started_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(&session.id)
    .bind(&session.instance_name)
    .bind(&session.backend_kind)
    .bind(session.started_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn close_session(
    pool: &SqlitePool,
    instance_name: &str,
    stopped_at: i64,
    total_shares: u64,
    rejected_shares: u64,
    avg_hashrate: f64,
) -> crate::Result<()> {
    sqlx::query(
        "UPDATE miner_sessions SET stopped_at = ?1, total_shares = ?2, rejected_shares = ?3, avg_hashrate = ?4 \
         WHERE instance_name = ?5 AND stopped_at IS NULL",
    )
    .bind(stopped_at)
    .bind(total_shares as i64)
    .bind(rejected_shares as i64)
    .bind(avg_hashrate)
    .bind(instance_name)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn cleanup(pool: &SqlitePool, hashrate_cutoff: i64, session_cutoff: i64) -> crate::Result<()> {
    sqlx::query("DELETE FROM hashrate_history WHERE timestamp < ?1")
        .bind(hashrate_cutoff)
        .execute(pool)
        .await?;

    sqlx::query("DELETE FROM miner_sessions WHERE started_at < ?1 AND stopped_at IS NOT NULL")
        .bind(session_cutoff)
        .execute(pool)
        .await?;

    Ok(())
}
