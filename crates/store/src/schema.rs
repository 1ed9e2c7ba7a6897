use sqlx::SqlitePool;

pub async fn migrate(pool: &SqlitePool) -> crate::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hashrate_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            miner_name TEXT NOT NULL,
            backend_kind TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            hashrate INTEGER NOT NULL,
            resolution TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_hashrate_miner_ts ON hashrate_history (miner_name, timestamp DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_hashrate_resolution_ts ON hashrate_history (resolution, timestamp)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS miner_sessions (
            id TEXT PRIMARY KEY,
            instance_name TEXT NOT NULL,
            backend_kind TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            stopped_at INTEGER,
            total_shares INTEGER NOT NULL DEFAULT 0,
            rejected_shares INTEGER NOT NULL DEFAULT 0,
            avg_hashrate REAL NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sessions_instance_started ON miner_sessions (instance_name, started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
