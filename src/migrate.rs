use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database file and every table. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // Request queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            index_id TEXT NOT NULL,
            requested_at INTEGER NOT NULL,
            dedup_hash TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            deliveries INTEGER NOT NULL DEFAULT 0,
            visible_at INTEGER NOT NULL,
            enqueued_at INTEGER NOT NULL,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Sync jobs started by kb-sync
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_ledger (
            job_id TEXT PRIMARY KEY,
            index_id TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reindex_jobs (
            execution_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            old_index_id TEXT,
            new_index_id TEXT,
            total_items INTEGER NOT NULL DEFAULT 0,
            processed_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            error_messages TEXT NOT NULL DEFAULT '[]',
            last_item_id TEXT,
            sync_job_id TEXT,
            sync_started_at INTEGER,
            error_kind TEXT,
            failure TEXT,
            cleanup_error TEXT,
            started_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_pointer (
            name TEXT PRIMARY KEY,
            index_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_requests_index_state ON sync_requests(index_id, state)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_requests_hash ON sync_requests(dedup_hash)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_ledger_index_started ON sync_ledger(index_id, started_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_reindex_jobs_status ON reindex_jobs(status)")
        .execute(pool)
        .await?;

    Ok(())
}
