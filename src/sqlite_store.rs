//! SQLite-backed [`JobStore`] and [`PointerStore`].
//!
//! Tables are created by [`crate::migrate`]. Timestamps are INTEGER
//! microseconds (see [`crate::db::to_micros`]).
//!
//! Two writes carry the concurrency guarantees of the system:
//!
//! - reindex creation is a single `INSERT … SELECT … WHERE NOT EXISTS` over
//!   non-terminal jobs, so two triggers can never both create a job;
//! - cutover is a single `UPDATE … WHERE version = ?` on the pointer row.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use kb_sync_core::models::{ErrorKind, IndexPointer, ReindexJob, ReindexStatus, SyncJob, SyncStatus};
use kb_sync_core::store::{CutoverResult, JobStore, PointerStore, TriggerOutcome};

use crate::db::{from_micros, to_micros};

const POINTER_NAME: &str = "current";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Most recent ledger entries across all indexes, newest first.
    pub async fn recent_sync_jobs(&self, limit: i64) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query(
            "SELECT job_id, index_id, started_at, status FROM sync_ledger \
             ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_sync_job).collect()
    }
}

fn row_to_sync_job(row: &SqliteRow) -> Result<SyncJob> {
    let status: String = row.get("status");
    Ok(SyncJob {
        job_id: row.get("job_id"),
        index_id: row.get("index_id"),
        status: status.parse()?,
        started_at: from_micros(row.get("started_at")),
    })
}

fn row_to_reindex_job(row: &SqliteRow) -> Result<ReindexJob> {
    let status: String = row.get("status");
    let error_messages: String = row.get("error_messages");
    let error_kind: Option<String> = row.get("error_kind");
    let sync_started_at: Option<i64> = row.get("sync_started_at");

    Ok(ReindexJob {
        execution_id: row.get("execution_id"),
        status: status.parse::<ReindexStatus>()?,
        old_index_id: row.get("old_index_id"),
        new_index_id: row.get("new_index_id"),
        total_items: row.get::<i64, _>("total_items") as u64,
        processed_count: row.get::<i64, _>("processed_count") as u64,
        error_count: row.get::<i64, _>("error_count") as u64,
        error_messages: serde_json::from_str(&error_messages)?,
        last_item_id: row.get("last_item_id"),
        sync_job_id: row.get("sync_job_id"),
        sync_started_at: sync_started_at.map(from_micros),
        error_kind: error_kind.map(|k| k.parse::<ErrorKind>()).transpose()?,
        failure: row.get("failure"),
        cleanup_error: row.get("cleanup_error"),
        started_at: from_micros(row.get("started_at")),
        updated_at: from_micros(row.get("updated_at")),
    })
}

const REINDEX_COLUMNS: &str = "execution_id, status, old_index_id, new_index_id, total_items, \
     processed_count, error_count, error_messages, last_item_id, sync_job_id, sync_started_at, \
     error_kind, failure, cleanup_error, started_at, updated_at";

const TERMINAL_STATUSES: &str = "('COMPLETED', 'FAILED')";

#[async_trait]
impl JobStore for SqliteStore {
    async fn record_sync_job(&self, job: &SyncJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_ledger (job_id, index_id, started_at, status, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.index_id)
        .bind(to_micros(job.started_at))
        .bind(job.status.as_str())
        .bind(to_micros(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_sync_job(&self, job_id: &str, status: SyncStatus) -> Result<()> {
        sqlx::query("UPDATE sync_ledger SET status = ?, updated_at = ? WHERE job_id = ?")
            .bind(status.as_str())
            .bind(to_micros(Utc::now()))
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sync_jobs_since(&self, index_id: &str, since: DateTime<Utc>) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query(
            "SELECT job_id, index_id, started_at, status FROM sync_ledger \
             WHERE index_id = ? AND started_at >= ? ORDER BY started_at ASC",
        )
        .bind(index_id)
        .bind(to_micros(since))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_sync_job).collect()
    }

    async fn create_reindex_job(&self, job: &ReindexJob) -> Result<TriggerOutcome> {
        // The active job can finish between a refused insert and the read
        // below, so try again a few times before giving up.
        for _ in 0..3 {
            let sql = format!(
                "INSERT INTO reindex_jobs ({cols}) \
                 SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? \
                 WHERE NOT EXISTS (SELECT 1 FROM reindex_jobs WHERE status NOT IN {terminal})",
                cols = REINDEX_COLUMNS,
                terminal = TERMINAL_STATUSES
            );
            let inserted = bind_reindex_job(sqlx::query(&sql), job)?
                .execute(&self.pool)
                .await?
                .rows_affected();
            if inserted == 1 {
                return Ok(TriggerOutcome::Created(job.clone()));
            }
            if let Some(active) = self.active_reindex_job().await? {
                return Ok(TriggerOutcome::Existing(active));
            }
        }
        Err(anyhow!("could not create reindex job: store kept changing"))
    }

    async fn update_reindex_job(
        &self,
        job: &ReindexJob,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let assignments: Vec<String> = REINDEX_COLUMNS
            .split(',')
            .map(|col| format!("{} = ?", col.trim()))
            .collect();
        let sql = format!(
            "UPDATE reindex_jobs SET {} WHERE execution_id = ? AND updated_at = ?",
            assignments.join(", ")
        );
        let updated = bind_reindex_job(sqlx::query(&sql), job)?
            .bind(job.execution_id.clone())
            .bind(to_micros(expected_updated_at))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    async fn load_reindex_job(&self, execution_id: &str) -> Result<Option<ReindexJob>> {
        let sql = format!(
            "SELECT {} FROM reindex_jobs WHERE execution_id = ?",
            REINDEX_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_reindex_job).transpose()
    }

    async fn active_reindex_job(&self) -> Result<Option<ReindexJob>> {
        let sql = format!(
            "SELECT {} FROM reindex_jobs WHERE status NOT IN {} \
             ORDER BY started_at ASC LIMIT 1",
            REINDEX_COLUMNS, TERMINAL_STATUSES
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_reindex_job).transpose()
    }

    async fn latest_reindex_job(&self) -> Result<Option<ReindexJob>> {
        let sql = format!(
            "SELECT {} FROM reindex_jobs ORDER BY started_at DESC, execution_id DESC LIMIT 1",
            REINDEX_COLUMNS
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_reindex_job).transpose()
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

/// Bind every column of [`REINDEX_COLUMNS`], in order.
fn bind_reindex_job<'q>(query: SqliteQuery<'q>, job: &ReindexJob) -> Result<SqliteQuery<'q>> {
    Ok(query
        .bind(job.execution_id.clone())
        .bind(job.status.as_str())
        .bind(job.old_index_id.clone())
        .bind(job.new_index_id.clone())
        .bind(job.total_items as i64)
        .bind(job.processed_count as i64)
        .bind(job.error_count as i64)
        .bind(serde_json::to_string(&job.error_messages)?)
        .bind(job.last_item_id.clone())
        .bind(job.sync_job_id.clone())
        .bind(job.sync_started_at.map(to_micros))
        .bind(job.error_kind.map(|k| k.as_str()))
        .bind(job.failure.clone())
        .bind(job.cleanup_error.clone())
        .bind(to_micros(job.started_at))
        .bind(to_micros(job.updated_at)))
}

#[async_trait]
impl PointerStore for SqliteStore {
    async fn current(&self) -> Result<Option<IndexPointer>> {
        let row = sqlx::query(
            "SELECT index_id, version, updated_at FROM index_pointer WHERE name = ?",
        )
        .bind(POINTER_NAME)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| IndexPointer {
            index_id: r.get("index_id"),
            version: r.get::<i64, _>("version") as u64,
            updated_at: from_micros(r.get("updated_at")),
        }))
    }

    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        new_index_id: &str,
    ) -> Result<CutoverResult> {
        let now = Utc::now();
        let applied = match expected_version {
            None => sqlx::query(
                "INSERT INTO index_pointer (name, index_id, version, updated_at) \
                 VALUES (?, ?, 1, ?) ON CONFLICT(name) DO NOTHING",
            )
            .bind(POINTER_NAME)
            .bind(new_index_id)
            .bind(to_micros(now))
            .execute(&self.pool)
            .await?
            .rows_affected(),
            Some(version) => sqlx::query(
                "UPDATE index_pointer SET index_id = ?, version = version + 1, updated_at = ? \
                 WHERE name = ? AND version = ?",
            )
            .bind(new_index_id)
            .bind(to_micros(now))
            .bind(POINTER_NAME)
            .bind(version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected(),
        };

        if applied == 1 {
            let pointer = IndexPointer {
                index_id: new_index_id.to_string(),
                version: expected_version.map_or(1, |v| v + 1),
                updated_at: from_micros(to_micros(now)),
            };
            Ok(CutoverResult::Applied(pointer))
        } else {
            Ok(CutoverResult::Stale(self.current().await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("kb.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::migrate(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    #[tokio::test]
    async fn reindex_job_survives_reload() {
        let (_tmp, store) = store().await;
        let mut job = ReindexJob::new("exec-1", Some("idx-old".into()), Utc::now());
        assert!(store.create_reindex_job(&job).await.unwrap().created());

        job.status = ReindexStatus::Processing;
        job.new_index_id = Some("idx-new".into());
        job.total_items = 10;
        job.processed_count = 4;
        job.last_item_id = Some("item-04".into());
        job.record_item_error("item-02", "bad sidecar", 10);
        job.error_kind = Some(ErrorKind::Retryable);
        let created_at = job.updated_at;
        job.updated_at = created_at + chrono::Duration::milliseconds(5);
        assert!(store.update_reindex_job(&job, created_at).await.unwrap());
        // A writer still holding the old copy is refused.
        assert!(!store.update_reindex_job(&job, created_at).await.unwrap());

        let loaded = store.load_reindex_job("exec-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ReindexStatus::Processing);
        assert_eq!(loaded.new_index_id.as_deref(), Some("idx-new"));
        assert_eq!(loaded.processed_count, 4);
        assert_eq!(loaded.last_item_id.as_deref(), Some("item-04"));
        assert_eq!(loaded.error_messages, vec!["item-02: bad sidecar".to_string()]);
        assert_eq!(loaded.error_kind, Some(ErrorKind::Retryable));
        assert!(store.load_reindex_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn only_one_active_reindex_job() {
        let (_tmp, store) = store().await;
        let first = ReindexJob::new("exec-1", None, Utc::now());
        let second = ReindexJob::new("exec-2", None, Utc::now());
        assert!(store.create_reindex_job(&first).await.unwrap().created());

        match store.create_reindex_job(&second).await.unwrap() {
            TriggerOutcome::Existing(job) => assert_eq!(job.execution_id, "exec-1"),
            other => panic!("expected existing job, got {:?}", other),
        }

        let mut done = first.clone();
        done.status = ReindexStatus::Failed;
        assert!(store.update_reindex_job(&done, first.updated_at).await.unwrap());
        assert!(store.create_reindex_job(&second).await.unwrap().created());
        assert_eq!(
            store.latest_reindex_job().await.unwrap().unwrap().execution_id,
            "exec-2"
        );
    }

    #[tokio::test]
    async fn pointer_compare_and_swap() {
        let (_tmp, store) = store().await;
        assert!(store.current().await.unwrap().is_none());

        let applied = store.compare_and_swap(None, "idx-a").await.unwrap();
        assert!(matches!(applied, CutoverResult::Applied(ref p) if p.version == 1));

        let stale = store.compare_and_swap(None, "idx-b").await.unwrap();
        assert!(matches!(stale, CutoverResult::Stale(Some(ref p)) if p.index_id == "idx-a"));
        let stale = store.compare_and_swap(Some(7), "idx-b").await.unwrap();
        assert!(matches!(stale, CutoverResult::Stale(_)));

        let moved = store.compare_and_swap(Some(1), "idx-b").await.unwrap();
        assert!(matches!(moved, CutoverResult::Applied(ref p) if p.version == 2));
        let current = store.current().await.unwrap().unwrap();
        assert_eq!(current.index_id, "idx-b");
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn ledger_since_and_update() {
        let (_tmp, store) = store().await;
        let t0 = Utc::now();
        for (id, offset) in [("job-1", -10), ("job-2", 0), ("job-3", 5)] {
            store
                .record_sync_job(&SyncJob {
                    job_id: id.into(),
                    index_id: "kb".into(),
                    status: SyncStatus::InProgress,
                    started_at: t0 + chrono::Duration::seconds(offset),
                })
                .await
                .unwrap();
        }
        store
            .update_sync_job("job-2", SyncStatus::Complete)
            .await
            .unwrap();

        let since = store.sync_jobs_since("kb", t0).await.unwrap();
        let ids: Vec<&str> = since.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["job-2", "job-3"]);
        assert_eq!(since[0].status, SyncStatus::Complete);
        assert!(store.sync_jobs_since("other", t0).await.unwrap().is_empty());
        assert_eq!(store.recent_sync_jobs(1).await.unwrap()[0].job_id, "job-3");
    }
}
