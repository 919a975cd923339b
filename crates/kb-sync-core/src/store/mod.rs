//! Durable state owned by kb-sync itself.
//!
//! [`JobStore`] holds the sync ledger (every sync job kb-sync started) and
//! the reindex jobs. [`PointerStore`] holds the versioned "current index"
//! reference read by the query path. Implementations: [`memory`] for tests,
//! and the SQLite store in the application crate.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{IndexPointer, ReindexJob, SyncJob, SyncStatus};

/// Result of asking the store to create a reindex job.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Created(ReindexJob),
    /// A non-terminal job already exists; nothing was created.
    Existing(ReindexJob),
}

impl TriggerOutcome {
    pub fn job(&self) -> &ReindexJob {
        match self {
            TriggerOutcome::Created(job) | TriggerOutcome::Existing(job) => job,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, TriggerOutcome::Created(_))
    }
}

/// Result of a compare-and-set on the current-index pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum CutoverResult {
    Applied(IndexPointer),
    /// The pointer moved since it was read; carries the value now stored.
    Stale(Option<IndexPointer>),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Remember a sync job started by kb-sync.
    async fn record_sync_job(&self, job: &SyncJob) -> Result<()>;

    async fn update_sync_job(&self, job_id: &str, status: SyncStatus) -> Result<()>;

    /// Ledger entries for `index_id` started at or after `since`, oldest first.
    async fn sync_jobs_since(&self, index_id: &str, since: DateTime<Utc>) -> Result<Vec<SyncJob>>;

    /// Insert `job` unless a non-terminal job exists. The check and the
    /// insert are atomic.
    async fn create_reindex_job(&self, job: &ReindexJob) -> Result<TriggerOutcome>;

    /// Overwrite the stored job only if its `updated_at` still equals
    /// `expected_updated_at`. Returns false when another writer saved the
    /// job in between, or the job does not exist.
    async fn update_reindex_job(
        &self,
        job: &ReindexJob,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn load_reindex_job(&self, execution_id: &str) -> Result<Option<ReindexJob>>;

    async fn active_reindex_job(&self) -> Result<Option<ReindexJob>>;

    async fn latest_reindex_job(&self) -> Result<Option<ReindexJob>>;
}

/// Versioned single-writer cell holding the index served to queries.
#[async_trait]
pub trait PointerStore: Send + Sync {
    async fn current(&self) -> Result<Option<IndexPointer>>;

    /// Point at `new_index_id` if the stored version still equals
    /// `expected_version` (`None` = no pointer yet). A single write.
    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        new_index_id: &str,
    ) -> Result<CutoverResult>;
}
