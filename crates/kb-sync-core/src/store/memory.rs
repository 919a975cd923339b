//! In-memory [`JobStore`] and [`PointerStore`] for tests.
//!
//! Uses `std::sync::RwLock`; every operation holds the lock for its whole
//! check-then-write so the atomicity contracts of the traits hold.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{IndexPointer, ReindexJob, SyncJob, SyncStatus};

use super::{CutoverResult, JobStore, PointerStore, TriggerOutcome};

/// In-memory store for testing.
pub struct InMemoryStore {
    ledger: RwLock<Vec<SyncJob>>,
    reindex_jobs: RwLock<HashMap<String, ReindexJob>>,
    pointer: RwLock<Option<IndexPointer>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            ledger: RwLock::new(Vec::new()),
            reindex_jobs: RwLock::new(HashMap::new()),
            pointer: RwLock::new(None),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn record_sync_job(&self, job: &SyncJob) -> Result<()> {
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        ledger.retain(|j| j.job_id != job.job_id);
        ledger.push(job.clone());
        Ok(())
    }

    async fn update_sync_job(&self, job_id: &str, status: SyncStatus) -> Result<()> {
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = ledger.iter_mut().find(|j| j.job_id == job_id) {
            job.status = status;
        }
        Ok(())
    }

    async fn sync_jobs_since(&self, index_id: &str, since: DateTime<Utc>) -> Result<Vec<SyncJob>> {
        let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
        let mut jobs: Vec<SyncJob> = ledger
            .iter()
            .filter(|j| j.index_id == index_id && j.started_at >= since)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(jobs)
    }

    async fn create_reindex_job(&self, job: &ReindexJob) -> Result<TriggerOutcome> {
        let mut jobs = self
            .reindex_jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = jobs.values().find(|j| !j.is_terminal()) {
            return Ok(TriggerOutcome::Existing(active.clone()));
        }
        jobs.insert(job.execution_id.clone(), job.clone());
        Ok(TriggerOutcome::Created(job.clone()))
    }

    async fn update_reindex_job(
        &self,
        job: &ReindexJob,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut jobs = self
            .reindex_jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match jobs.get_mut(&job.execution_id) {
            Some(stored) if stored.updated_at == expected_updated_at => {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn load_reindex_job(&self, execution_id: &str) -> Result<Option<ReindexJob>> {
        Ok(self
            .reindex_jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned())
    }

    async fn active_reindex_job(&self) -> Result<Option<ReindexJob>> {
        Ok(self
            .reindex_jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|j| !j.is_terminal())
            .cloned())
    }

    async fn latest_reindex_job(&self) -> Result<Option<ReindexJob>> {
        Ok(self
            .reindex_jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .max_by(|a, b| {
                a.started_at
                    .cmp(&b.started_at)
                    .then_with(|| a.execution_id.cmp(&b.execution_id))
            })
            .cloned())
    }
}

#[async_trait]
impl PointerStore for InMemoryStore {
    async fn current(&self) -> Result<Option<IndexPointer>> {
        Ok(self
            .pointer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        new_index_id: &str,
    ) -> Result<CutoverResult> {
        let mut pointer = self.pointer.write().unwrap_or_else(PoisonError::into_inner);
        let stored_version = pointer.as_ref().map(|p| p.version);
        if stored_version != expected_version {
            return Ok(CutoverResult::Stale(pointer.clone()));
        }
        let next = IndexPointer {
            index_id: new_index_id.to_string(),
            version: expected_version.map_or(1, |v| v + 1),
            updated_at: Utc::now(),
        };
        *pointer = Some(next.clone());
        Ok(CutoverResult::Applied(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReindexStatus;

    #[tokio::test]
    async fn second_trigger_returns_active_job() {
        let store = InMemoryStore::new();
        let first = ReindexJob::new("exec-1", None, Utc::now());
        assert!(store.create_reindex_job(&first).await.unwrap().created());

        let second = ReindexJob::new("exec-2", None, Utc::now());
        match store.create_reindex_job(&second).await.unwrap() {
            TriggerOutcome::Existing(job) => assert_eq!(job.execution_id, "exec-1"),
            other => panic!("expected existing job, got {:?}", other),
        }

        let mut done = first.clone();
        done.status = ReindexStatus::Completed;
        assert!(store.update_reindex_job(&done, first.updated_at).await.unwrap());
        assert!(store.create_reindex_job(&second).await.unwrap().created());
    }

    #[tokio::test]
    async fn stale_update_is_refused() {
        let store = InMemoryStore::new();
        let job = ReindexJob::new("exec-1", None, Utc::now());
        store.create_reindex_job(&job).await.unwrap();

        let mut ahead = job.clone();
        ahead.processed_count = 5;
        ahead.updated_at = job.updated_at + chrono::Duration::seconds(1);
        assert!(store.update_reindex_job(&ahead, job.updated_at).await.unwrap());

        let mut behind = job.clone();
        behind.processed_count = 2;
        assert!(!store.update_reindex_job(&behind, job.updated_at).await.unwrap());
        let stored = store.load_reindex_job("exec-1").await.unwrap().unwrap();
        assert_eq!(stored.processed_count, 5);
        let unknown = ReindexJob::new("nope", None, Utc::now());
        assert!(!store.update_reindex_job(&unknown, job.updated_at).await.unwrap());
    }

    #[tokio::test]
    async fn pointer_cas_rejects_stale_version() {
        let store = InMemoryStore::new();
        let first = match store.compare_and_swap(None, "idx-a").await.unwrap() {
            CutoverResult::Applied(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(first.version, 1);

        let stale = store.compare_and_swap(None, "idx-b").await.unwrap();
        assert!(matches!(stale, CutoverResult::Stale(Some(ref p)) if p.index_id == "idx-a"));

        let moved = store.compare_and_swap(Some(1), "idx-b").await.unwrap();
        assert!(matches!(moved, CutoverResult::Applied(ref p) if p.version == 2));
        assert_eq!(store.current().await.unwrap().unwrap().index_id, "idx-b");
    }

    #[tokio::test]
    async fn ledger_filters_by_start_time() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        let early = SyncJob {
            job_id: "job-1".into(),
            index_id: "kb".into(),
            status: SyncStatus::Complete,
            started_at: t0 - chrono::Duration::seconds(30),
        };
        let late = SyncJob {
            job_id: "job-2".into(),
            index_id: "kb".into(),
            status: SyncStatus::InProgress,
            started_at: t0,
        };
        store.record_sync_job(&early).await.unwrap();
        store.record_sync_job(&late).await.unwrap();
        store
            .update_sync_job("job-2", SyncStatus::Complete)
            .await
            .unwrap();

        let since = store.sync_jobs_since("kb", t0).await.unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].job_id, "job-2");
        assert_eq!(since[0].status, SyncStatus::Complete);
    }
}
