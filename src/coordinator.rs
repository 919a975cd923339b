//! Sync coordinator: turns [`SyncRequest`]s into backend sync jobs without
//! ever overlapping two jobs on one index.
//!
//! # Handling one request
//!
//! 1. If a sync kb-sync started at or after `requested_at` has completed,
//!    the request is already satisfied and nothing is started.
//! 2. Otherwise wait until the index has no `IN_PROGRESS` job, polling with
//!    exponential backoff (`poll_initial_ms` doubling up to `poll_max_ms`).
//!    Waiting longer than `max_wait_secs` is a retryable failure.
//! 3. Check step 1 again (the job that was running may satisfy the request).
//! 4. Start a sync. A conflict on start is retried with jittered backoff up
//!    to `conflict_retries` times, then the request fails fatally.
//!
//! At most one `handle` call per index may run at once; the request queue
//! provides that by keeping one message per index in flight. Conflicts are
//! still handled for anything else that starts syncs on the backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;

use kb_sync_core::backend::IndexBackend;
use kb_sync_core::error::BackendError;
use kb_sync_core::models::{ErrorKind, SyncJob, SyncRequest, SyncStatus};
use kb_sync_core::store::JobStore;

use crate::config::CoordinatorConfig;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("index {index_id} still had an active sync after waiting {}s", .waited.as_secs())]
    WaitTimeout { index_id: String, waited: Duration },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("sync start on index {index_id} kept conflicting after {attempts} attempts")]
    ConflictExhausted { index_id: String, attempts: u32 },

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::WaitTimeout { .. } | SyncError::Store(_) => ErrorKind::Retryable,
            SyncError::Backend(e) if e.is_transient() => ErrorKind::Retryable,
            SyncError::Backend(_) | SyncError::ConflictExhausted { .. } => ErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Started { job_id: String },
    /// A completed sync already covers the request.
    AlreadySatisfied { job_id: String },
}

/// A sync job this process started.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedSync {
    pub job_id: String,
    /// Taken just before the start call, so never later than the real start.
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    backend: Arc<dyn IndexBackend>,
    store: Arc<dyn JobStore>,
    settings: CoordinatorConfig,
}

impl SyncCoordinator {
    pub fn new(
        backend: Arc<dyn IndexBackend>,
        store: Arc<dyn JobStore>,
        settings: CoordinatorConfig,
    ) -> Self {
        Self {
            backend,
            store,
            settings,
        }
    }

    pub async fn handle(&self, request: &SyncRequest) -> Result<SyncOutcome, SyncError> {
        let index_id = request.index_id.as_str();

        if let Some(job_id) = self.satisfied_by(request).await? {
            tracing::info!(index_id, job_id = %job_id, "sync request already satisfied");
            return Ok(SyncOutcome::AlreadySatisfied { job_id });
        }

        self.wait_until_idle(index_id).await?;
        // The job that was running may have covered the request.
        if let Some(job_id) = self.satisfied_by(request).await? {
            tracing::info!(index_id, job_id = %job_id, "sync request satisfied while waiting");
            return Ok(SyncOutcome::AlreadySatisfied { job_id });
        }

        let started = self.start_with_conflict_retry(index_id).await?;
        Ok(SyncOutcome::Started {
            job_id: started.job_id,
        })
    }

    /// A completed ledger job that started at or after `requested_at`.
    /// Non-terminal ledger entries are refreshed from the backend first.
    async fn satisfied_by(&self, request: &SyncRequest) -> Result<Option<String>, SyncError> {
        let jobs = self
            .store
            .sync_jobs_since(&request.index_id, request.requested_at)
            .await?;

        for job in jobs {
            let status = if job.status.is_terminal() {
                job.status
            } else {
                match self.backend.get_sync_status(&job.job_id).await {
                    Ok(status) => {
                        if status != job.status {
                            self.store.update_sync_job(&job.job_id, status).await?;
                        }
                        status
                    }
                    Err(BackendError::NotFound(_)) => {
                        self.store
                            .update_sync_job(&job.job_id, SyncStatus::Failed)
                            .await?;
                        SyncStatus::Failed
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            if status == SyncStatus::Complete {
                return Ok(Some(job.job_id));
            }
        }
        Ok(None)
    }

    /// Block until `index_id` has no running sync.
    async fn wait_until_idle(&self, index_id: &str) -> Result<(), SyncError> {
        let started = Instant::now();
        let deadline = started + self.settings.max_wait();
        let mut delay = self.settings.poll_initial();

        loop {
            let active = self.backend.list_active_sync_jobs(index_id).await?;
            if active.is_empty() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    index_id,
                    active = active.len(),
                    "gave up waiting for active sync"
                );
                return Err(SyncError::WaitTimeout {
                    index_id: index_id.to_string(),
                    waited: now - started,
                });
            }

            tracing::debug!(
                index_id,
                job_id = %active[0].job_id,
                delay_ms = delay.as_millis() as u64,
                "sync in progress, waiting"
            );
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.settings.poll_max());
        }
    }

    /// Start a sync on `index_id`, retrying conflicts with jittered
    /// exponential backoff. The job is recorded in the ledger.
    pub async fn start_with_conflict_retry(
        &self,
        index_id: &str,
    ) -> Result<StartedSync, SyncError> {
        let attempts = self.settings.conflict_retries + 1;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.conflict_backoff(attempt);
                tracing::debug!(
                    index_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "sync start conflicted, backing off"
                );
                tokio::time::sleep(delay).await;
            }

            let started_at = Utc::now();
            match self.backend.start_sync(index_id).await {
                Ok(job_id) => {
                    let job = SyncJob {
                        job_id: job_id.clone(),
                        index_id: index_id.to_string(),
                        status: SyncStatus::InProgress,
                        started_at,
                    };
                    self.store.record_sync_job(&job).await?;
                    tracing::info!(index_id, job_id = %job_id, "sync started");
                    return Ok(StartedSync { job_id, started_at });
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(index_id, attempts, "sync start conflict retries exhausted");
        Err(SyncError::ConflictExhausted {
            index_id: index_id.to_string(),
            attempts,
        })
    }

    /// Equal jitter: half the exponential step plus a random share of the other half.
    fn conflict_backoff(&self, attempt: u32) -> Duration {
        let step = self
            .settings
            .conflict_backoff_ms
            .saturating_mul(1u64 << (attempt - 1).min(10));
        let half = step / 2;
        let jitter = if half > 0 {
            rand::rng().random_range(0..=half)
        } else {
            0
        };
        Duration::from_millis(half + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_sync_core::backend::memory::InMemoryBackend;
    use kb_sync_core::store::memory::InMemoryStore;

    fn fast() -> CoordinatorConfig {
        CoordinatorConfig {
            poll_initial_ms: 1,
            poll_max_ms: 4,
            max_wait_secs: 5,
            conflict_retries: 3,
            conflict_backoff_ms: 2,
        }
    }

    fn setup(
        settings: CoordinatorConfig,
    ) -> (Arc<InMemoryBackend>, Arc<InMemoryStore>, SyncCoordinator) {
        let backend = Arc::new(InMemoryBackend::new());
        backend.add_index("kb");
        let store = Arc::new(InMemoryStore::new());
        let coordinator = SyncCoordinator::new(backend.clone(), store.clone(), settings);
        (backend, store, coordinator)
    }

    #[tokio::test]
    async fn idle_index_starts_immediately() {
        let (backend, store, coordinator) = setup(fast());
        let request = SyncRequest::now("kb");
        let outcome = coordinator.handle(&request).await.unwrap();
        let SyncOutcome::Started { job_id } = outcome else {
            panic!("expected a started job");
        };
        assert_eq!(backend.started_jobs().len(), 1);
        let ledger = store.sync_jobs_since("kb", request.requested_at).await.unwrap();
        assert_eq!(ledger[0].job_id, job_id);
    }

    #[tokio::test]
    async fn waits_for_running_job_then_starts_fresh() {
        let (backend, _store, coordinator) = setup(fast());
        backend.set_polls_to_complete(3);
        let foreign = backend.start_sync("kb").await.unwrap();

        let outcome = coordinator.handle(&SyncRequest::now("kb")).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Started { ref job_id } if *job_id != foreign));
        assert_eq!(backend.started_jobs().len(), 2);
        assert_eq!(backend.max_concurrent_in_progress(), 1);
    }

    #[tokio::test]
    async fn redelivered_request_is_idempotent() {
        let (backend, _store, coordinator) = setup(fast());
        let request = SyncRequest::now("kb");
        let first = coordinator.handle(&request).await.unwrap();
        let SyncOutcome::Started { job_id } = first else {
            panic!("expected a started job");
        };
        backend.finish_job(&job_id, SyncStatus::Complete);

        let again = coordinator.handle(&request).await.unwrap();
        assert_eq!(again, SyncOutcome::AlreadySatisfied { job_id });
        assert_eq!(backend.started_jobs().len(), 1);
    }

    #[tokio::test]
    async fn request_newer_than_last_sync_starts_another() {
        let (backend, _store, coordinator) = setup(fast());
        let SyncOutcome::Started { job_id } =
            coordinator.handle(&SyncRequest::now("kb")).await.unwrap()
        else {
            panic!("expected a started job");
        };
        backend.finish_job(&job_id, SyncStatus::Complete);

        tokio::time::sleep(Duration::from_millis(2)).await;
        let later = coordinator.handle(&SyncRequest::now("kb")).await.unwrap();
        assert!(matches!(later, SyncOutcome::Started { .. }));
        assert_eq!(backend.started_jobs().len(), 2);
    }

    #[tokio::test]
    async fn failed_sync_does_not_satisfy() {
        let (backend, _store, coordinator) = setup(fast());
        backend.fail_next_syncs(1);
        let request = SyncRequest::now("kb");
        let SyncOutcome::Started { job_id } = coordinator.handle(&request).await.unwrap() else {
            panic!("expected a started job");
        };
        backend.finish_job(&job_id, SyncStatus::Failed);

        let again = coordinator.handle(&request).await.unwrap();
        assert!(matches!(again, SyncOutcome::Started { job_id: ref j } if *j != job_id));
    }

    #[tokio::test]
    async fn running_job_started_after_request_satisfies_it() {
        let (backend, _store, coordinator) = setup(fast());
        backend.set_polls_to_complete(2);
        let request = SyncRequest::now("kb");
        coordinator.start_with_conflict_retry("kb").await.unwrap();

        let outcome = coordinator.handle(&request).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::AlreadySatisfied { .. }));
        assert_eq!(backend.started_jobs().len(), 1);
    }

    #[tokio::test]
    async fn conflicts_are_retried_then_fatal() {
        let (backend, _store, coordinator) = setup(fast());
        backend.inject_conflicts(2);
        let outcome = coordinator.handle(&SyncRequest::now("kb")).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Started { .. }));
        assert_eq!(backend.conflicts_returned(), 2);

        backend.inject_conflicts(10);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let err = coordinator
            .start_with_conflict_retry("kb")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConflictExhausted { attempts: 4, .. }));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn wait_bound_is_retryable() {
        let (backend, _store, coordinator) = setup(CoordinatorConfig {
            max_wait_secs: 0,
            ..fast()
        });
        backend.set_polls_to_complete(1000);
        backend.start_sync("kb").await.unwrap();

        let err = coordinator.handle(&SyncRequest::now("kb")).await.unwrap_err();
        assert!(matches!(err, SyncError::WaitTimeout { .. }));
        assert_eq!(err.kind(), ErrorKind::Retryable);
        assert_eq!(backend.started_jobs().len(), 1);
    }

    #[tokio::test]
    async fn unknown_index_is_fatal() {
        let (_backend, _store, coordinator) = setup(fast());
        let err = coordinator
            .handle(&SyncRequest::now("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Backend(BackendError::NotFound(_))));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn backoff_stays_within_step() {
        let (_b, _s, coordinator) = setup(CoordinatorConfig {
            conflict_backoff_ms: 100,
            ..fast()
        });
        for attempt in 1..5 {
            let step = 100u64 << (attempt - 1);
            let d = coordinator.conflict_backoff(attempt).as_millis() as u64;
            assert!(d >= step / 2 && d <= step, "attempt {}: {}", attempt, d);
        }
    }
}
