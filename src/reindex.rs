//! Resumable full-index rebuild.
//!
//! A [`ReindexJob`] is a persisted state object. [`ReindexOrchestrator::advance`]
//! loads it, runs as many stages as fit in one step budget, and saves it at
//! every transition (and after every processed item), so any later call,
//! in this process or another, picks up exactly where the last one stopped.
//!
//! ```text
//! PENDING ─▶ CREATING_INDEX ─▶ PROCESSING ─▶ SYNCING ─▶ CUTOVER ─▶ DELETING_OLD_INDEX ─▶ COMPLETED
//!                 │                 │            │          │
//!                 └─────────────────┴────────────┴──────────┴──▶ FAILED
//! ```
//!
//! | Stage | Work |
//! |-------|------|
//! | `CREATING_INDEX` | allocate the new index, count items |
//! | `PROCESSING` | re-derive and write every item's sidecar, cursor per item |
//! | `SYNCING` | start one sync on the new index, poll until it finishes |
//! | `CUTOVER` | compare-and-set the current-index pointer |
//! | `DELETING_OLD_INDEX` | best-effort delete of the previous index |
//!
//! Queries keep reading the old index until CUTOVER succeeds.
//!
//! Transient backend failures leave the job in its current stage and come
//! back as [`ReindexError::Interrupted`]; anything else marks the job
//! FAILED with `error_kind = fatal`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;

use kb_sync_core::backend::{IndexBackend, MetadataStore};
use kb_sync_core::error::BackendError;
use kb_sync_core::models::{ErrorKind, ReindexJob, ReindexStatus, SyncStatus};
use kb_sync_core::store::{CutoverResult, JobStore, PointerStore, TriggerOutcome};

use crate::config::ReindexConfig;
use crate::coordinator::{SyncCoordinator, SyncError};
use crate::progress::{NoProgress, ReindexProgressEvent, ReindexProgressReporter};

/// Consecutive interruptions [`ReindexOrchestrator::drive`] rides out
/// before handing the error back.
const MAX_CONSECUTIVE_INTERRUPTIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum ReindexError {
    #[error("no reindex job with execution id {0}")]
    UnknownJob(String),

    /// Transient failure; the job is unchanged and can be advanced again.
    #[error("reindex {execution_id} interrupted during {status}: {reason}")]
    Interrupted {
        execution_id: String,
        status: ReindexStatus,
        reason: String,
    },

    /// Another driver saved the job since this one loaded it. The job is
    /// left to that driver.
    #[error("reindex {0} is being advanced by another process")]
    Superseded(String),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl ReindexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReindexError::UnknownJob(_) => ErrorKind::Fatal,
            ReindexError::Interrupted { .. }
            | ReindexError::Superseded(_)
            | ReindexError::Store(_) => ErrorKind::Retryable,
        }
    }
}

/// Result of one [`ReindexOrchestrator::advance`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    pub job: ReindexJob,
    /// When to call `advance` again. `None` once the job is terminal;
    /// zero when the step budget ran out with work remaining.
    pub next_poll: Option<Duration>,
}

enum Step {
    Continue,
    Wait(Duration),
}

enum StepError {
    Interrupted(String),
    Fatal(String),
    Superseded,
    Store(anyhow::Error),
}

impl StepError {
    /// For errors raised while saving the job.
    fn into_reindex_error(self, execution_id: &str) -> ReindexError {
        match self {
            StepError::Superseded => ReindexError::Superseded(execution_id.to_string()),
            StepError::Store(e) => ReindexError::Store(e),
            StepError::Interrupted(reason) | StepError::Fatal(reason) => {
                ReindexError::Store(anyhow!(reason))
            }
        }
    }
}

impl From<BackendError> for StepError {
    fn from(e: BackendError) -> Self {
        if e.is_transient() {
            StepError::Interrupted(e.to_string())
        } else {
            StepError::Fatal(e.to_string())
        }
    }
}

impl From<anyhow::Error> for StepError {
    fn from(e: anyhow::Error) -> Self {
        StepError::Store(e)
    }
}

impl From<SyncError> for StepError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Store(inner) => StepError::Store(inner),
            other => match other.kind() {
                ErrorKind::Retryable => StepError::Interrupted(other.to_string()),
                ErrorKind::Fatal => StepError::Fatal(other.to_string()),
            },
        }
    }
}

pub struct ReindexOrchestrator {
    backend: Arc<dyn IndexBackend>,
    metadata: Arc<dyn MetadataStore>,
    jobs: Arc<dyn JobStore>,
    pointer: Arc<dyn PointerStore>,
    coordinator: SyncCoordinator,
    settings: ReindexConfig,
    progress: Arc<dyn ReindexProgressReporter>,
}

impl ReindexOrchestrator {
    pub fn new(
        backend: Arc<dyn IndexBackend>,
        metadata: Arc<dyn MetadataStore>,
        jobs: Arc<dyn JobStore>,
        pointer: Arc<dyn PointerStore>,
        coordinator: SyncCoordinator,
        settings: ReindexConfig,
    ) -> Self {
        Self {
            backend,
            metadata,
            jobs,
            pointer,
            coordinator,
            settings,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ReindexProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Create a PENDING job, or return the job already running.
    pub async fn trigger(&self) -> Result<TriggerOutcome, ReindexError> {
        let current = self.pointer.current().await?;
        let job = ReindexJob::new(
            uuid::Uuid::new_v4().to_string(),
            current.map(|p| p.index_id),
            Utc::now(),
        );
        let outcome = self.jobs.create_reindex_job(&job).await?;
        match &outcome {
            TriggerOutcome::Created(job) => tracing::info!(
                execution_id = %job.execution_id,
                old_index_id = ?job.old_index_id,
                "reindex triggered"
            ),
            TriggerOutcome::Existing(job) => tracing::info!(
                execution_id = %job.execution_id,
                status = %job.status,
                "reindex already running"
            ),
        }
        Ok(outcome)
    }

    pub async fn status(&self, execution_id: &str) -> Result<ReindexJob, ReindexError> {
        self.jobs
            .load_reindex_job(execution_id)
            .await?
            .ok_or_else(|| ReindexError::UnknownJob(execution_id.to_string()))
    }

    /// Run stages until the job is terminal, has to wait for the sync, or
    /// the step budget is used up.
    pub async fn advance(&self, execution_id: &str) -> Result<Advance, ReindexError> {
        let mut job = self.status(execution_id).await?;
        let deadline = Instant::now() + Duration::from_secs(self.settings.step_budget_secs);
        let mut steps = 0u32;

        loop {
            if job.is_terminal() {
                return Ok(Advance {
                    job,
                    next_poll: None,
                });
            }
            // Every invocation runs at least one step, whatever the budget.
            if steps > 0 && Instant::now() >= deadline {
                return Ok(Advance {
                    job,
                    next_poll: Some(Duration::ZERO),
                });
            }

            let step = match job.status {
                ReindexStatus::Pending => self.begin(&mut job).await,
                ReindexStatus::CreatingIndex => self.create_index(&mut job).await,
                ReindexStatus::Processing => self.process_items(&mut job, deadline).await,
                ReindexStatus::Syncing => self.sync_new_index(&mut job).await,
                ReindexStatus::Cutover => self.cutover(&mut job).await,
                ReindexStatus::DeletingOldIndex => self.delete_old_index(&mut job).await,
                ReindexStatus::Completed | ReindexStatus::Failed => Ok(Step::Continue),
            };
            steps += 1;

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Wait(delay)) => {
                    return Ok(Advance {
                        job,
                        next_poll: Some(delay),
                    })
                }
                Err(StepError::Interrupted(reason)) => {
                    tracing::warn!(
                        execution_id,
                        status = %job.status,
                        reason = %reason,
                        "reindex interrupted; will resume"
                    );
                    job.error_kind = Some(ErrorKind::Retryable);
                    self.persist(&mut job)
                        .await
                        .map_err(|e| e.into_reindex_error(execution_id))?;
                    return Err(ReindexError::Interrupted {
                        execution_id: execution_id.to_string(),
                        status: job.status,
                        reason,
                    });
                }
                Err(StepError::Fatal(reason)) => {
                    self.fail(&mut job, reason)
                        .await
                        .map_err(|e| e.into_reindex_error(execution_id))?;
                }
                Err(e) => return Err(e.into_reindex_error(execution_id)),
            }
        }
    }

    /// Advance until terminal, sleeping between polls. Transient
    /// interruptions are retried after `sync_poll_secs`.
    pub async fn drive(&self, execution_id: &str) -> Result<ReindexJob, ReindexError> {
        let mut interruptions = 0;
        loop {
            match self.advance(execution_id).await {
                Ok(Advance {
                    job,
                    next_poll: None,
                }) => return Ok(job),
                Ok(Advance {
                    next_poll: Some(delay),
                    ..
                }) => {
                    interruptions = 0;
                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e @ ReindexError::Interrupted { .. }) => {
                    interruptions += 1;
                    if interruptions >= MAX_CONSECUTIVE_INTERRUPTIONS {
                        return Err(e);
                    }
                    tokio::time::sleep(self.sync_poll()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn sync_poll(&self) -> Duration {
        Duration::from_secs(self.settings.sync_poll_secs)
    }

    /// Save `job` unless someone else saved it since it was loaded.
    async fn persist(&self, job: &mut ReindexJob) -> Result<(), StepError> {
        let expected = job.updated_at;
        job.updated_at = Utc::now();
        if self.jobs.update_reindex_job(job, expected).await? {
            Ok(())
        } else {
            tracing::warn!(
                execution_id = %job.execution_id,
                "reindex job was saved by another process; stepping aside"
            );
            Err(StepError::Superseded)
        }
    }

    async fn transition(&self, job: &mut ReindexJob, status: ReindexStatus) -> Result<(), StepError> {
        job.status = status;
        job.error_kind = None;
        self.persist(job).await?;
        tracing::info!(execution_id = %job.execution_id, status = %status, "reindex stage");
        if job.is_terminal() {
            self.progress.report(ReindexProgressEvent::Finished {
                execution_id: job.execution_id.clone(),
                status,
                summary: job.summary(),
            });
        } else {
            self.progress.report(ReindexProgressEvent::Stage {
                execution_id: job.execution_id.clone(),
                status,
            });
        }
        Ok(())
    }

    async fn fail(&self, job: &mut ReindexJob, reason: String) -> Result<(), StepError> {
        tracing::error!(
            execution_id = %job.execution_id,
            status = %job.status,
            reason = %reason,
            "reindex failed"
        );
        job.failure = Some(reason);
        job.status = ReindexStatus::Failed;
        job.error_kind = Some(ErrorKind::Fatal);
        self.persist(job).await?;
        self.progress.report(ReindexProgressEvent::Finished {
            execution_id: job.execution_id.clone(),
            status: job.status,
            summary: job.summary(),
        });
        Ok(())
    }

    async fn begin(&self, job: &mut ReindexJob) -> Result<Step, StepError> {
        self.transition(job, ReindexStatus::CreatingIndex).await?;
        Ok(Step::Continue)
    }

    async fn create_index(&self, job: &mut ReindexJob) -> Result<Step, StepError> {
        if job.new_index_id.is_none() {
            // A crash between create_index and the save below leaves an
            // unreferenced index behind; the next attempt allocates another.
            let index_id = self.backend.create_index().await?;
            tracing::info!(execution_id = %job.execution_id, index_id = %index_id, "new index created");
            job.new_index_id = Some(index_id);
        }
        job.total_items = self.metadata.count_items().await?;
        job.processed_count = 0;
        job.last_item_id = None;
        self.transition(job, ReindexStatus::Processing).await?;
        Ok(Step::Continue)
    }

    async fn process_items(&self, job: &mut ReindexJob, deadline: Instant) -> Result<Step, StepError> {
        let new_index_id = job
            .new_index_id
            .clone()
            .ok_or_else(|| StepError::Fatal("PROCESSING without a new index".to_string()))?;

        loop {
            let page = self
                .metadata
                .list_items(job.last_item_id.as_deref(), self.settings.page_size)
                .await?;
            if page.is_empty() {
                break;
            }

            for item in page {
                let refreshed = match self.metadata.derive_metadata(&item).await {
                    Ok(metadata) => {
                        self.metadata
                            .write_metadata(&new_index_id, &item.item_id, &metadata)
                            .await
                    }
                    Err(e) => Err(e),
                };
                match refreshed {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => return Err(StepError::Interrupted(e.to_string())),
                    Err(e) => {
                        tracing::warn!(
                            execution_id = %job.execution_id,
                            item_id = %item.item_id,
                            error = %e,
                            "metadata refresh failed"
                        );
                        job.record_item_error(
                            &item.item_id,
                            &e.to_string(),
                            self.settings.max_error_messages,
                        );
                    }
                }

                job.processed_count += 1;
                job.last_item_id = Some(item.item_id);
                self.persist(job).await?;
                self.progress.report(ReindexProgressEvent::Items {
                    execution_id: job.execution_id.clone(),
                    n: job.processed_count,
                    total: job.total_items,
                    errors: job.error_count,
                });
                // The item above is checkpointed, so stopping here loses nothing.
                if Instant::now() >= deadline {
                    return Ok(Step::Continue);
                }
            }
        }

        if let Some(reason) = self.threshold_exceeded(job) {
            return Err(StepError::Fatal(reason));
        }
        self.transition(job, ReindexStatus::Syncing).await?;
        Ok(Step::Continue)
    }

    /// With `max_failure_ratio` set, fail above it; otherwise fail only
    /// when every processed item failed.
    fn threshold_exceeded(&self, job: &ReindexJob) -> Option<String> {
        if job.error_count == 0 {
            return None;
        }
        let ratio = job.failure_ratio();
        match self.settings.max_failure_ratio {
            Some(max) if ratio > max => Some(format!(
                "{} of {} items failed ({:.1}% > {:.1}% allowed)",
                job.error_count,
                job.failure_base(),
                ratio * 100.0,
                max * 100.0
            )),
            None if job.error_count >= job.processed_count => {
                Some(format!("all {} items failed", job.error_count))
            }
            _ => None,
        }
    }

    async fn sync_new_index(&self, job: &mut ReindexJob) -> Result<Step, StepError> {
        let new_index_id = job
            .new_index_id
            .clone()
            .ok_or_else(|| StepError::Fatal("SYNCING without a new index".to_string()))?;

        if job.sync_job_id.is_none() {
            // A previous call may have started the sync and stopped before
            // saving its id; the ledger remembers it.
            let recorded = self
                .jobs
                .sync_jobs_since(&new_index_id, job.started_at)
                .await?
                .pop();
            let (sync_job_id, started_at) = match recorded {
                Some(found) => (found.job_id, found.started_at),
                None => {
                    let started = self
                        .coordinator
                        .start_with_conflict_retry(&new_index_id)
                        .await?;
                    (started.job_id, started.started_at)
                }
            };
            job.sync_job_id = Some(sync_job_id);
            job.sync_started_at = Some(started_at);
            self.persist(job).await?;
        }

        let sync_job_id = job
            .sync_job_id
            .clone()
            .ok_or_else(|| StepError::Store(anyhow!("sync job id missing after start")))?;
        let status = self.backend.get_sync_status(&sync_job_id).await?;
        self.jobs.update_sync_job(&sync_job_id, status).await?;

        match status {
            SyncStatus::Complete => {
                self.transition(job, ReindexStatus::Cutover).await?;
                Ok(Step::Continue)
            }
            SyncStatus::Failed => Err(StepError::Fatal(format!(
                "sync {} of new index {} failed",
                sync_job_id, new_index_id
            ))),
            SyncStatus::InProgress => {
                let started = job.sync_started_at.unwrap_or(job.updated_at);
                let elapsed = (Utc::now() - started).num_seconds().max(0) as u64;
                if elapsed > self.settings.sync_timeout_secs {
                    return Err(StepError::Fatal(format!(
                        "sync {} still running after {}s",
                        sync_job_id, elapsed
                    )));
                }
                Ok(Step::Wait(self.sync_poll()))
            }
        }
    }

    async fn cutover(&self, job: &mut ReindexJob) -> Result<Step, StepError> {
        let new_index_id = job
            .new_index_id
            .clone()
            .ok_or_else(|| StepError::Fatal("CUTOVER without a new index".to_string()))?;
        let current = self.pointer.current().await?;

        let serving = current.as_ref().map(|p| p.index_id.as_str());
        if serving != Some(new_index_id.as_str()) {
            if serving != job.old_index_id.as_deref() {
                return Err(StepError::Fatal(format!(
                    "current index moved to {} during reindex",
                    serving.unwrap_or("<none>")
                )));
            }
            let expected = current.as_ref().map(|p| p.version);
            match self.pointer.compare_and_swap(expected, &new_index_id).await? {
                CutoverResult::Applied(pointer) => tracing::info!(
                    execution_id = %job.execution_id,
                    index_id = %pointer.index_id,
                    version = pointer.version,
                    "current index switched"
                ),
                CutoverResult::Stale(Some(p)) if p.index_id == new_index_id => {}
                CutoverResult::Stale(other) => {
                    return Err(StepError::Fatal(format!(
                        "current index changed concurrently (now {})",
                        other.map_or_else(|| "<none>".to_string(), |p| p.index_id)
                    )))
                }
            }
        }

        self.transition(job, ReindexStatus::DeletingOldIndex).await?;
        Ok(Step::Continue)
    }

    async fn delete_old_index(&self, job: &mut ReindexJob) -> Result<Step, StepError> {
        if let Some(old) = job.old_index_id.clone() {
            match self.backend.delete_index(&old).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(
                        execution_id = %job.execution_id,
                        index_id = %old,
                        error = %e,
                        "old index not deleted"
                    );
                    job.cleanup_error = Some(e.to_string());
                }
            }
        }
        self.transition(job, ReindexStatus::Completed).await?;
        Ok(Step::Continue)
    }
}
