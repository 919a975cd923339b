//! Sequential consumer that feeds queued sync requests to the coordinator.
//!
//! | Coordinator result | Queue action |
//! |--------------------|--------------|
//! | `Ok(_)` | `ack` |
//! | retryable error | `retry_later` (dead-lettered once deliveries run out) |
//! | fatal error | `dead_letter` |

use anyhow::Result;
use std::future::Future;
use std::time::Duration;

use kb_sync_core::models::ErrorKind;

use crate::coordinator::{SyncCoordinator, SyncOutcome};
use crate::queue::{RequestQueue, RetryDisposition};

/// What one [`SyncWorker::run_once`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStep {
    /// Nothing was deliverable.
    Idle,
    Handled {
        message_id: i64,
        outcome: SyncOutcome,
    },
    Retrying {
        message_id: i64,
        error: String,
    },
    DeadLettered {
        message_id: i64,
        error: String,
    },
}

pub struct SyncWorker {
    queue: RequestQueue,
    coordinator: SyncCoordinator,
    idle_poll: Duration,
}

impl SyncWorker {
    pub fn new(queue: RequestQueue, coordinator: SyncCoordinator, idle_poll: Duration) -> Self {
        Self {
            queue,
            coordinator,
            idle_poll,
        }
    }

    /// Receive and process at most one message.
    pub async fn run_once(&self) -> Result<WorkerStep> {
        let Some(delivery) = self.queue.receive().await? else {
            return Ok(WorkerStep::Idle);
        };
        let message_id = delivery.message_id;
        tracing::debug!(
            message_id,
            index_id = %delivery.request.index_id,
            delivery = delivery.deliveries,
            "processing sync request"
        );

        match self.coordinator.handle(&delivery.request).await {
            Ok(outcome) => {
                self.queue.ack(message_id).await?;
                Ok(WorkerStep::Handled {
                    message_id,
                    outcome,
                })
            }
            Err(e) => {
                let error = e.to_string();
                match e.kind() {
                    ErrorKind::Retryable => {
                        tracing::warn!(message_id, error = %error, "sync request will be retried");
                        match self.queue.retry_later(message_id, &error).await? {
                            RetryDisposition::Scheduled => {
                                Ok(WorkerStep::Retrying { message_id, error })
                            }
                            RetryDisposition::DeadLettered => {
                                Ok(WorkerStep::DeadLettered { message_id, error })
                            }
                        }
                    }
                    ErrorKind::Fatal => {
                        self.queue.dead_letter(message_id, &error).await?;
                        Ok(WorkerStep::DeadLettered { message_id, error })
                    }
                }
            }
        }
    }

    /// Process until the queue is empty. Returns the number of messages handled.
    pub async fn drain(&self) -> Result<usize> {
        let mut handled = 0;
        while self.run_once().await? != WorkerStep::Idle {
            handled += 1;
        }
        Ok(handled)
    }

    /// Process messages until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!("sync worker started");
        loop {
            // A step cut short by shutdown leaves its message leased; it is
            // redelivered when the lease expires.
            let step = tokio::select! {
                _ = &mut shutdown => break,
                step = self.run_once() => step,
            };
            match step {
                Ok(WorkerStep::Idle) => {
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.idle_poll) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    // Store trouble; back off and keep going.
                    tracing::error!(error = %format!("{:#}", e), "sync worker step failed");
                    tokio::time::sleep(self.idle_poll).await;
                }
            }
        }
        tracing::info!("sync worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, CoordinatorConfig, QueueConfig};
    use crate::{db, migrate};
    use kb_sync_core::backend::memory::InMemoryBackend;
    use kb_sync_core::backend::IndexBackend;
    use kb_sync_core::models::SyncRequest;
    use kb_sync_core::store::memory::InMemoryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn worker(
        queue_settings: QueueConfig,
    ) -> (TempDir, Arc<InMemoryBackend>, RequestQueue, SyncWorker) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("kb.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::migrate(&pool).await.unwrap();

        let backend = Arc::new(InMemoryBackend::new());
        backend.add_index("kb");
        let coordinator = SyncCoordinator::new(
            backend.clone(),
            Arc::new(InMemoryStore::new()),
            CoordinatorConfig {
                poll_initial_ms: 1,
                poll_max_ms: 2,
                max_wait_secs: 0,
                conflict_retries: 1,
                conflict_backoff_ms: 1,
            },
        );
        let queue = RequestQueue::new(pool, queue_settings);
        let worker = SyncWorker::new(queue.clone(), coordinator, Duration::from_millis(1));
        (tmp, backend, queue, worker)
    }

    fn settings() -> QueueConfig {
        QueueConfig {
            redeliver_delay_secs: 0,
            max_deliveries: 2,
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn success_is_acked() {
        let (_tmp, backend, queue, worker) = worker(settings()).await;
        queue.enqueue(&SyncRequest::now("kb")).await.unwrap();

        let step = worker.run_once().await.unwrap();
        assert!(matches!(
            step,
            WorkerStep::Handled {
                outcome: SyncOutcome::Started { .. },
                ..
            }
        ));
        assert_eq!(backend.started_jobs().len(), 1);
        assert_eq!(worker.run_once().await.unwrap(), WorkerStep::Idle);
        assert_eq!(queue.depth().await.unwrap(), Default::default());
    }

    #[tokio::test]
    async fn timeout_is_retried_then_dead_lettered() {
        let (_tmp, backend, queue, worker) = worker(settings()).await;
        backend.set_polls_to_complete(1000);
        backend.start_sync("kb").await.unwrap();
        queue.enqueue(&SyncRequest::now("kb")).await.unwrap();

        assert!(matches!(worker.run_once().await.unwrap(), WorkerStep::Retrying { .. }));
        assert!(matches!(worker.run_once().await.unwrap(), WorkerStep::DeadLettered { .. }));
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fatal_error_goes_straight_to_dead_letter() {
        let (_tmp, backend, queue, worker) = worker(settings()).await;
        queue.enqueue(&SyncRequest::now("no-such-index")).await.unwrap();

        let step = worker.run_once().await.unwrap();
        assert!(
            matches!(step, WorkerStep::DeadLettered { ref error, .. } if error.contains("no-such-index"))
        );
        assert!(backend.started_jobs().is_empty());
        assert_eq!(queue.depth().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_tmp, backend, queue, worker) = worker(settings()).await;
        queue.enqueue(&SyncRequest::now("kb")).await.unwrap();
        worker
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(backend.started_jobs().len(), 1);
    }
}
