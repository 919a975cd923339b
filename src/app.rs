//! Wiring shared by the CLI and the HTTP server.
//!
//! [`App`] owns the SQLite pool and the configured backend, and hands out
//! the queue, coordinator, worker, and orchestrator built on top of them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use kb_sync_core::backend::memory::{InMemoryBackend, InMemoryMetadataStore};
use kb_sync_core::backend::{IndexBackend, MetadataStore};
use kb_sync_core::store::PointerStore;

use crate::backend_http::HttpBackend;
use crate::config::Config;
use crate::coordinator::SyncCoordinator;
use crate::db;
use crate::queue::RequestQueue;
use crate::reindex::ReindexOrchestrator;
use crate::sqlite_store::SqliteStore;
use crate::worker::SyncWorker;

#[derive(Clone)]
pub struct App {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub backend: Arc<dyn IndexBackend>,
    pub metadata: Arc<dyn MetadataStore>,
    pub queue: RequestQueue,
    pub coordinator: SyncCoordinator,
}

impl App {
    /// Connect to the database and build the backend named by
    /// `backend.provider`.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        let store = SqliteStore::new(pool.clone());

        let (backend, metadata): (Arc<dyn IndexBackend>, Arc<dyn MetadataStore>) =
            match config.backend.provider.as_str() {
                "memory" => {
                    let backend = Arc::new(InMemoryBackend::new());
                    // The in-memory backend starts empty; make the served index exist.
                    if let Some(pointer) = store.current().await? {
                        backend.add_index(&pointer.index_id);
                    }
                    let metadata = Arc::new(InMemoryMetadataStore::with_backend(backend.clone()));
                    (backend, metadata)
                }
                "http" => {
                    let http = Arc::new(HttpBackend::new(&config.backend)?);
                    (http.clone(), http)
                }
                other => bail!("Unknown backend provider: {}", other),
            };

        Ok(Self::from_parts(config, pool, backend, metadata))
    }

    /// Assemble from an existing pool and backend (tests, embedding).
    pub fn from_parts(
        config: Config,
        pool: SqlitePool,
        backend: Arc<dyn IndexBackend>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let store = Arc::new(SqliteStore::new(pool.clone()));
        let queue = RequestQueue::new(pool, config.queue.clone());
        let coordinator = SyncCoordinator::new(
            backend.clone(),
            store.clone(),
            config.coordinator.clone(),
        );
        Self {
            config,
            store,
            backend,
            metadata,
            queue,
            coordinator,
        }
    }

    pub fn worker(&self) -> SyncWorker {
        SyncWorker::new(
            self.queue.clone(),
            self.coordinator.clone(),
            Duration::from_millis(self.config.queue.idle_poll_ms),
        )
    }

    pub fn orchestrator(&self) -> ReindexOrchestrator {
        ReindexOrchestrator::new(
            self.backend.clone(),
            self.metadata.clone(),
            self.store.clone(),
            self.store.clone(),
            self.coordinator.clone(),
            self.config.reindex.clone(),
        )
    }

    pub async fn close(&self) {
        self.store.pool().close().await;
    }
}
