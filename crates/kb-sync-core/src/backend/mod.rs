//! External collaborator interfaces.
//!
//! The [`IndexBackend`] is the managed search/vector index: it owns sync
//! jobs and allows at most one running sync job per index. The
//! [`MetadataStore`] owns the catalogue of ingested items and their
//! metadata sidecars. kb-sync never reaches past these traits, so OCR,
//! embedding, and file parsing stay on the other side of them.
//!
//! Both traits are `Send + Sync` and async via `async-trait`.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`create_index`](IndexBackend::create_index) | Allocate a new empty index |
//! | [`delete_index`](IndexBackend::delete_index) | Drop an index and its content |
//! | [`start_sync`](IndexBackend::start_sync) | Start a sync job (conflicts if one is running) |
//! | [`list_active_sync_jobs`](IndexBackend::list_active_sync_jobs) | Jobs still `IN_PROGRESS` for an index |
//! | [`get_sync_status`](IndexBackend::get_sync_status) | Status of one job |
//! | [`retrieve`](IndexBackend::retrieve) | Query one index, optionally filtered |

pub mod memory;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::models::{ContentItem, RetrievedItem, SyncJob, SyncStatus};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A managed index that allows one active sync job per index.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Allocate a brand-new empty index and return its id.
    async fn create_index(&self) -> BackendResult<String>;

    async fn delete_index(&self, index_id: &str) -> BackendResult<()>;

    /// Start a sync job. Returns [`BackendError::Conflict`] when a job is
    /// already running on `index_id`.
    async fn start_sync(&self, index_id: &str) -> BackendResult<String>;

    async fn list_active_sync_jobs(&self, index_id: &str) -> BackendResult<Vec<SyncJob>>;

    async fn get_sync_status(&self, job_id: &str) -> BackendResult<SyncStatus>;

    /// Query `index_id`. Only content made searchable by a completed sync
    /// is returned.
    async fn retrieve(
        &self,
        index_id: &str,
        query: &str,
        filter: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<RetrievedItem>>;
}

/// Catalogue of ingested items and their metadata sidecars.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn count_items(&self) -> BackendResult<u64>;

    /// Items with `item_id > after`, in ascending `item_id` order.
    async fn list_items(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<ContentItem>>;

    /// Re-derive the metadata sidecar for one item.
    async fn derive_metadata(&self, item: &ContentItem) -> BackendResult<serde_json::Value>;

    /// Write a sidecar under `index_id`'s content namespace.
    async fn write_metadata(
        &self,
        index_id: &str,
        item_id: &str,
        metadata: &serde_json::Value,
    ) -> BackendResult<()>;
}
