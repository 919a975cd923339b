//! Typed errors reported by external collaborators.

use thiserror::Error;

/// Failure reported by an [`IndexBackend`](crate::backend::IndexBackend)
/// or [`MetadataStore`](crate::backend::MetadataStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Another sync job is already running on this index.
    #[error("sync already in progress for index {index_id}")]
    Conflict { index_id: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure, throttling, or a 5xx from the backend.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Other(String),
}

impl BackendError {
    /// Whether repeating the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict { .. })
    }
}
