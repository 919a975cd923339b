//! Core data models shared by the coordinator, the reindex orchestrator,
//! and the retrieval path.
//!
//! These types represent the sync requests, backend sync jobs, reindex
//! jobs, and scored retrieval items that flow through kb-sync.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Boost applied to filtered slices when the configuration does not set one.
pub const DEFAULT_FILTERED_BOOST: f64 = 1.25;

/// A producer's request to make newly written content searchable.
///
/// Serialized on the queue as `{"index_id": "...", "requested_at": "<RFC 3339>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub index_id: String,
    pub requested_at: DateTime<Utc>,
}

impl SyncRequest {
    pub fn new(index_id: impl Into<String>, requested_at: DateTime<Utc>) -> Self {
        Self {
            index_id: index_id.into(),
            requested_at,
        }
    }

    pub fn now(index_id: impl Into<String>) -> Self {
        Self::new(index_id, Utc::now())
    }
}

/// Status of a backend sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    InProgress,
    Complete,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::InProgress => "IN_PROGRESS",
            SyncStatus::Complete => "COMPLETE",
            SyncStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatus::InProgress)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "IN_PROGRESS" => Ok(SyncStatus::InProgress),
            "COMPLETE" => Ok(SyncStatus::Complete),
            "FAILED" => Ok(SyncStatus::Failed),
            other => bail!("unknown sync status: '{}'", other),
        }
    }
}

/// A sync job as observed on the backend. Owned by the backend; kb-sync
/// only starts and observes these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub job_id: String,
    pub index_id: String,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
}

/// Reindex workflow state.
///
/// ```text
/// PENDING → CREATING_INDEX → PROCESSING → SYNCING → CUTOVER → DELETING_OLD_INDEX → COMPLETED
///    └──────────────┴─────────────┴───────────┴─────────┴──→ FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReindexStatus {
    Pending,
    CreatingIndex,
    Processing,
    Syncing,
    Cutover,
    DeletingOldIndex,
    Completed,
    Failed,
}

impl ReindexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReindexStatus::Pending => "PENDING",
            ReindexStatus::CreatingIndex => "CREATING_INDEX",
            ReindexStatus::Processing => "PROCESSING",
            ReindexStatus::Syncing => "SYNCING",
            ReindexStatus::Cutover => "CUTOVER",
            ReindexStatus::DeletingOldIndex => "DELETING_OLD_INDEX",
            ReindexStatus::Completed => "COMPLETED",
            ReindexStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReindexStatus::Completed | ReindexStatus::Failed)
    }

    /// True while queries must still be served from the old index.
    pub fn serves_old_index(&self) -> bool {
        matches!(
            self,
            ReindexStatus::Pending
                | ReindexStatus::CreatingIndex
                | ReindexStatus::Processing
                | ReindexStatus::Syncing
                | ReindexStatus::Cutover
                | ReindexStatus::Failed
        )
    }
}

impl fmt::Display for ReindexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReindexStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "PENDING" => ReindexStatus::Pending,
            "CREATING_INDEX" => ReindexStatus::CreatingIndex,
            "PROCESSING" => ReindexStatus::Processing,
            "SYNCING" => ReindexStatus::Syncing,
            "CUTOVER" => ReindexStatus::Cutover,
            "DELETING_OLD_INDEX" => ReindexStatus::DeletingOldIndex,
            "COMPLETED" => ReindexStatus::Completed,
            "FAILED" => ReindexStatus::Failed,
            other => bail!("unknown reindex status: '{}'", other),
        })
    }
}

/// Whether a caller should resubmit after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Retryable,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Retryable => "retryable",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "retryable" => Ok(ErrorKind::Retryable),
            "fatal" => Ok(ErrorKind::Fatal),
            other => bail!("unknown error kind: '{}'", other),
        }
    }
}

/// Durable state of one full rebuild. Persisted at every transition and
/// after every processed item, so a later invocation resumes from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexJob {
    pub execution_id: String,
    pub status: ReindexStatus,
    /// Index served to queries when the job was triggered.
    pub old_index_id: Option<String>,
    pub new_index_id: Option<String>,
    pub total_items: u64,
    /// Items attempted so far, successful or not.
    pub processed_count: u64,
    pub error_count: u64,
    pub error_messages: Vec<String>,
    /// Resume cursor: the last item id handled during PROCESSING.
    pub last_item_id: Option<String>,
    pub sync_job_id: Option<String>,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    /// Human-readable reason when the job is FAILED.
    pub failure: Option<String>,
    /// Set when the old index could not be deleted after cutover.
    pub cleanup_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReindexJob {
    pub fn new(
        execution_id: impl Into<String>,
        old_index_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            status: ReindexStatus::Pending,
            old_index_id,
            new_index_id: None,
            total_items: 0,
            processed_count: 0,
            error_count: 0,
            error_messages: Vec::new(),
            last_item_id: None,
            sync_job_id: None,
            sync_started_at: None,
            error_kind: None,
            failure: None,
            cleanup_error: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record a per-item failure. `error_count` always increments; at most
    /// `max_messages` messages are retained.
    pub fn record_item_error(&mut self, item_id: &str, message: &str, max_messages: usize) {
        self.error_count += 1;
        if self.error_messages.len() < max_messages {
            self.error_messages.push(format!("{}: {}", item_id, message));
        }
    }

    /// Items the ratio is taken over: the counted total, or the processed
    /// count when items were added after counting.
    pub fn failure_base(&self) -> u64 {
        self.total_items.max(self.processed_count)
    }

    /// Fraction of items that failed, `0.0` when there are none.
    pub fn failure_ratio(&self) -> f64 {
        match self.failure_base() {
            0 => 0.0,
            base => self.error_count as f64 / base as f64,
        }
    }

    /// One-line operator summary, counts only.
    pub fn summary(&self) -> String {
        let mut s = format!(
            "{} — processed {}/{} items, {} error{}",
            self.status,
            self.processed_count,
            self.total_items,
            self.error_count,
            if self.error_count == 1 { "" } else { "s" }
        );
        if let Some(ref failure) = self.failure {
            s.push_str(&format!(" — {}", failure));
        }
        if let Some(ref cleanup) = self.cleanup_error {
            s.push_str(&format!(" (old index not deleted: {})", cleanup));
        }
        s
    }
}

/// The "current index" reference read by every query path.
///
/// `version` increases by one on every cutover; writers must present the
/// version they read (compare-and-set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPointer {
    pub index_id: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// An item known to the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub item_id: String,
    pub content_type: String,
    pub source_uri: Option<String>,
    pub metadata: serde_json::Value,
}

/// One independently executed retrieval query whose results are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSlice {
    pub slice_id: String,
    pub filter_expression: Option<String>,
    /// Multiplier applied to raw scores; always `>= 1.0`.
    pub boost_factor: f64,
    /// Slots reserved for this slice's best items.
    pub min_guaranteed: usize,
}

impl RetrievalSlice {
    pub fn unfiltered(slice_id: impl Into<String>) -> Self {
        Self {
            slice_id: slice_id.into(),
            filter_expression: None,
            boost_factor: 1.0,
            min_guaranteed: 0,
        }
    }

    pub fn filtered(slice_id: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            slice_id: slice_id.into(),
            filter_expression: Some(filter.into()),
            boost_factor: DEFAULT_FILTERED_BOOST,
            min_guaranteed: 0,
        }
    }

    pub fn with_boost(mut self, boost_factor: f64) -> Self {
        self.boost_factor = boost_factor;
        self
    }

    pub fn with_min_guaranteed(mut self, min_guaranteed: usize) -> Self {
        self.min_guaranteed = min_guaranteed;
        self
    }
}

/// A raw hit as returned by [`IndexBackend::retrieve`](crate::backend::IndexBackend::retrieve).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub item_id: String,
    pub score: f64,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

/// A retrieval hit attributed to the slice that produced it. Per query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredItem {
    pub item_id: String,
    pub raw_score: f64,
    pub slice_id: String,
    pub content_type: String,
    pub metadata: serde_json::Value,
}

impl ScoredItem {
    pub fn from_retrieved(item: RetrievedItem, slice_id: &str) -> Self {
        Self {
            item_id: item.item_id,
            raw_score: item.score,
            slice_id: slice_id.to_string(),
            content_type: item.content_type,
            metadata: item.metadata,
        }
    }
}
