//! In-memory [`IndexBackend`] and [`MetadataStore`] for tests and local runs.
//!
//! Sync jobs advance when they are observed: every `list_active_sync_jobs`
//! or `get_sync_status` call counts as one poll, and a job completes after
//! `polls_to_complete` polls. A sync makes searchable exactly the content
//! that was staged when it started.
//!
//! Failure knobs (`inject_conflicts`, `fail_next_syncs`, `fail_item`, ...)
//! let tests drive the error paths deterministically.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::BackendError;
use crate::models::{ContentItem, RetrievedItem, SyncJob, SyncStatus};

use super::{BackendResult, IndexBackend, MetadataStore};

#[derive(Debug, Clone)]
struct StoredDoc {
    content_type: String,
    text: String,
    metadata: Value,
}

#[derive(Default)]
struct IndexState {
    staged: BTreeMap<String, StoredDoc>,
    searchable: BTreeMap<String, StoredDoc>,
}

struct JobState {
    job: SyncJob,
    polls_left: u32,
    fail: bool,
    snapshot: BTreeMap<String, StoredDoc>,
}

struct BackendState {
    next_id: u64,
    indexes: HashMap<String, IndexState>,
    jobs: HashMap<String, JobState>,
    started: Vec<String>,
    polls_to_complete: u32,
    enforce_single_job: bool,
    queued_conflicts: u32,
    failing_syncs: u32,
    failing_deletes: u32,
    failing_filters: HashSet<String>,
    conflicts_returned: u32,
    max_in_progress: usize,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            next_id: 1,
            indexes: HashMap::new(),
            jobs: HashMap::new(),
            started: Vec::new(),
            polls_to_complete: 1,
            enforce_single_job: true,
            queued_conflicts: 0,
            failing_syncs: 0,
            failing_deletes: 0,
            failing_filters: HashSet::new(),
            conflicts_returned: 0,
            max_in_progress: 0,
        }
    }
}

impl BackendState {
    fn next(&mut self, prefix: &str) -> String {
        let id = format!("{}-{}", prefix, self.next_id);
        self.next_id += 1;
        id
    }

    fn in_progress(&self, index_id: &str) -> usize {
        self.jobs
            .values()
            .filter(|j| j.job.index_id == index_id && j.job.status == SyncStatus::InProgress)
            .count()
    }

    /// Count one observation of every running job on `index_id`.
    fn poll_index(&mut self, index_id: &str) {
        let ids: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, j)| j.job.index_id == index_id && j.job.status == SyncStatus::InProgress)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.poll_job(&id);
        }
    }

    fn poll_job(&mut self, job_id: &str) {
        let finished = match self.jobs.get_mut(job_id) {
            Some(js) if js.job.status == SyncStatus::InProgress => {
                js.polls_left = js.polls_left.saturating_sub(1);
                js.polls_left == 0
            }
            _ => false,
        };
        if finished {
            self.finish(job_id);
        }
    }

    fn finish(&mut self, job_id: &str) {
        let Some(js) = self.jobs.get_mut(job_id) else {
            return;
        };
        if js.fail {
            js.job.status = SyncStatus::Failed;
            return;
        }
        js.job.status = SyncStatus::Complete;
        let snapshot = std::mem::take(&mut js.snapshot);
        let index_id = js.job.index_id.clone();
        if let Some(index) = self.indexes.get_mut(&index_id) {
            index.searchable = snapshot;
        }
    }
}

/// In-memory managed index.
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an empty index under a caller-chosen id.
    pub fn add_index(&self, index_id: &str) {
        self.state()
            .indexes
            .entry(index_id.to_string())
            .or_default();
    }

    pub fn has_index(&self, index_id: &str) -> bool {
        self.state().indexes.contains_key(index_id)
    }

    /// Stage a document; it becomes searchable after the next completed sync.
    pub fn put_document(
        &self,
        index_id: &str,
        item_id: &str,
        content_type: &str,
        text: &str,
        metadata: Value,
    ) {
        self.state()
            .indexes
            .entry(index_id.to_string())
            .or_default()
            .staged
            .insert(
                item_id.to_string(),
                StoredDoc {
                    content_type: content_type.to_string(),
                    text: text.to_string(),
                    metadata,
                },
            );
    }

    /// Number of polls a job needs before it leaves `IN_PROGRESS` (minimum 1).
    pub fn set_polls_to_complete(&self, polls: u32) {
        self.state().polls_to_complete = polls.max(1);
    }

    /// Stop rejecting overlapping syncs, so callers' own discipline can be measured.
    pub fn allow_overlapping_syncs(&self) {
        self.state().enforce_single_job = false;
    }

    /// The next `n` `start_sync` calls report a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.state().queued_conflicts = n;
    }

    /// The next `n` started jobs end in `FAILED`.
    pub fn fail_next_syncs(&self, n: u32) {
        self.state().failing_syncs = n;
    }

    /// The next `n` `delete_index` calls fail.
    pub fn fail_next_deletes(&self, n: u32) {
        self.state().failing_deletes = n;
    }

    /// `retrieve` with this filter expression reports the backend unavailable.
    pub fn fail_retrieval_for(&self, filter: &str) {
        self.state().failing_filters.insert(filter.to_string());
    }

    /// Force a running job to a terminal status.
    pub fn finish_job(&self, job_id: &str, status: SyncStatus) {
        let mut state = self.state();
        if let Some(js) = state.jobs.get_mut(job_id) {
            js.fail = status == SyncStatus::Failed;
            js.polls_left = 0;
        }
        state.finish(job_id);
    }

    /// Every job started so far, in start order, with its current status.
    pub fn started_jobs(&self) -> Vec<SyncJob> {
        let state = self.state();
        state
            .started
            .iter()
            .filter_map(|id| state.jobs.get(id).map(|js| js.job.clone()))
            .collect()
    }

    /// Highest number of simultaneously running jobs seen on any one index.
    pub fn max_concurrent_in_progress(&self) -> usize {
        self.state().max_in_progress
    }

    pub fn conflicts_returned(&self) -> u32 {
        self.state().conflicts_returned
    }

    /// Copy a sidecar into the staged content of `index_id`.
    pub fn stage_metadata(&self, index_id: &str, item_id: &str, metadata: &Value) -> BackendResult<()> {
        let mut state = self.state();
        let index = state
            .indexes
            .get_mut(index_id)
            .ok_or_else(|| BackendError::NotFound(format!("index {}", index_id)))?;
        let content_type = metadata
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("text/plain")
            .to_string();
        let text = metadata
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        index.staged.insert(
            item_id.to_string(),
            StoredDoc {
                content_type,
                text,
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the `field = 'value'` filter subset understood by the in-memory backend.
fn parse_filter(filter: &str) -> BackendResult<(String, String)> {
    let (field, value) = filter
        .split_once('=')
        .ok_or_else(|| BackendError::Other(format!("unsupported filter: {}", filter)))?;
    let field = field.trim();
    let value = value.trim().trim_matches('\'').trim_matches('"');
    if field.is_empty() {
        return Err(BackendError::Other(format!("unsupported filter: {}", filter)));
    }
    Ok((field.to_string(), value.to_string()))
}

fn matches_filter(doc: &StoredDoc, field: &str, value: &str) -> bool {
    if field == "content_type" {
        return doc.content_type == value;
    }
    match doc.metadata.get(field) {
        Some(Value::String(s)) => s == value,
        Some(Value::Array(values)) => values.iter().any(|v| v.as_str() == Some(value)),
        Some(other) => other.to_string() == value,
        None => false,
    }
}

#[async_trait]
impl IndexBackend for InMemoryBackend {
    async fn create_index(&self) -> BackendResult<String> {
        let mut state = self.state();
        let id = state.next("idx");
        state.indexes.insert(id.clone(), IndexState::default());
        Ok(id)
    }

    async fn delete_index(&self, index_id: &str) -> BackendResult<()> {
        let mut state = self.state();
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(BackendError::Unavailable(format!(
                "could not delete index {}",
                index_id
            )));
        }
        state
            .indexes
            .remove(index_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("index {}", index_id)))
    }

    async fn start_sync(&self, index_id: &str) -> BackendResult<String> {
        let mut state = self.state();
        if !state.indexes.contains_key(index_id) {
            return Err(BackendError::NotFound(format!("index {}", index_id)));
        }
        if state.queued_conflicts > 0 {
            state.queued_conflicts -= 1;
            state.conflicts_returned += 1;
            return Err(BackendError::Conflict {
                index_id: index_id.to_string(),
            });
        }
        if state.enforce_single_job && state.in_progress(index_id) > 0 {
            state.conflicts_returned += 1;
            return Err(BackendError::Conflict {
                index_id: index_id.to_string(),
            });
        }

        let job_id = state.next("job");
        let fail = if state.failing_syncs > 0 {
            state.failing_syncs -= 1;
            true
        } else {
            false
        };
        let snapshot = state
            .indexes
            .get(index_id)
            .map(|i| i.staged.clone())
            .unwrap_or_default();
        let polls_left = state.polls_to_complete;
        state.jobs.insert(
            job_id.clone(),
            JobState {
                job: SyncJob {
                    job_id: job_id.clone(),
                    index_id: index_id.to_string(),
                    status: SyncStatus::InProgress,
                    started_at: Utc::now(),
                },
                polls_left,
                fail,
                snapshot,
            },
        );
        state.started.push(job_id.clone());
        let running = state.in_progress(index_id);
        state.max_in_progress = state.max_in_progress.max(running);
        Ok(job_id)
    }

    async fn list_active_sync_jobs(&self, index_id: &str) -> BackendResult<Vec<SyncJob>> {
        let mut state = self.state();
        state.poll_index(index_id);
        let mut active: Vec<SyncJob> = state
            .jobs
            .values()
            .filter(|j| j.job.index_id == index_id && j.job.status == SyncStatus::InProgress)
            .map(|j| j.job.clone())
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(active)
    }

    async fn get_sync_status(&self, job_id: &str) -> BackendResult<SyncStatus> {
        let mut state = self.state();
        if !state.jobs.contains_key(job_id) {
            return Err(BackendError::NotFound(format!("sync job {}", job_id)));
        }
        state.poll_job(job_id);
        Ok(state.jobs[job_id].job.status)
    }

    async fn retrieve(
        &self,
        index_id: &str,
        query: &str,
        filter: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<RetrievedItem>> {
        let state = self.state();
        if let Some(f) = filter {
            if state.failing_filters.contains(f) {
                return Err(BackendError::Unavailable(format!("retrieval failed for {}", f)));
            }
        }
        let index = state
            .indexes
            .get(index_id)
            .ok_or_else(|| BackendError::NotFound(format!("index {}", index_id)))?;
        let parsed = filter.map(parse_filter).transpose()?;

        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<RetrievedItem> = index
            .searchable
            .iter()
            .filter(|(_, doc)| match &parsed {
                Some((field, value)) => matches_filter(doc, field, value),
                None => true,
            })
            .filter_map(|(item_id, doc)| {
                let haystack = format!("{} {}", doc.text, doc.metadata).to_lowercase();
                let matched = terms.iter().filter(|t| haystack.contains(*t)).count();
                (matched > 0).then(|| RetrievedItem {
                    item_id: item_id.clone(),
                    score: matched as f64 / terms.len() as f64,
                    content_type: doc.content_type.clone(),
                    metadata: doc.metadata.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[derive(Default)]
struct MetadataState {
    items: BTreeMap<String, ContentItem>,
    failing_items: BTreeSet<String>,
    derive_calls: Vec<String>,
    written: HashMap<(String, String), Value>,
    writes: u64,
    interrupt_at: Option<u64>,
}

/// In-memory item catalogue. Optionally forwards written sidecars into an
/// [`InMemoryBackend`] so a rebuilt index becomes searchable after sync.
pub struct InMemoryMetadataStore {
    state: Mutex<MetadataState>,
    backend: Option<Arc<InMemoryBackend>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MetadataState::default()),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<InMemoryBackend>) -> Self {
        Self {
            state: Mutex::new(MetadataState::default()),
            backend: Some(backend),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetadataState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_item(&self, item_id: &str, content_type: &str, text: &str) {
        self.state().items.insert(
            item_id.to_string(),
            ContentItem {
                item_id: item_id.to_string(),
                content_type: content_type.to_string(),
                source_uri: None,
                metadata: json!({ "text": text }),
            },
        );
    }

    /// `derive_metadata` fails permanently for this item.
    pub fn fail_item(&self, item_id: &str) {
        self.state().failing_items.insert(item_id.to_string());
    }

    /// The write that would bring the total to `n + 1` reports the store
    /// unavailable once, simulating an interruption after `n` items.
    pub fn interrupt_after(&self, n: u64) {
        self.state().interrupt_at = Some(n);
    }

    /// Item ids passed to `derive_metadata`, in call order.
    pub fn derive_calls(&self) -> Vec<String> {
        self.state().derive_calls.clone()
    }

    pub fn written(&self, index_id: &str, item_id: &str) -> Option<Value> {
        self.state()
            .written
            .get(&(index_id.to_string(), item_id.to_string()))
            .cloned()
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn count_items(&self) -> BackendResult<u64> {
        Ok(self.state().items.len() as u64)
    }

    async fn list_items(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<ContentItem>> {
        let state = self.state();
        let items = state
            .items
            .values()
            .filter(|item| after.map_or(true, |a| item.item_id.as_str() > a))
            .take(limit)
            .cloned()
            .collect();
        Ok(items)
    }

    async fn derive_metadata(&self, item: &ContentItem) -> BackendResult<Value> {
        let mut state = self.state();
        state.derive_calls.push(item.item_id.clone());
        if state.failing_items.contains(&item.item_id) {
            return Err(BackendError::Other(format!(
                "could not extract metadata from {}",
                item.item_id
            )));
        }
        let mut metadata = match &item.metadata {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        metadata.insert("content_type".to_string(), json!(item.content_type));
        metadata.insert("item_id".to_string(), json!(item.item_id));
        Ok(Value::Object(metadata))
    }

    async fn write_metadata(
        &self,
        index_id: &str,
        item_id: &str,
        metadata: &Value,
    ) -> BackendResult<()> {
        {
            let mut state = self.state();
            if state.interrupt_at == Some(state.writes) {
                state.interrupt_at = None;
                return Err(BackendError::Unavailable("metadata store interrupted".into()));
            }
            state.writes += 1;
            state
                .written
                .insert((index_id.to_string(), item_id.to_string()), metadata.clone());
        }
        if let Some(ref backend) = self.backend {
            backend.stage_metadata(index_id, item_id, metadata)?;
        }
        Ok(())
    }
}
