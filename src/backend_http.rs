//! REST adapter for a remote managed index.
//!
//! [`HttpBackend`] implements both [`IndexBackend`] and [`MetadataStore`]
//! against a JSON API rooted at `backend.base_url`:
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | `create_index` | `POST /indexes` | `{"index_id"}` |
//! | `delete_index` | `DELETE /indexes/{index}` | any 2xx |
//! | `start_sync` | `POST /indexes/{index}/sync-jobs` | `{"job_id"}` |
//! | `list_active_sync_jobs` | `GET /indexes/{index}/sync-jobs?status=IN_PROGRESS` | `{"jobs": [SyncJob]}` |
//! | `get_sync_status` | `GET /sync-jobs/{job}` | `{"status"}` |
//! | `retrieve` | `POST /indexes/{index}/retrieve` | `{"items": [RetrievedItem]}` |
//! | `count_items` | `GET /items/count` | `{"count"}` |
//! | `list_items` | `GET /items?after=&limit=` | `{"items": [ContentItem]}` |
//! | `derive_metadata` | `POST /items/{item}/derive-metadata` | `{"metadata"}` |
//! | `write_metadata` | `PUT /indexes/{index}/metadata/{item}` | any 2xx |
//!
//! Status mapping:
//! - 409 → [`BackendError::Conflict`]
//! - 404 → [`BackendError::NotFound`]
//! - 429, 5xx, network error → retried with exponential backoff, then
//!   [`BackendError::Unavailable`]
//! - other 4xx → [`BackendError::Other`], not retried
//!
//! `create_index` and `start_sync` create a resource on the server, so they
//! are only retried when the request cannot have been acted on (429 or a
//! failed connect). A 5xx or a lost response returns `Unavailable` at once
//! and the caller retries at its own level, where it can first look for a
//! job or index the lost request may have created.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use kb_sync_core::backend::{BackendResult, IndexBackend, MetadataStore};
use kb_sync_core::error::BackendError;
use kb_sync_core::models::{ContentItem, RetrievedItem, SyncJob, SyncStatus};

use crate::config::BackendConfig;

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    max_retries: u32,
    retry_base: Duration,
}

/// Whether a request may be sent again after an ambiguous failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Reads and overwrites.
    Safe,
    /// Requests that create something; a repeat could create it twice.
    NotSafe,
}

#[derive(Deserialize)]
struct IndexCreated {
    index_id: String,
}

#[derive(Deserialize)]
struct SyncStarted {
    job_id: String,
}

#[derive(Deserialize)]
struct SyncJobList {
    jobs: Vec<SyncJob>,
}

#[derive(Deserialize)]
struct SyncJobStatus {
    status: SyncStatus,
}

#[derive(Deserialize)]
struct ItemList<T> {
    items: Vec<T>,
}

#[derive(Deserialize)]
struct ItemCount {
    count: u64,
}

#[derive(Deserialize)]
struct DerivedMetadata {
    metadata: Value,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let Some(ref base) = config.base_url else {
            bail!("backend.base_url is required for the http provider");
        };
        let base_url = Url::parse(base)?;
        if base_url.cannot_be_a_base() {
            bail!("backend.base_url is not a base URL: {}", base);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            max_retries: config.max_retries,
            retry_base: Duration::from_secs(1),
        })
    }

    /// Base delay of the retry backoff (doubles per attempt).
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    fn url(&self, segments: &[&str]) -> BackendResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| BackendError::Other(format!("bad base url {}", self.base_url)))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    /// Send one request with retry/backoff and decode the JSON body.
    ///
    /// `what` names the resource for `NotFound` messages.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        what: &str,
        replay: Replay,
    ) -> BackendResult<T> {
        let response = self.send(method, url, body, what, replay).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Other(format!("invalid response for {}: {}", what, e)))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        what: &str,
        replay: Replay,
    ) -> BackendResult<reqwest::Response> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: base, 2×base, 4×base, ... capped at 32×base.
                let delay = self.retry_base * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.request(method.clone(), url.clone());
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let text = response.text().await.unwrap_or_default();
                    let err = classify(status, what, &text);
                    let refused = status == StatusCode::TOO_MANY_REQUESTS;
                    if !err.is_transient() || (replay == Replay::NotSafe && !refused) {
                        return Err(err);
                    }
                    tracing::debug!(
                        attempt,
                        status = status.as_u16(),
                        url = %url,
                        "backend request will be retried"
                    );
                    last_err = Some(err);
                }
                Err(e) => {
                    tracing::debug!(attempt, url = %url, error = %e, "backend request failed");
                    let err = BackendError::Unavailable(e.to_string());
                    // Past connect, the server may have acted on the request.
                    if replay == Replay::NotSafe && !e.is_connect() {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            BackendError::Unavailable(format!("{} {} failed after retries", method, url))
        }))
    }
}

/// Map a non-success HTTP status onto a [`BackendError`].
fn classify(status: StatusCode, what: &str, body: &str) -> BackendError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    match status {
        StatusCode::CONFLICT => BackendError::Conflict {
            index_id: what.to_string(),
        },
        StatusCode::NOT_FOUND => BackendError::NotFound(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS => BackendError::Unavailable(detail),
        s if s.is_server_error() => BackendError::Unavailable(detail),
        _ => BackendError::Other(detail),
    }
}

#[async_trait]
impl IndexBackend for HttpBackend {
    async fn create_index(&self) -> BackendResult<String> {
        let url = self.url(&["indexes"])?;
        let created: IndexCreated = self
            .call(Method::POST, url, Some(&json!({})), "indexes", Replay::NotSafe)
            .await?;
        Ok(created.index_id)
    }

    async fn delete_index(&self, index_id: &str) -> BackendResult<()> {
        let url = self.url(&["indexes", index_id])?;
        self.send(
            Method::DELETE,
            url,
            None,
            &format!("index {}", index_id),
            Replay::Safe,
        )
        .await?;
        Ok(())
    }

    async fn start_sync(&self, index_id: &str) -> BackendResult<String> {
        let url = self.url(&["indexes", index_id, "sync-jobs"])?;
        let started: SyncStarted = self
            .call(Method::POST, url, Some(&json!({})), index_id, Replay::NotSafe)
            .await
            .map_err(|e| match e {
                BackendError::NotFound(_) => BackendError::NotFound(format!("index {}", index_id)),
                other => other,
            })?;
        Ok(started.job_id)
    }

    async fn list_active_sync_jobs(&self, index_id: &str) -> BackendResult<Vec<SyncJob>> {
        let mut url = self.url(&["indexes", index_id, "sync-jobs"])?;
        url.query_pairs_mut().append_pair("status", SyncStatus::InProgress.as_str());
        let list: SyncJobList = self
            .call(Method::GET, url, None, &format!("index {}", index_id), Replay::Safe)
            .await?;
        let mut jobs: Vec<SyncJob> = list
            .jobs
            .into_iter()
            .filter(|j| j.status == SyncStatus::InProgress)
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(jobs)
    }

    async fn get_sync_status(&self, job_id: &str) -> BackendResult<SyncStatus> {
        let url = self.url(&["sync-jobs", job_id])?;
        let job: SyncJobStatus = self
            .call(
                Method::GET,
                url,
                None,
                &format!("sync job {}", job_id),
                Replay::Safe,
            )
            .await?;
        Ok(job.status)
    }

    async fn retrieve(
        &self,
        index_id: &str,
        query: &str,
        filter: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<RetrievedItem>> {
        let url = self.url(&["indexes", index_id, "retrieve"])?;
        let body = json!({
            "query": query,
            "filter": filter,
            "limit": limit,
        });
        let list: ItemList<RetrievedItem> = self
            .call(
                Method::POST,
                url,
                Some(&body),
                &format!("index {}", index_id),
                Replay::Safe,
            )
            .await?;
        Ok(list.items)
    }
}

#[async_trait]
impl MetadataStore for HttpBackend {
    async fn count_items(&self) -> BackendResult<u64> {
        let url = self.url(&["items", "count"])?;
        let count: ItemCount = self
            .call(Method::GET, url, None, "items", Replay::Safe)
            .await?;
        Ok(count.count)
    }

    async fn list_items(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<ContentItem>> {
        let mut url = self.url(&["items"])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(after) = after {
                query.append_pair("after", after);
            }
            query.append_pair("limit", &limit.to_string());
        }
        let list: ItemList<ContentItem> = self
            .call(Method::GET, url, None, "items", Replay::Safe)
            .await?;
        Ok(list.items)
    }

    async fn derive_metadata(&self, item: &ContentItem) -> BackendResult<Value> {
        let url = self.url(&["items", &item.item_id, "derive-metadata"])?;
        let body = serde_json::to_value(item)
            .map_err(|e| BackendError::Other(format!("encode item {}: {}", item.item_id, e)))?;
        let derived: DerivedMetadata = self
            .call(
                Method::POST,
                url,
                Some(&body),
                &format!("item {}", item.item_id),
                Replay::Safe,
            )
            .await?;
        Ok(derived.metadata)
    }

    async fn write_metadata(
        &self,
        index_id: &str,
        item_id: &str,
        metadata: &Value,
    ) -> BackendResult<()> {
        let url = self.url(&["indexes", index_id, "metadata", item_id])?;
        self.send(
            Method::PUT,
            url,
            Some(metadata),
            &format!("index {}", index_id),
            Replay::Safe,
        )
        .await?;
        Ok(())
    }
}
