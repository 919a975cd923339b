//! Query path: multi-slice retrieval against the current index.
//!
//! The current-index pointer is read once per query, every slice runs
//! against that one index, and the hits are merged by
//! [`kb_sync_core::merge::merge_slices`]. A slice that fails is logged and
//! contributes nothing; the query itself only fails if the pointer cannot
//! be read.

use anyhow::Result;
use serde::Serialize;

use kb_sync_core::backend::IndexBackend;
use kb_sync_core::merge::{merge_slices, MergedItem, SliceResult};
use kb_sync_core::models::{RetrievalSlice, ScoredItem};
use kb_sync_core::store::PointerStore;

use crate::app::App;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    /// Index the query ran against; `None` when no index is served yet.
    pub index_id: Option<String>,
    pub results: Vec<MergedItem>,
    /// Slices whose retrieval failed for this query.
    pub failed_slices: Vec<String>,
}

pub async fn search_current(
    backend: &dyn IndexBackend,
    pointer: &dyn PointerStore,
    slices: &[RetrievalSlice],
    query: &str,
    k: usize,
    candidate_k: usize,
) -> Result<SearchResponse> {
    let Some(current) = pointer.current().await? else {
        return Ok(SearchResponse {
            index_id: None,
            results: Vec::new(),
            failed_slices: Vec::new(),
        });
    };
    if query.trim().is_empty() || k == 0 {
        return Ok(SearchResponse {
            index_id: Some(current.index_id),
            results: Vec::new(),
            failed_slices: Vec::new(),
        });
    }

    let index_id = current.index_id.as_str();
    let mut slice_results = Vec::with_capacity(slices.len());
    for slice in slices {
        let items: Result<Vec<ScoredItem>, _> = backend
            .retrieve(
                index_id,
                query,
                slice.filter_expression.as_deref(),
                candidate_k.max(k),
            )
            .await
            .map(|hits| {
                hits.into_iter()
                    .map(|hit| ScoredItem::from_retrieved(hit, &slice.slice_id))
                    .collect()
            });
        if let Err(ref e) = items {
            tracing::warn!(
                index_id,
                slice_id = %slice.slice_id,
                error = %e,
                "retrieval slice failed; merging without it"
            );
        }
        slice_results.push(SliceResult { slice, items });
    }

    let failed_slices = slice_results
        .iter()
        .filter(|r| r.items.is_err())
        .map(|r| r.slice.slice_id.clone())
        .collect();
    let results = merge_slices(&slice_results, k);
    tracing::debug!(index_id, hits = results.len(), "query merged");

    Ok(SearchResponse {
        index_id: Some(current.index_id),
        results,
        failed_slices,
    })
}

/// `kbctl search`: run a query and print the merged results.
pub async fn run_search(app: &App, query: &str, limit: Option<usize>) -> Result<()> {
    let retrieval = &app.config.retrieval;
    let response = search_current(
        app.backend.as_ref(),
        app.store.as_ref(),
        &retrieval.slices(),
        query,
        limit.unwrap_or(retrieval.final_limit),
        retrieval.candidate_k,
    )
    .await?;

    let Some(ref index_id) = response.index_id else {
        println!("No index is being served yet. Run `kbctl init --index <id>` first.");
        return Ok(());
    };
    if response.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, item) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} ({})",
            i + 1,
            item.score,
            item.item_id,
            item.content_type
        );
        println!(
            "    slice: {}{}",
            item.slice_id,
            if item.reserved { " (reserved)" } else { "" }
        );
        if item.matched_slices.len() > 1 {
            println!("    matched: {}", item.matched_slices.join(", "));
        }
        if let Some(text) = item.metadata.get("text").and_then(|t| t.as_str()) {
            println!("    excerpt: \"{}\"", excerpt(text, 160));
        }
        println!();
    }
    println!("index: {}", index_id);
    if !response.failed_slices.is_empty() {
        println!("failed slices: {}", response.failed_slices.join(", "));
    }
    Ok(())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &flat[..cut]),
        None => flat.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_sync_core::backend::memory::InMemoryBackend;
    use kb_sync_core::store::memory::InMemoryStore;
    use serde_json::json;

    async fn served_backend() -> (InMemoryBackend, InMemoryStore) {
        let backend = InMemoryBackend::new();
        backend.put_document("kb", "img-1", "image/png", "pipeline diagram", json!({}));
        for i in 0..6 {
            backend.put_document(
                "kb",
                &format!("txt-{}", i),
                "text/plain",
                "pipeline pipeline notes",
                json!({}),
            );
        }
        let job = backend.start_sync("kb").await.unwrap();
        backend.get_sync_status(&job).await.unwrap();

        let store = InMemoryStore::new();
        store.compare_and_swap(None, "kb").await.unwrap();
        (backend, store)
    }

    fn slices() -> Vec<RetrievalSlice> {
        vec![
            RetrievalSlice::filtered("images", "content_type = 'image/png'")
                .with_boost(1.0)
                .with_min_guaranteed(1),
            RetrievalSlice::unfiltered("all"),
        ]
    }

    #[tokio::test]
    async fn filtered_slice_keeps_its_reserved_slot() {
        let (backend, store) = served_backend().await;
        let response = search_current(&backend, &store, &slices(), "pipeline notes", 3, 10)
            .await
            .unwrap();
        assert_eq!(response.index_id.as_deref(), Some("kb"));
        assert_eq!(response.results.len(), 3);
        assert!(response
            .results
            .iter()
            .any(|r| r.item_id == "img-1" && r.reserved));
    }

    #[tokio::test]
    async fn failing_slice_contributes_nothing() {
        let (backend, store) = served_backend().await;
        backend.fail_retrieval_for("content_type = 'image/png'");
        let response = search_current(&backend, &store, &slices(), "pipeline", 4, 10)
            .await
            .unwrap();
        assert_eq!(response.failed_slices, vec!["images".to_string()]);
        assert_eq!(response.results.len(), 4);
        assert!(response.results.iter().all(|r| r.slice_id == "all"));
    }

    #[tokio::test]
    async fn no_pointer_means_no_results() {
        let backend = InMemoryBackend::new();
        let store = InMemoryStore::new();
        let response = search_current(&backend, &store, &slices(), "pipeline", 4, 10)
            .await
            .unwrap();
        assert_eq!(response.index_id, None);
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn blank_query_short_circuits() {
        let (backend, store) = served_backend().await;
        let response = search_current(&backend, &store, &slices(), "   ", 4, 10)
            .await
            .unwrap();
        assert!(response.results.is_empty());
    }

    #[test]
    fn excerpt_truncates_on_char_boundary() {
        assert_eq!(excerpt("short\ntext", 20), "short text");
        assert_eq!(excerpt("ééééé", 3), "ééé…");
    }
}
