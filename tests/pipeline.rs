//! End-to-end tests over a real SQLite database and the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use kb_sync::app::App;
use kb_sync::config::Config;
use kb_sync::{db, migrate};
use kb_sync_core::backend::memory::{InMemoryBackend, InMemoryMetadataStore};
use kb_sync_core::backend::IndexBackend;
use kb_sync_core::models::{ReindexStatus, SyncRequest};
use kb_sync_core::store::{JobStore, PointerStore};

async fn test_app(tmp: &TempDir, backend: Arc<InMemoryBackend>) -> (App, Arc<InMemoryMetadataStore>) {
    let mut config = Config::with_db_path(tmp.path().join("kb.sqlite"));
    config.coordinator.poll_initial_ms = 2;
    config.coordinator.poll_max_ms = 10;
    config.coordinator.max_wait_secs = 5;
    config.coordinator.conflict_backoff_ms = 1;
    config.queue.dedup_window_secs = 0;
    config.queue.idle_poll_ms = 5;
    config.reindex.sync_poll_secs = 0;
    config.reindex.page_size = 3;

    let pool = db::connect(&config).await.unwrap();
    migrate::migrate(&pool).await.unwrap();
    let metadata = Arc::new(InMemoryMetadataStore::with_backend(backend.clone()));
    let app = App::from_parts(config, pool, backend, metadata.clone());
    (app, metadata)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_never_overlap_syncs() {
    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    backend.add_index("kb-a");
    backend.add_index("kb-b");
    // Let overlapping starts through so only the coordinator prevents them.
    backend.allow_overlapping_syncs();
    backend.set_polls_to_complete(3);
    let (app, _) = test_app(&tmp, backend.clone()).await;

    let mut producers = Vec::new();
    for p in 0..4 {
        let queue = app.queue.clone();
        producers.push(tokio::spawn(async move {
            let mut sent = Vec::new();
            for i in 0..5 {
                let index = if (p + i) % 2 == 0 { "kb-a" } else { "kb-b" };
                let request = SyncRequest::now(index);
                queue.enqueue(&request).await.unwrap();
                sent.push(request);
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
            sent
        }));
    }

    let worker = app.worker();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker_task = tokio::spawn(async move {
        worker
            .run(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let mut requests = Vec::new();
    for p in producers {
        requests.extend(p.await.unwrap());
    }

    // Wait for the queue to empty.
    for _ in 0..500 {
        let depth = app.queue.depth().await.unwrap();
        if depth.pending == 0 && depth.inflight == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let _ = stop_tx.send(());
    worker_task.await.unwrap().unwrap();

    let depth = app.queue.depth().await.unwrap();
    assert_eq!((depth.pending, depth.inflight, depth.dead), (0, 0, 0));
    assert_eq!(backend.max_concurrent_in_progress(), 1);

    let jobs = backend.started_jobs();
    for request in &requests {
        assert!(
            jobs.iter()
                .any(|j| j.index_id == request.index_id && j.started_at >= request.requested_at),
            "request for {} at {} not covered by any sync",
            request.index_id,
            request.requested_at
        );
    }
}

#[tokio::test]
async fn old_request_is_satisfied_without_a_new_sync() {
    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    backend.add_index("kb");
    let (app, _) = test_app(&tmp, backend.clone()).await;

    let before = Utc::now() - chrono::Duration::seconds(5);
    app.queue.enqueue(&SyncRequest::now("kb")).await.unwrap();
    assert_eq!(app.worker().drain().await.unwrap(), 1);
    assert_eq!(backend.started_jobs().len(), 1);

    // Content written before the last sync started needs no new sync.
    app.queue
        .enqueue(&SyncRequest::new("kb", before))
        .await
        .unwrap();
    assert_eq!(app.worker().drain().await.unwrap(), 1);
    assert_eq!(backend.started_jobs().len(), 1);
}

#[tokio::test]
async fn reindex_resumes_in_a_new_process_after_interruption() {
    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    backend.add_index("kb-v1");
    let (app, metadata) = test_app(&tmp, backend.clone()).await;
    app.store.compare_and_swap(None, "kb-v1").await.unwrap();
    for i in 0..10 {
        metadata.insert_item(&format!("doc-{:03}", i), "text/plain", "runbook entry");
    }
    metadata.interrupt_after(4);

    let id = app
        .orchestrator()
        .trigger()
        .await
        .unwrap()
        .job()
        .execution_id
        .clone();
    assert!(app.orchestrator().advance(&id).await.is_err());

    let saved = app.store.load_reindex_job(&id).await.unwrap().unwrap();
    assert_eq!(saved.status, ReindexStatus::Processing);
    assert_eq!(saved.processed_count, 4);
    assert_eq!(saved.last_item_id.as_deref(), Some("doc-003"));

    // A fresh App on the same database picks the job up.
    let pool = db::connect(&app.config).await.unwrap();
    let resumed = App::from_parts(app.config.clone(), pool, backend.clone(), metadata.clone());
    let job = resumed.orchestrator().drive(&id).await.unwrap();

    assert_eq!(job.status, ReindexStatus::Completed);
    assert_eq!(job.processed_count, 10);
    assert_eq!(job.error_count, 0);
    let new_index = job.new_index_id.clone().unwrap();
    assert_eq!(
        resumed.store.current().await.unwrap().unwrap().index_id,
        new_index
    );
    assert!(!backend.has_index("kb-v1"));
    assert_eq!(
        backend
            .retrieve(&new_index, "runbook", None, 20)
            .await
            .unwrap()
            .len(),
        10
    );

    let calls = metadata.derive_calls();
    for i in 0..10 {
        let item = format!("doc-{:03}", i);
        let n = calls.iter().filter(|c| **c == item).count();
        assert!(n >= 1, "{} skipped", item);
        if i != 4 {
            assert_eq!(n, 1, "{} reprocessed", item);
        }
    }
}

#[tokio::test]
async fn concurrent_triggers_create_one_job() {
    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let (app, _) = test_app(&tmp, backend).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            app.orchestrator().trigger().await.unwrap()
        }));
    }
    let mut created = 0;
    let mut ids = std::collections::HashSet::new();
    for t in tasks {
        let outcome = t.await.unwrap();
        if outcome.created() {
            created += 1;
        }
        ids.insert(outcome.job().execution_id.clone());
    }
    assert_eq!(created, 1);
    assert_eq!(ids.len(), 1);
    assert!(app.store.active_reindex_job().await.unwrap().is_some());
}
