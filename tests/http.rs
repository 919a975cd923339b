//! HTTP API tests against a server bound to an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use kb_sync::app::App;
use kb_sync::config::Config;
use kb_sync::{db, migrate, server};
use kb_sync_core::backend::memory::{InMemoryBackend, InMemoryMetadataStore};
use kb_sync_core::store::PointerStore;

struct TestServer {
    base: String,
    backend: Arc<InMemoryBackend>,
    metadata: Arc<InMemoryMetadataStore>,
    stop: Option<oneshot::Sender<()>>,
    _tmp: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start_server() -> TestServer {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("kb.sqlite"));
    config.coordinator.poll_initial_ms = 2;
    config.coordinator.poll_max_ms = 10;
    config.queue.idle_poll_ms = 5;
    config.reindex.sync_poll_secs = 0;

    let pool = db::connect(&config).await.unwrap();
    migrate::migrate(&pool).await.unwrap();

    let backend = Arc::new(InMemoryBackend::new());
    backend.add_index("kb-main");
    let metadata = Arc::new(InMemoryMetadataStore::with_backend(backend.clone()));
    let app = App::from_parts(config, pool, backend.clone(), metadata.clone());
    app.store.compare_and_swap(None, "kb-main").await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (stop, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server::serve(app, listener, async {
            let _ = stop_rx.await;
        })
        .await
        .unwrap();
    });

    TestServer {
        base,
        backend,
        metadata,
        stop: Some(stop),
        _tmp: tmp,
    }
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn health_reports_version() {
    let srv = start_server().await;
    let body: Value = reqwest::get(format!("{}/health", srv.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn enqueued_request_is_synced_by_background_worker() {
    let srv = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/sync-requests", srv.base))
        .json(&json!({ "index_id": "kb-main" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["deduplicated"], false);
    assert!(body["message_id"].as_i64().is_some());

    let backend = srv.backend.clone();
    assert!(eventually(|| backend.started_jobs().len() == 1).await);
}

#[tokio::test]
async fn empty_index_id_is_rejected() {
    let srv = start_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/sync-requests", srv.base))
        .json(&json!({ "index_id": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn reindex_trigger_poll_and_search() {
    let srv = start_server().await;
    srv.metadata
        .insert_item("doc-1", "text/plain", "incident postmortem");
    srv.metadata.insert_item("doc-2", "text/plain", "deploy checklist");
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/reindex", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["created"], true);
    let id = body["job"]["execution_id"].as_str().unwrap().to_string();

    let mut status = String::new();
    for _ in 0..300 {
        let body: Value = client
            .get(format!("{}/reindex/{}", srv.base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        status = body["job"]["status"].as_str().unwrap().to_string();
        if status == "COMPLETED" || status == "FAILED" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, "COMPLETED");
    assert!(!srv.backend.has_index("kb-main"));

    let body: Value = client
        .post(format!("{}/search", srv.base))
        .json(&json!({ "query": "postmortem", "limit": 5 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_ne!(body["index_id"], "kb-main");
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["item_id"], "doc-1");
}

#[tokio::test]
async fn second_trigger_returns_running_job() {
    let srv = start_server().await;
    // Keep the first job parked in SYNCING.
    srv.backend.set_polls_to_complete(100_000);
    let client = reqwest::Client::new();

    let first: Value = client
        .post(format!("{}/reindex", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let resp = client
        .post(format!("{}/reindex", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let second: Value = resp.json().await.unwrap();
    assert_eq!(second["created"], false);
    assert_eq!(second["job"]["execution_id"], first["job"]["execution_id"]);
}

#[tokio::test]
async fn unknown_reindex_job_is_404() {
    let srv = start_server().await;
    let resp = reqwest::get(format!("{}/reindex/nope", srv.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn empty_query_is_bad_request() {
    let srv = start_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/search", srv.base))
        .json(&json!({ "query": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn status_lists_queue_and_pointer() {
    let srv = start_server().await;
    let body: Value = reqwest::get(format!("{}/status", srv.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["pointer"]["index_id"], "kb-main");
    assert_eq!(body["queue"]["dead"], 0);
}
