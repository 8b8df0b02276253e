//! REST boundary suites: a live server over the in-memory store, driven
//! through the blocking client exactly as a remote site would.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::pipeline::PipelineStore;
use crate::record::{HashRecord, LogEntry, RemoteStatusUpdate};
use crate::rest::server::{router, AppState};
use crate::rest::{RestClient, RestStore, RetryPolicy};
use crate::store::{CoreOps, MemoryStore, Store};

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        retry_delay: Duration::ZERO,
        long_delay: Duration::ZERO,
    }
}

/// Serve the given state on an ephemeral port; the server thread lives for
/// the rest of the test process.
fn serve(state: Arc<AppState>) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, router(state)).await.unwrap();
        });
    });
    rx.recv().unwrap()
}

fn remote_site() -> (Arc<MemoryStore>, RestStore) {
    let store = Arc::new(MemoryStore::new("SITE2"));
    let state = Arc::new(AppState {
        store: store.clone() as Arc<dyn Store>,
        pipeline: None,
        site_name: "SITE2".to_string(),
    });
    let addr = serve(state);
    (store, RestStore::for_url(format!("http://{addr}"), fast_policy()))
}

fn core_site() -> (Arc<PipelineStore>, RestStore) {
    let pipeline = Arc::new(PipelineStore::open_in_memory().unwrap());
    let state = Arc::new(AppState {
        store: Arc::new(MemoryStore::new("CORE1")) as Arc<dyn Store>,
        pipeline: Some(pipeline.clone()),
        site_name: "CORE1".to_string(),
    });
    let addr = serve(state);
    (pipeline, RestStore::for_url(format!("http://{addr}"), fast_policy()))
}

#[test]
fn hash_record_round_trip_over_the_wire() {
    let (_backing, store) = remote_site();

    let mut record = HashRecord::new("/b/dir1", "d1");
    record.files = Some(vec!["file1".to_string()]);
    record.dirs = Some(vec![]);
    record.links = Some(vec![]);
    let changes = store.upsert(&record).unwrap().unwrap();
    assert_eq!(changes.created, vec!["/b/dir1"]);

    let fetched = store.get("/b/dir1").unwrap();
    assert_eq!(fetched.current_hash, "d1");
    assert_eq!(fetched.files, Some(vec!["file1".to_string()]));
    assert!(fetched.current_dtg_latest > 0);

    assert_eq!(store.get_hash("/b/dir1").as_deref(), Some("d1"));
    assert_eq!(
        store.get_timestamp("/b/dir1"),
        Some(fetched.current_dtg_latest)
    );

    // Absent rows come back as the sentinel, not an error.
    assert_eq!(store.get("/b/ghost"), None);
    assert_eq!(store.get_hash("/b/ghost"), None);
}

#[test]
fn priority_and_integrity_queries_over_the_wire() {
    let (backing, store) = remote_site();

    for path in ["/b", "/b/x"] {
        let mut record = HashRecord::new(path, "current");
        record.target_hash = Some("expected".to_string());
        backing.upsert(&record).unwrap();
    }
    assert_eq!(store.priority_updates(), vec!["/b"]);

    // /b claims nothing, so /b/x is an orphan; claim a ghost for untracked.
    // The parent's hash changes so the new child list lands.
    let mut parent = HashRecord::new("/b", "current-2");
    parent.files = Some(vec!["ghost".to_string()]);
    backing.upsert(&parent).unwrap();
    assert_eq!(store.find_orphans(), vec!["/b/x"]);
    assert_eq!(store.find_untracked(), vec!["/b/ghost"]);
}

#[test]
fn oldest_updates_composes_point_lookups() {
    let (backing, store) = remote_site();
    let mut root = HashRecord::new("/b", "d");
    root.files = Some(vec!["f1".to_string(), "f2".to_string()]);
    backing.upsert(&root).unwrap();
    backing.upsert(&HashRecord::new("/b/f1", "h")).unwrap();

    // f2 has no record, so it sorts oldest.
    assert_eq!(store.oldest_updates("/b", 100), vec!["/b/f2", "/b/f1"]);
    assert_eq!(store.oldest_updates("/nope", 10), vec!["/nope"]);
}

#[test]
fn log_lifecycle_over_the_wire() {
    let (_backing, store) = remote_site();

    let id = store
        .put_log(&LogEntry::new("wire entry").with_detail("{\"n\":1}"))
        .unwrap();
    assert!(id > 0);

    let shippable = store.shippable_logs();
    assert_eq!(shippable.len(), 1);
    assert_eq!(shippable[0].summary_message, "wire entry");
    // The server stamped this site's identity on the unspecified origin.
    assert_eq!(shippable[0].site_id, "SITE2");

    assert!(store.logs_older_than(90).unwrap().is_empty());
    assert!(store.consolidate_logs());

    let (deleted, failed) = store.delete_logs(&[id, 777]);
    assert_eq!(deleted, vec![id]);
    assert_eq!(failed, vec![777]);
}

#[test]
fn health_reports_services_over_the_wire() {
    let (backing, store) = remote_site();
    let health = store.health();
    assert_eq!(health.get("api"), Some(&true));
    assert_eq!(health.get("database"), Some(&true));

    backing.set_healthy(false);
    let health = store.health();
    assert_eq!(health.get("database"), Some(&false));
}

#[test]
fn bad_requests_fail_fast_and_dead_endpoints_exhaust() {
    let state = Arc::new(AppState {
        store: Arc::new(MemoryStore::new("SITE2")) as Arc<dyn Store>,
        pipeline: None,
        site_name: "SITE2".to_string(),
    });
    let addr = serve(state);

    // A 4xx returns immediately rather than burning retry attempts.
    let client = RestClient::new(format!("http://{addr}"), fast_policy());
    let (status, message) = client.get(
        "/api/hashtable",
        &[("path", "/b".to_string()), ("field", "sideways".to_string())],
    );
    assert_eq!(status, 400);
    assert!(message.as_str().unwrap_or("").contains("Invalid field"));

    // Nothing listens on the discard port; exhaustion yields the non-200
    // tuple upper layers translate to the sentinel.
    let dead = RestClient::new("http://127.0.0.1:9", fast_policy());
    let (status, _) = dead.get("/api/health", &[]);
    assert_eq!(status, 503);
}

#[test]
fn pipeline_operations_over_the_wire() {
    let (pipeline, store) = core_site();
    pipeline.publish_update("/b/pkg", "TC-7", 4096);

    let updates = store.pipeline_updates().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].tc_id, "TC-7");
    assert_eq!(updates[0].hash_value, None);

    assert!(store.put_pipeline_hash("/b/pkg", "abc123"));
    let updates = store.pipeline_updates().unwrap();
    assert_eq!(updates[0].hash_value.as_deref(), Some("abc123"));

    pipeline.add_official_site("SITE1");
    pipeline.add_official_site("SITE2");
    assert_eq!(store.sync_sites(), Some(2));
}

#[test]
fn remote_status_batch_over_the_wire() {
    let (pipeline, store) = core_site();
    let updates = vec![
        RemoteStatusUpdate {
            path: "/b/x".to_string(),
            local_hash: Some("l".to_string()),
            core_hash: Some("c".to_string()),
        },
        RemoteStatusUpdate {
            path: "/b/y".to_string(),
            local_hash: None,
            core_hash: Some("c2".to_string()),
        },
    ];
    assert_eq!(
        store.put_remote_status("SITE2", &updates, true, Some("/b")),
        Some(2)
    );

    let rows = pipeline.remote_status_for("SITE2");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].path, "/b/x");
    assert_eq!(rows[1].local_hash, None);
}

#[test]
fn pipeline_resources_unavailable_on_remote_sites() {
    let (_backing, store) = remote_site();
    assert_eq!(store.pipeline_updates(), None);
    assert!(!store.put_pipeline_hash("/b", "h"));
}
