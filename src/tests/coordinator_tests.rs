//! Coordinator suites: core and remote roles over in-memory stores.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::hasher::{FileHasher, HashAlgorithm};
use crate::logging::Verbosity;
use crate::merkle::MerkleEngine;
use crate::record::{now_epoch, HashRecord, LogEntry, LogLevel, LogQuery, PipelineUpdate};
use crate::store::{CoreOps, MemoryStore, SiteStore, Store};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config_for(baseline: &str, site: &str, core: &str) -> Config {
    Config {
        rest_api_host: "127.0.0.1".to_string(),
        rest_api_port: 8080,
        core_api_host: "127.0.0.1".to_string(),
        core_api_port: 8080,
        site_name: site.to_string(),
        core_name: core.to_string(),
        baseline: baseline.to_string(),
        db_path: "basewatch-test.db".into(),
        pipeline_db_path: "pipeline-test.db".into(),
        hash_algorithm: HashAlgorithm::Sha1,
        log_level: Verbosity::Info,
        debug: false,
        max_runtime_min: 10,
        update_percent: 100,
        max_retries: 1,
        retry_delay: Duration::ZERO,
        long_delay: Duration::ZERO,
        liveness_attempts: 1,
        liveness_delay: Duration::ZERO,
    }
}

fn coordinator(
    config: Config,
    local: Arc<MemoryStore>,
    core: Arc<MemoryStore>,
) -> Coordinator {
    let engine = MerkleEngine::new(
        local.clone() as Arc<dyn Store>,
        FileHasher::new(config.hash_algorithm),
        config.baseline.clone(),
    )
    .with_session("sess-1")
    .with_liveness(1, Duration::ZERO);
    Coordinator::new(
        config,
        local as Arc<dyn SiteStore>,
        core as Arc<dyn SiteStore>,
        engine,
        "sess-1".to_string(),
    )
}

fn seed(store: &MemoryStore, path: &str, hash: &str, files: &[&str]) {
    let mut record = HashRecord::new(path, hash);
    record.dirs = Some(vec![]);
    record.files = Some(files.iter().map(|s| s.to_string()).collect());
    record.links = Some(vec![]);
    store.upsert(&record).unwrap();
}

fn summaries(store: &MemoryStore) -> Vec<String> {
    store
        .get_logs(&LogQuery::default())
        .unwrap()
        .into_iter()
        .map(|entry| entry.summary_message)
        .collect()
}

// ---------------------------------------------------------------------------
// Liveness gate
// ---------------------------------------------------------------------------

#[test]
fn unhealthy_service_exits_nonzero_before_any_work() {
    let local = Arc::new(MemoryStore::new("rem1"));
    local.set_healthy(false);
    let core = Arc::new(MemoryStore::new("core1"));

    let c = coordinator(config_for("/base", "rem1", "core1"), local.clone(), core);
    assert_eq!(c.run(), 1);
    assert_eq!(local.log_count(), 0);
}

// ---------------------------------------------------------------------------
// Core role
// ---------------------------------------------------------------------------

#[test]
fn core_run_fingerprints_authorized_updates() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap().to_string();
    let pkg = format!("{root}/pkg");
    fs::create_dir(&pkg).unwrap();
    fs::write(format!("{pkg}/payload.bin"), b"release-1").unwrap();

    let local = Arc::new(MemoryStore::new("core1"));
    local.seed_pipeline(vec![PipelineUpdate {
        id: 1,
        update_path: pkg.clone(),
        ..Default::default()
    }]);

    let c = coordinator(
        config_for(&root, "core1", "core1"),
        local.clone(),
        local.clone(),
    );
    assert_eq!(c.run(), 0);

    // The authority published its own computation as the expectation.
    let record = local.get(&pkg).unwrap();
    assert_eq!(record.target_hash.as_deref(), Some(record.current_hash.as_str()));

    // And marked the pipeline row processed with the same hash.
    let updates = local.pipeline_updates().unwrap();
    assert_eq!(
        updates[0].hash_value.as_deref(),
        Some(record.current_hash.as_str())
    );

    // The run's session entries were consolidated by the forwarding phase.
    assert!(summaries(&local)
        .iter()
        .any(|s| s.contains("Consolidated session sess-1")));
}

#[test]
fn core_flags_unapproved_drift_as_unauthorized() {
    let local = Arc::new(MemoryStore::new("core1"));
    let mut drifted = HashRecord::new("/base/rogue", "observed");
    drifted.target_hash = Some("expected".to_string());
    local.upsert(&drifted).unwrap();

    let c = coordinator(
        config_for("/base", "core1", "core1"),
        local.clone(),
        local.clone(),
    );
    c.run_core_tasks();

    let warnings: Vec<LogEntry> = local
        .get_logs(&LogQuery::default())
        .unwrap()
        .into_iter()
        .filter(|entry| entry.log_level == LogLevel::Warning)
        .collect();
    assert!(warnings
        .iter()
        .any(|entry| entry.summary_message == "Unauthorized changes detected."));
    assert!(warnings
        .iter()
        .any(|entry| entry.detailed_message.as_deref().unwrap_or("").contains("/base/rogue")));
}

#[test]
fn core_drift_covered_by_approved_update_is_not_flagged() {
    let local = Arc::new(MemoryStore::new("core1"));
    let mut drifted = HashRecord::new("/base/pkg/file", "observed");
    drifted.target_hash = Some("expected".to_string());
    local.upsert(&drifted).unwrap();
    local.seed_pipeline(vec![PipelineUpdate {
        id: 1,
        update_path: "/base/pkg".to_string(),
        ..Default::default()
    }]);

    let c = coordinator(
        config_for("/base", "core1", "core1"),
        local.clone(),
        local.clone(),
    );
    c.run_core_tasks();

    assert!(!summaries(&local)
        .iter()
        .any(|s| s == "Unauthorized changes detected."));
}

// ---------------------------------------------------------------------------
// Remote role
// ---------------------------------------------------------------------------

#[test]
fn remote_reports_divergence_and_adopts_core_targets() {
    let local = Arc::new(MemoryStore::new("rem1"));
    let core = Arc::new(MemoryStore::new("core1"));
    seed(&local, "/base", "l-root", &["f"]);
    seed(&local, "/base/f", "l-f", &[]);
    seed(&core, "/base", "c-root", &["f"]);
    seed(&core, "/base/f", "c-f", &[]);

    let c = coordinator(config_for("/base", "rem1", "core1"), local.clone(), core.clone());
    c.run_remote_tasks();

    let rows = core.remote_status_for("rem1");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].path, "/base");
    assert_eq!(rows[0].local_hash.as_deref(), Some("l-root"));
    assert_eq!(rows[0].core_hash.as_deref(), Some("c-root"));
    assert_eq!(rows[1].path, "/base/f");

    // Divergent paths adopt the authority's value as their target.
    assert_eq!(local.get("/base/f").unwrap().target_hash.as_deref(), Some("c-f"));
    assert_eq!(local.get("/base").unwrap().target_hash.as_deref(), Some("c-root"));
}

#[test]
fn remote_short_circuits_equal_hash_subtrees() {
    let local = Arc::new(MemoryStore::new("rem1"));
    let core = Arc::new(MemoryStore::new("core1"));
    // Equal root hashes; divergence below would only be reachable by
    // descending, which an equal cryptographic hash makes unnecessary.
    seed(&local, "/base", "same", &["f"]);
    seed(&local, "/base/f", "l-f", &[]);
    seed(&core, "/base", "same", &["f"]);
    seed(&core, "/base/f", "c-f", &[]);

    let c = coordinator(config_for("/base", "rem1", "core1"), local.clone(), core.clone());
    c.run_remote_tasks();

    assert!(core.remote_status_for("rem1").is_empty());
    assert_eq!(local.get("/base/f").unwrap().target_hash, None);
}

#[test]
fn remote_reports_paths_missing_on_either_side() {
    let local = Arc::new(MemoryStore::new("rem1"));
    let core = Arc::new(MemoryStore::new("core1"));
    // Local has an extra file; core has one the local site lacks.
    seed(&local, "/base", "l-root", &["extra"]);
    seed(&local, "/base/extra", "l-extra", &[]);
    seed(&core, "/base", "c-root", &["missing"]);
    seed(&core, "/base/missing", "c-missing", &[]);

    let c = coordinator(config_for("/base", "rem1", "core1"), local.clone(), core.clone());
    c.run_remote_tasks();

    let rows = core.remote_status_for("rem1");
    let extra = rows.iter().find(|r| r.path == "/base/extra").unwrap();
    assert_eq!(extra.local_hash.as_deref(), Some("l-extra"));
    assert_eq!(extra.core_hash, None);

    let missing = rows.iter().find(|r| r.path == "/base/missing").unwrap();
    assert_eq!(missing.local_hash, None);
    assert_eq!(missing.core_hash.as_deref(), Some("c-missing"));

    // A path absent on one side cannot adopt a target there.
    assert_eq!(local.get("/base/extra").unwrap().target_hash, None);
}

#[test]
fn remote_full_run_reports_local_tree_to_empty_core() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap().to_string();
    fs::write(format!("{root}/data.txt"), b"content").unwrap();

    let local = Arc::new(MemoryStore::new("rem1"));
    let core = Arc::new(MemoryStore::new("core1"));

    let c = coordinator(config_for(&root, "rem1", "core1"), local.clone(), core.clone());
    assert_eq!(c.run(), 0);

    // The rehash sweep populated the local store from disk, and the status
    // batch reported everything the core has never seen.
    let rows = core.remote_status_for("rem1");
    assert!(rows.iter().any(|r| r.path == root));
    assert!(rows.iter().all(|r| r.core_hash.is_none()));
}

// ---------------------------------------------------------------------------
// Log forwarding
// ---------------------------------------------------------------------------

#[test]
fn remote_ships_consolidated_logs_and_clears_local() {
    let local = Arc::new(MemoryStore::new("rem1"));
    let core = Arc::new(MemoryStore::new("core1"));
    local
        .put_log(&LogEntry::new("phase a").with_session("old-run"))
        .unwrap();
    local
        .put_log(&LogEntry::new("phase b").with_session("old-run"))
        .unwrap();
    local.put_log(&LogEntry::new("loose detail")).unwrap();

    let c = coordinator(config_for("/base", "rem1", "core1"), local.clone(), core.clone());
    c.run_log_forwarding().unwrap();

    // Session rows consolidated, then everything shippable moved to core.
    assert_eq!(local.log_count(), 0);
    assert_eq!(core.log_count(), 2);
    assert!(summaries(&core).iter().any(|s| s == "loose detail"));
    assert!(summaries(&core).iter().any(|s| s.contains("Consolidated session")));
}

#[test]
fn core_purges_logs_older_than_retention() {
    let local = Arc::new(MemoryStore::new("core1"));
    let mut ancient = LogEntry::new("long forgotten");
    ancient.timestamp = now_epoch() - 91 * 86400;
    local.put_log(&ancient).unwrap();
    local.put_log(&LogEntry::new("fresh")).unwrap();

    let c = coordinator(
        config_for("/base", "core1", "core1"),
        local.clone(),
        local.clone(),
    );
    c.run_log_forwarding().unwrap();

    let remaining = summaries(&local);
    assert!(!remaining.iter().any(|s| s == "long forgotten"));
    // The core does not ship to itself; fresh entries stay put.
    assert!(remaining.iter().any(|s| s == "fresh"));
}
