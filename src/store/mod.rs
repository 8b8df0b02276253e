//! The hash & log store contract.
//!
//! Backends are narrow and interchangeable: a file-backed sqlite store, an
//! in-memory store (contingency and tests), and a REST-backed store so the
//! engine and coordinator are indifferent to where the rows live.
//!
//! Failure semantics, uniform across backends:
//!
//! - transport/backend errors are logged at ERROR and surface as sentinels
//!   (`None` / `false` / empty) — they never cross the trait as errors;
//! - validation errors (missing required field, illegal child name, bad
//!   query parameter) are the caller's fault and surface as `Err`.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use anyhow::Result;

use crate::record::{
    ChangeSet, HashRecord, LogEntry, LogQuery, PipelineUpdate, RemoteStatusUpdate,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub trait Store: Send + Sync {
    // -- point operations ---------------------------------------------------

    /// Full record for a path, or None when absent or unreachable.
    fn get(&self, path: &str) -> Option<HashRecord>;

    /// `current_hash` only.
    fn get_hash(&self, path: &str) -> Option<String>;

    /// `current_dtg_latest` only.
    fn get_timestamp(&self, path: &str) -> Option<i64>;

    /// Insert or update one record; see the module docs of
    /// [`crate::store::sqlite`] for the case analysis.
    ///
    /// `Err` = validation failure, `Ok(None)` = backend failure (already
    /// logged), `Ok(Some(changes))` = applied.
    fn upsert(&self, record: &HashRecord) -> Result<Option<ChangeSet>>;

    /// Remove a record. True when a row was deleted.
    fn delete(&self, path: &str) -> bool;

    // -- range and set queries ----------------------------------------------

    /// Paths whose `target_hash` is set and differs from `current_hash`,
    /// pruned to deepest common ancestors, ordered by ascending depth then
    /// lexicographically.
    fn priority_updates(&self) -> Vec<String>;

    /// The oldest `ceil(n * percent / 100)` immediate children of `root` by
    /// `current_dtg_latest`. Children the parent names but the store has no
    /// timestamp for sort first. `[root]` when root is unknown or childless.
    ///
    /// The default implementation composes point lookups, so it works over
    /// any backend including the REST one.
    fn oldest_updates(&self, root: &str, percent: u32) -> Vec<String> {
        let Some(record) = self.get(root) else {
            tracing::info!("Path not found, scheduling it directly: {}", root);
            return vec![root.to_string()];
        };

        let children = record.all_children();
        if children.is_empty() {
            return vec![root.to_string()];
        }

        let mut timestamped: Vec<(i64, String)> = children
            .iter()
            .map(|name| {
                let child_path = crate::paths::join(root, name);
                let ts = self.get_timestamp(&child_path).unwrap_or(0);
                (ts, child_path)
            })
            .collect();
        timestamped.sort();

        let n = timestamped.len();
        let take = ((n * percent as usize).div_ceil(100)).clamp(1, n);
        tracing::info!("Returning the {} oldest of {} items under {}", take, n, root);
        timestamped
            .into_iter()
            .take(take)
            .map(|(_, path)| path)
            .collect()
    }

    /// Records no parent claims.
    fn find_orphans(&self) -> Vec<String>;

    /// Child paths some parent claims but no record exists for.
    fn find_untracked(&self) -> Vec<String>;

    // -- log operations -----------------------------------------------------

    /// Append one log entry; returns the assigned log_id.
    fn put_log(&self, entry: &LogEntry) -> Option<i64>;

    /// Query log entries. `Err` on invalid query parameters.
    fn get_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>>;

    /// Bulk delete; returns (deleted_ids, failed_ids).
    fn delete_logs(&self, log_ids: &[i64]) -> (Vec<i64>, Vec<i64>);

    /// Roll up per-session entries into one summary row each. Idempotent.
    fn consolidate_logs(&self) -> bool;

    // -- health -------------------------------------------------------------

    /// Per-component liveness, e.g. `{"database": true}`.
    fn health(&self) -> BTreeMap<String, bool>;

    // -- derived queries ----------------------------------------------------

    /// Entries eligible to ship to the core (null session).
    fn shippable_logs(&self) -> Vec<LogEntry> {
        self.get_logs(&LogQuery::shippable()).unwrap_or_default()
    }

    /// Entries older than `days` days. `Err` when days is not positive.
    fn logs_older_than(&self, days: i64) -> Result<Vec<LogEntry>> {
        self.get_logs(&LogQuery::older_than(days))
    }
}

/// Authority-side operations: the CD pipeline's update feed and the fleet
/// status tables the dashboard reads. Available on the core site directly
/// and everywhere through the REST boundary.
pub trait CoreOps: Send + Sync {
    /// Authorized updates published by the CD pipeline.
    fn pipeline_updates(&self) -> Option<Vec<PipelineUpdate>>;

    /// Record the computed hash on the first matching unprocessed update.
    fn put_pipeline_hash(&self, update_path: &str, hash_value: &str) -> bool;

    /// Sync the authoritative site list into the local sites table;
    /// returns the number of sites synced.
    fn sync_sites(&self) -> Option<usize>;

    /// Replace or append one remote site's hash-status segment;
    /// returns the number of rows applied.
    fn put_remote_status(
        &self,
        site_name: &str,
        updates: &[RemoteStatusUpdate],
        drop_previous: bool,
        root_path: Option<&str>,
    ) -> Option<usize>;
}

/// A full site handle: hash/log store plus authority operations.
pub trait SiteStore: Store + CoreOps {}

impl<T: Store + CoreOps> SiteStore for T {}

// ---------------------------------------------------------------------------
// Shared query algorithms
// ---------------------------------------------------------------------------

/// Keep only deepest common ancestors: no returned path is an ancestor (or
/// duplicate) of another. Output ordered by ascending depth, then
/// lexicographically.
pub(crate) fn prune_to_ancestors(paths: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = paths;
    unique.sort_by(|a, b| {
        crate::paths::depth(a)
            .cmp(&crate::paths::depth(b))
            .then_with(|| a.cmp(b))
    });
    unique.dedup();

    let mut pruned: Vec<String> = Vec::new();
    for path in unique {
        if !pruned.iter().any(|kept| crate::paths::is_within(&path, kept)) {
            pruned.push(path);
        }
    }
    pruned
}

/// Records no parent claims. The tracked tree roots (records with no tracked
/// proper ancestor at all) are exempt; everything else must be named in some
/// parent's child list.
pub(crate) fn compute_orphans(records: &[HashRecord]) -> Vec<String> {
    use std::collections::HashSet;

    let by_path: HashSet<&str> = records.iter().map(|r| r.path.as_str()).collect();
    let mut claimed: HashSet<String> = HashSet::new();
    for record in records {
        for name in record.all_children() {
            claimed.insert(crate::paths::join(&record.path, name));
        }
    }

    let mut orphans: Vec<String> = Vec::new();
    for record in records {
        if claimed.contains(&record.path) {
            continue;
        }
        let mut ancestor = crate::paths::parent(&record.path);
        while let Some(a) = ancestor {
            if by_path.contains(a) {
                orphans.push(record.path.clone());
                break;
            }
            ancestor = crate::paths::parent(a);
        }
    }
    orphans.sort();
    orphans
}

/// Child paths some parent claims but no record exists for.
pub(crate) fn compute_untracked(records: &[HashRecord]) -> Vec<String> {
    use std::collections::HashSet;

    let by_path: HashSet<&str> = records.iter().map(|r| r.path.as_str()).collect();
    let mut untracked: Vec<String> = Vec::new();
    for record in records {
        for name in record.all_children() {
            let child_path = crate::paths::join(&record.path, name);
            if !by_path.contains(child_path.as_str()) {
                untracked.push(child_path);
            }
        }
    }
    untracked.sort();
    untracked.dedup();
    untracked
}
