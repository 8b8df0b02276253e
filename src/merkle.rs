//! Merkle-tree integrity engine.
//!
//! Fingerprints a directory subtree bottom-up: files by streamed content,
//! links by their target representation, directories by composing the child
//! fingerprints in a fixed category order. Child records are stored before
//! the directory record that references them, so a concurrent reader sees
//! either the old subtree or, once the directory row lands, the new one.
//!
//! After a subtree below the monitored root is recomputed, every ancestor up
//! to the root is recomposed from *stored* child hashes — the filesystem is
//! not rewalked on the way up.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::hasher::FileHasher;
use crate::paths;
use crate::record::HashRecord;
use crate::store::Store;
use crate::walker::{self, DirListing, EntryKind};

pub const LIVENESS_ATTEMPTS: u32 = 5;
pub const LIVENESS_DELAY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// Terminal failure of one work item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MerkleFailure {
    /// Requested path is not under the monitored root.
    InvalidPath(String),
    /// The monitored root itself has no entries; the baseline mount is
    /// almost certainly missing.
    EmptyRoot,
    /// Store/REST liveness could not be established.
    Unreachable,
    /// Filesystem traversal failed.
    WalkFailed(String),
    /// A file or link could not be read for hashing.
    HashIoError(String),
    /// The store rejected an upsert.
    StoreFailed(String),
}

impl MerkleFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            MerkleFailure::InvalidPath(_) => "invalid_path",
            MerkleFailure::EmptyRoot => "empty_root",
            MerkleFailure::Unreachable => "unreachable",
            MerkleFailure::WalkFailed(_) => "walk_failed",
            MerkleFailure::HashIoError(_) => "hash_io_error",
            MerkleFailure::StoreFailed(_) => "store_failed",
        }
    }
}

impl std::fmt::Display for MerkleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MerkleFailure::InvalidPath(detail) => write!(f, "invalid path: {detail}"),
            MerkleFailure::EmptyRoot => write!(f, "monitored root is empty"),
            MerkleFailure::Unreachable => write!(f, "store liveness could not be established"),
            MerkleFailure::WalkFailed(detail) => write!(f, "walk failed: {detail}"),
            MerkleFailure::HashIoError(detail) => write!(f, "hash I/O error: {detail}"),
            MerkleFailure::StoreFailed(detail) => write!(f, "store failure: {detail}"),
        }
    }
}

impl std::error::Error for MerkleFailure {}

/// Linear per-item state machine. No retries inside a single item;
/// re-scheduling is the coordinator's job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkState {
    Queued,
    Validated,
    Walking,
    Hashing,
    Stored,
    RecomputingAncestors,
    Done,
    Failed(MerkleFailure),
}

/// A path selected for rehashing.
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub path: String,
    pub priority: bool,
    pub state: WorkState,
}

impl WorkItem {
    pub fn new(path: impl Into<String>, priority: bool) -> Self {
        WorkItem {
            path: path.into(),
            priority,
            state: WorkState::Queued,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct MerkleEngine {
    store: Arc<dyn Store>,
    hasher: FileHasher,
    root_path: String,
    session_id: Option<String>,
    liveness_attempts: u32,
    liveness_delay: Duration,
    in_flight: DashMap<String, ()>,
}

impl MerkleEngine {
    pub fn new(store: Arc<dyn Store>, hasher: FileHasher, root_path: impl Into<String>) -> Self {
        MerkleEngine {
            store,
            hasher,
            root_path: root_path.into(),
            session_id: None,
            liveness_attempts: LIVENESS_ATTEMPTS,
            liveness_delay: LIVENESS_DELAY,
            in_flight: DashMap::new(),
        }
    }

    /// Tag every record written by this engine with a coordination session.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_liveness(mut self, attempts: u32, delay: Duration) -> Self {
        self.liveness_attempts = attempts;
        self.liveness_delay = delay;
        self
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Compute the Merkle fingerprint of the deepest existing directory at or
    /// above `dir_path`, store every record in the subtree, and recompose the
    /// ancestors up to the monitored root.
    pub fn compute_merkle_tree(&self, dir_path: &str) -> Result<String, MerkleFailure> {
        let mut item = WorkItem::new(dir_path, false);
        match self.run_work_item(&mut item) {
            Some(hash) => Ok(hash),
            None => match item.state {
                WorkState::Failed(failure) => Err(failure),
                _ => Err(MerkleFailure::StoreFailed("work item stalled".to_string())),
            },
        }
    }

    /// Drive one work item through its states. Returns the computed hash,
    /// or None with the item left in a terminal [`WorkState::Failed`].
    pub fn run_work_item(&self, item: &mut WorkItem) -> Option<String> {
        match self.execute(item) {
            Ok(hash) => {
                item.state = WorkState::Done;
                Some(hash)
            }
            Err(failure) => {
                tracing::error!(
                    "Merkle computation for {} failed ({}): {}",
                    item.path,
                    failure.kind(),
                    failure
                );
                item.state = WorkState::Failed(failure);
                None
            }
        }
    }

    fn execute(&self, item: &mut WorkItem) -> Result<String, MerkleFailure> {
        // Two rehashes of one path must serialize.
        let _guard = self.claim(&item.path);

        tracing::debug!(
            "Validating dir_path ({}) against root_path ({})",
            item.path,
            self.root_path
        );
        if !paths::is_within(&item.path, &self.root_path) {
            return Err(MerkleFailure::InvalidPath(format!(
                "{} is not a child of root path {}",
                item.path, self.root_path
            )));
        }
        item.state = WorkState::Validated;

        // The scheduled path may have vanished since it was queued; hash the
        // deepest directory that still exists on the way up to the root.
        let target_dir = self.find_deepest_existing(&item.path)?;

        item.state = WorkState::Walking;
        let tree =
            walker::walk_tree(&target_dir).map_err(|e| MerkleFailure::WalkFailed(e.to_string()))?;

        if target_dir == self.root_path
            && tree.get(&target_dir).map(DirListing::is_empty) == Some(true)
        {
            return Err(MerkleFailure::EmptyRoot);
        }

        if !self.await_liveness() {
            return Err(MerkleFailure::Unreachable);
        }

        item.state = WorkState::Hashing;
        let dir_hash = self.compute_recursive(&target_dir, &tree)?;
        item.state = WorkState::Stored;

        if target_dir != self.root_path {
            item.state = WorkState::RecomputingAncestors;
            tracing::debug!("Recomputing parent hashes above {}", target_dir);
            self.recompute_ancestors(&target_dir);
        }

        tracing::info!("Successfully computed Merkle hash for {}", target_dir);
        Ok(dir_hash)
    }

    fn claim(&self, path: &str) -> InFlightGuard<'_> {
        loop {
            // Scope the entry guard so the shard lock is released before
            // sleeping.
            let claimed = match self.in_flight.entry(path.to_string()) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(());
                    true
                }
                dashmap::mapref::entry::Entry::Occupied(_) => false,
            };
            if claimed {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        InFlightGuard {
            map: &self.in_flight,
            path: path.to_string(),
        }
    }

    fn find_deepest_existing(&self, dir_path: &str) -> Result<String, MerkleFailure> {
        let mut current = dir_path.to_string();
        loop {
            tracing::debug!("Checking if directory exists: {}", current);
            if walker::classify(&current) == Some(EntryKind::Dir) {
                return Ok(current);
            }
            if current == self.root_path {
                return Err(MerkleFailure::WalkFailed(format!(
                    "root path does not exist: {}",
                    self.root_path
                )));
            }
            match paths::parent(&current) {
                Some(parent) if paths::is_within(parent, &self.root_path) => {
                    current = parent.to_string();
                }
                _ => {
                    return Err(MerkleFailure::InvalidPath(format!(
                        "no existing directory between {} and {}",
                        self.root_path, dir_path
                    )));
                }
            }
        }
    }

    fn await_liveness(&self) -> bool {
        for attempt in 1..=self.liveness_attempts {
            let health = self.store.health();
            if !health.is_empty() && health.values().all(|ok| *ok) {
                return true;
            }
            tracing::warn!(
                "Store not live (attempt {}/{}): {:?}",
                attempt,
                self.liveness_attempts,
                health
            );
            if attempt < self.liveness_attempts {
                std::thread::sleep(self.liveness_delay);
            }
        }
        false
    }

    /// Depth-first fingerprint of `dir`. Child hashes live in a
    /// recursion-local map and are never persisted as a unit; each child is
    /// upserted individually before its parent directory record.
    fn compute_recursive(
        &self,
        dir: &str,
        tree: &BTreeMap<String, DirListing>,
    ) -> Result<String, MerkleFailure> {
        let listing = tree.get(dir).ok_or_else(|| {
            MerkleFailure::WalkFailed(format!("walk result missing directory {}", dir))
        })?;

        let mut child_hashes: HashMap<String, String> = HashMap::new();

        for name in &listing.dirs {
            let child_path = paths::join(dir, name);
            let child_hash = self.compute_recursive(&child_path, tree)?;
            child_hashes.insert(child_path, child_hash);
        }

        for name in &listing.links {
            let child_path = paths::join(dir, name);
            let link_hash = self
                .hasher
                .hash_link(&child_path, &child_path)
                .map_err(|e| MerkleFailure::HashIoError(e.to_string()))?;
            self.upsert_leaf(&child_path, &link_hash)?;
            child_hashes.insert(child_path, link_hash);
        }

        for name in &listing.files {
            let child_path = paths::join(dir, name);
            let file_hash = self
                .hasher
                .hash_file(&child_path)
                .map_err(|e| MerkleFailure::HashIoError(e.to_string()))?;
            self.upsert_leaf(&child_path, &file_hash)?;
            child_hashes.insert(child_path, file_hash);
        }

        let dir_hash = self.compose_directory(dir, listing, &child_hashes);

        let record = HashRecord {
            path: dir.to_string(),
            current_hash: dir_hash.clone(),
            dirs: Some(listing.dirs.clone()),
            files: Some(listing.files.clone()),
            links: Some(listing.links.clone()),
            session_id: self.session_id.clone(),
            ..Default::default()
        };
        self.store_record(&record)?;

        tracing::debug!("Returning from merkle recursive for {}", dir);
        Ok(dir_hash)
    }

    /// Category order is fixed (dirs, files, links); names within a category
    /// are ascending; an empty category contributes its placeholder literal.
    fn compose_directory(
        &self,
        dir: &str,
        listing: &DirListing,
        child_hashes: &HashMap<String, String>,
    ) -> String {
        let mut hashable = String::new();
        let categories = [
            ("dirs", &listing.dirs),
            ("files", &listing.files),
            ("links", &listing.links),
        ];
        for (category, names) in categories {
            if names.is_empty() {
                hashable.push_str(&format!("{dir}/{category}: EMPTY "));
                continue;
            }
            for name in names {
                let child_path = paths::join(dir, name);
                if let Some(hash) = child_hashes.get(&child_path) {
                    hashable.push_str(hash);
                }
            }
        }
        self.hasher.hash_string(&hashable)
    }

    fn upsert_leaf(&self, path: &str, hash: &str) -> Result<(), MerkleFailure> {
        let mut record = HashRecord::new(path, hash);
        record.session_id = self.session_id.clone();
        self.store_record(&record)
    }

    fn store_record(&self, record: &HashRecord) -> Result<(), MerkleFailure> {
        match self.store.upsert(record) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(MerkleFailure::StoreFailed(format!(
                "store rejected record for {}",
                record.path
            ))),
            Err(e) => Err(MerkleFailure::StoreFailed(format!(
                "invalid record for {}: {}",
                record.path, e
            ))),
        }
    }

    /// Recompose each ancestor between `from` (exclusive) and the monitored
    /// root (inclusive) from stored child hashes. A missing child hash makes
    /// the ancestor uncomposable: it is logged, the ancestor is left
    /// untouched, and the ascent halts.
    fn recompute_ancestors(&self, from: &str) {
        let mut current = from.to_string();
        while current != self.root_path {
            let Some(parent) = paths::parent(&current).map(str::to_string) else {
                return;
            };
            current = parent;

            let Some(info) = self.store.get(&current) else {
                tracing::error!("No stored record for ancestor {}; halting ascent", current);
                return;
            };

            let mut hashable = String::new();
            for category in ["dirs", "files", "links"] {
                let mut names = info.children(category).cloned().unwrap_or_default();
                names.sort();
                if names.is_empty() {
                    hashable.push_str(&format!("{current}/{category}: EMPTY "));
                    continue;
                }
                for name in &names {
                    let child_path = paths::join(&current, name);
                    match self.store.get_hash(&child_path) {
                        Some(hash) => hashable.push_str(&hash),
                        None => {
                            tracing::error!(
                                "Missing stored hash for {} while recomposing {}; halting ascent",
                                child_path,
                                current
                            );
                            return;
                        }
                    }
                }
            }

            let dir_hash = self.hasher.hash_string(&hashable);
            let record = HashRecord {
                path: current.clone(),
                current_hash: dir_hash,
                dirs: info.dirs.clone(),
                files: info.files.clone(),
                links: info.links.clone(),
                session_id: self.session_id.clone(),
                ..Default::default()
            };
            if let Err(failure) = self.store_record(&record) {
                tracing::error!("Failed to store recomposed ancestor {}: {}", current, failure);
                return;
            }
            tracing::debug!("Recomposed ancestor hash for {}", current);
        }
    }
}

struct InFlightGuard<'a> {
    map: &'a DashMap<String, ()>,
    path: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Work-list deduplication
// ---------------------------------------------------------------------------

/// Merge priority and routine work lists into one deduplicated list.
///
/// Bare first-level roots are dropped from a multi-entry list (a "rehash
/// everything" entry must not swamp better-scoped work), then each list is
/// reduced to deepest common ancestors, priority first, preserving relative
/// order.
pub fn remove_redundant_paths_with_priority(
    priority: &[String],
    routine: &[String],
) -> Vec<String> {
    let mut priority: Vec<String> = priority.to_vec();
    let mut routine: Vec<String> = routine.to_vec();

    for items in [&mut priority, &mut routine] {
        if items.len() <= 1 {
            continue;
        }
        if let Some(root_dir) = items.iter().find_map(|p| paths::top_level(p)) {
            items.retain(|p| *p != root_dir);
        }
    }

    let mut combined = remove_redundant_paths(&priority, 1);
    combined.extend(routine);
    remove_redundant_paths(&combined, 1)
}

/// Keep only the deepest common parents at or below `min_depth`, preserving
/// first-seen order.
fn remove_redundant_paths(items: &[String], min_depth: usize) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for current in items {
        if paths::depth(current) < min_depth {
            continue;
        }
        if result.iter().any(|kept| paths::is_within(current, kept)) {
            continue;
        }
        result.retain(|kept| !paths::is_ancestor(current, kept));
        result.push(current.clone());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dedup_prefers_priority_and_prunes_descendants() {
        let priority = list(&[
            "/root/dir1",
            "/root/dir2/dir3/file.txt",
            "/root/dir2/dir3",
            "/root/dir2/dir4",
        ]);
        let routine = list(&["/root/dir1"]);
        assert_eq!(
            remove_redundant_paths_with_priority(&priority, &routine),
            list(&["/root/dir1", "/root/dir2/dir3", "/root/dir2/dir4"])
        );
    }

    #[test]
    fn dedup_empty_inputs() {
        assert!(remove_redundant_paths_with_priority(&[], &[]).is_empty());
    }

    #[test]
    fn dedup_single_element_passes_through() {
        let single = list(&["/root"]);
        assert_eq!(
            remove_redundant_paths_with_priority(&single, &[]),
            list(&["/root"])
        );
    }

    #[test]
    fn dedup_drops_bare_root_from_multi_entry_list() {
        let priority = list(&["/root", "/root/dir1", "/root/dir2"]);
        assert_eq!(
            remove_redundant_paths_with_priority(&priority, &[]),
            list(&["/root/dir1", "/root/dir2"])
        );
    }

    #[test]
    fn dedup_is_stable_under_partial_reduction() {
        let priority = list(&["/a/b", "/a/b/c", "/a/d"]);
        let routine = list(&["/a/d/e", "/x"]);
        let once = remove_redundant_paths_with_priority(&priority, &routine);
        let pre_reduced = remove_redundant_paths_with_priority(&priority, &[]);
        let twice = remove_redundant_paths_with_priority(&pre_reduced, &routine);
        assert_eq!(once, twice);
    }

    #[test]
    fn redundant_paths_keeps_order_of_survivors() {
        let items = list(&["/b/z", "/b/a", "/b/z/deeper"]);
        assert_eq!(
            remove_redundant_paths(&items, 1),
            list(&["/b/z", "/b/a"])
        );
    }

    #[test]
    fn ancestor_added_later_replaces_descendants() {
        let items = list(&["/b/x/1", "/b/x/2", "/b/x"]);
        assert_eq!(remove_redundant_paths(&items, 1), list(&["/b/x"]));
    }
}
