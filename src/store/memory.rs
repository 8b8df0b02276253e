//! In-memory store backend.
//!
//! Mirrors the sqlite backend's semantics over plain maps. Serves as the
//! contingency backend when no database is reachable and as the test double
//! for the engine and coordinator suites.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;

use crate::record::{
    now_epoch, ChangeSet, HashRecord, LogEntry, LogLevel, LogOrderBy, LogQuery, OrderDir,
    PipelineUpdate, RemoteStatusUpdate, SessionFilter, CHILD_CATEGORIES, MAX_SITE_ID_LEN,
};
use crate::store::{compute_orphans, compute_untracked, prune_to_ancestors, CoreOps, Store};

pub struct MemoryStore {
    inner: Mutex<Inner>,
    default_site: String,
}

struct Inner {
    hashtable: HashMap<String, HashRecord>,
    logs: Vec<LogEntry>,
    next_log_id: i64,
    healthy: bool,
    pipeline: Vec<PipelineUpdate>,
    official_sites: Vec<String>,
    sites: Vec<String>,
    remote_status: HashMap<String, Vec<RemoteStatusUpdate>>,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            hashtable: HashMap::new(),
            logs: Vec::new(),
            next_log_id: 1,
            healthy: true,
            pipeline: Vec::new(),
            official_sites: Vec::new(),
            sites: Vec::new(),
            remote_status: HashMap::new(),
        }
    }
}

impl MemoryStore {
    pub fn new(default_site: impl Into<String>) -> Self {
        MemoryStore {
            inner: Mutex::new(Inner::default()),
            default_site: default_site.into(),
        }
    }

    /// Test hook: flip the health probe.
    pub fn set_healthy(&self, healthy: bool) {
        self.lock().healthy = healthy;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Test/ops hook: seed the authorized-update feed.
    pub fn seed_pipeline(&self, updates: Vec<PipelineUpdate>) {
        self.lock().pipeline = updates;
    }

    /// Test/ops hook: seed the authoritative site list.
    pub fn seed_official_sites(&self, sites: Vec<String>) {
        self.lock().official_sites = sites;
    }

    /// Test/ops hook: one site's reported status rows.
    pub fn remote_status_for(&self, site_name: &str) -> Vec<RemoteStatusUpdate> {
        self.lock()
            .remote_status
            .get(site_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn record_count(&self) -> usize {
        self.lock().hashtable.len()
    }

    pub fn log_count(&self) -> usize {
        self.lock().logs.len()
    }

    /// Delete `path` and, transitively, every child its record claims.
    fn delete_subtree(inner: &mut Inner, path: &str, deleted: &mut Vec<String>) {
        let Some(record) = inner.hashtable.remove(path) else {
            return;
        };
        deleted.push(path.to_string());
        for name in record.all_children() {
            let child_path = crate::paths::join(path, name);
            Self::delete_subtree(inner, &child_path, deleted);
        }
    }
}

impl Store for MemoryStore {
    fn get(&self, path: &str) -> Option<HashRecord> {
        self.lock().hashtable.get(path).cloned()
    }

    fn get_hash(&self, path: &str) -> Option<String> {
        self.lock()
            .hashtable
            .get(path)
            .map(|r| r.current_hash.clone())
    }

    fn get_timestamp(&self, path: &str) -> Option<i64> {
        self.lock().hashtable.get(path).map(|r| r.current_dtg_latest)
    }

    fn upsert(&self, record: &HashRecord) -> Result<Option<ChangeSet>> {
        record.validate()?;

        let path = record.path.trim().to_string();
        let current_hash = record.current_hash.trim().to_string();
        let now = now_epoch();

        let mut inner = self.lock();
        let mut changes = ChangeSet::default();

        // Child paths dropped by this update, per category. On a
        // hash-changed update the stored lists are overwritten, so an absent
        // category means "now empty" and prunes everything it used to claim;
        // on a hash-unchanged touch an absent category is "no statement" and
        // prunes nothing (a target-only update must not orphan a subtree).
        let mut dropped: Vec<String> = Vec::new();
        if let Some(existing) = inner.hashtable.get(&path) {
            let changed = existing.current_hash != current_hash;
            for category in CHILD_CATEGORIES {
                let Some(old) = existing.children(category) else {
                    continue;
                };
                let empty: Vec<String> = Vec::new();
                let new = match record.children(category) {
                    Some(list) => list,
                    None if changed => &empty,
                    None => continue,
                };
                for name in old {
                    if !new.contains(name) {
                        dropped.push(crate::paths::join(&path, name));
                    }
                }
            }
        }

        if let Some(existing) = inner.hashtable.get_mut(&path) {
            if existing.current_hash == current_hash {
                tracing::debug!("Existing record, hash unchanged: {}", path);
                existing.current_dtg_latest = now;
                if record.target_hash.is_some() {
                    existing.target_hash = record.target_hash.clone();
                }
            } else {
                tracing::info!("Existing record, hash has changed: {}", path);
                changes.modified.push(path.clone());
                existing.prev_hash = Some(existing.current_hash.clone());
                existing.prev_dtg_latest = Some(existing.current_dtg_latest);
                existing.current_hash = current_hash;
                existing.current_dtg_latest = now;
                existing.current_dtg_first = now;
                existing.dirs = record.dirs.clone();
                existing.files = record.files.clone();
                existing.links = record.links.clone();
                if record.target_hash.is_some() {
                    existing.target_hash = record.target_hash.clone();
                }
                if record.session_id.is_some() {
                    existing.session_id = record.session_id.clone();
                }
            }
        } else {
            tracing::info!("Inserting new record for path: {}", path);
            changes.created.push(path.clone());
            inner.hashtable.insert(
                path.clone(),
                HashRecord {
                    path: path.clone(),
                    current_hash,
                    current_dtg_latest: now,
                    current_dtg_first: now,
                    prev_hash: None,
                    prev_dtg_latest: None,
                    target_hash: record.target_hash.clone(),
                    dirs: record.dirs.clone(),
                    files: record.files.clone(),
                    links: record.links.clone(),
                    session_id: record.session_id.clone(),
                },
            );
        }

        for child_path in dropped {
            Self::delete_subtree(&mut inner, &child_path, &mut changes.deleted);
        }
        changes.created.sort();
        changes.modified.sort();
        changes.deleted.sort();
        Ok(Some(changes))
    }

    fn delete(&self, path: &str) -> bool {
        let removed = self.lock().hashtable.remove(path).is_some();
        tracing::info!(
            "Removed {} record from the store: {}",
            if removed { 1 } else { 0 },
            path
        );
        removed
    }

    fn priority_updates(&self) -> Vec<String> {
        let inner = self.lock();
        let drifted: Vec<String> = inner
            .hashtable
            .values()
            .filter(|r| {
                r.target_hash
                    .as_ref()
                    .is_some_and(|target| *target != r.current_hash)
            })
            .map(|r| r.path.clone())
            .collect();
        drop(inner);

        if drifted.is_empty() {
            tracing::debug!("All hashes in the store are in sync");
            return Vec::new();
        }
        prune_to_ancestors(drifted)
    }

    fn find_orphans(&self) -> Vec<String> {
        let records: Vec<HashRecord> = self.lock().hashtable.values().cloned().collect();
        compute_orphans(&records)
    }

    fn find_untracked(&self) -> Vec<String> {
        let records: Vec<HashRecord> = self.lock().hashtable.values().cloned().collect();
        compute_untracked(&records)
    }

    fn put_log(&self, entry: &LogEntry) -> Option<i64> {
        if entry.summary_message.trim().is_empty() {
            tracing::debug!("No summary message provided, skipping log entry");
            return None;
        }
        let site_id = if entry.site_id.is_empty() {
            self.default_site.clone()
        } else {
            entry.site_id.clone()
        };
        if site_id.len() > MAX_SITE_ID_LEN {
            tracing::debug!("site_id must be at most 5 characters, skipping log entry");
            return None;
        }

        let mut inner = self.lock();
        let log_id = inner.next_log_id;
        inner.next_log_id += 1;
        inner.logs.push(LogEntry {
            log_id,
            site_id,
            timestamp: if entry.timestamp > 0 {
                entry.timestamp
            } else {
                now_epoch()
            },
            log_level: entry.log_level,
            summary_message: entry.summary_message.clone(),
            detailed_message: entry.detailed_message.clone(),
            session_id: entry.session_id.clone(),
        });
        tracing::debug!("Entry inserted into logs table: {}", log_id);
        Some(log_id)
    }

    fn get_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        query.validate()?;

        let inner = self.lock();
        let cutoff = query.older_than_days.map(|days| now_epoch() - days * 86400);
        let mut result: Vec<LogEntry> = inner
            .logs
            .iter()
            .filter(|entry| match &query.session_id {
                None => true,
                Some(SessionFilter::IsNull) => entry.session_id.is_none(),
                Some(SessionFilter::Equals(sid)) => entry.session_id.as_deref() == Some(sid),
            })
            .filter(|entry| cutoff.is_none_or(|cut| entry.timestamp < cut))
            .cloned()
            .collect();
        drop(inner);

        result.sort_by(|a, b| {
            let ordering = match query.order_by {
                LogOrderBy::LogId => a.log_id.cmp(&b.log_id),
                LogOrderBy::Timestamp => a.timestamp.cmp(&b.timestamp),
                LogOrderBy::LogLevel => a.log_level.cmp(&b.log_level),
                LogOrderBy::SiteId => a.site_id.cmp(&b.site_id),
            };
            match query.order_dir {
                OrderDir::Asc => ordering,
                OrderDir::Desc => ordering.reverse(),
            }
        });

        let offset = query.offset.min(result.len());
        let mut result = result.split_off(offset);
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    fn delete_logs(&self, log_ids: &[i64]) -> (Vec<i64>, Vec<i64>) {
        let mut inner = self.lock();
        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for &log_id in log_ids {
            let before = inner.logs.len();
            inner.logs.retain(|entry| entry.log_id != log_id);
            if inner.logs.len() < before {
                deleted.push(log_id);
            } else {
                failed.push(log_id);
            }
        }
        (deleted, failed)
    }

    fn consolidate_logs(&self) -> bool {
        let mut inner = self.lock();

        let mut sessions: BTreeMap<String, Vec<LogEntry>> = BTreeMap::new();
        for entry in &inner.logs {
            if let Some(sid) = &entry.session_id {
                sessions.entry(sid.clone()).or_default().push(entry.clone());
            }
        }
        if sessions.is_empty() {
            return true;
        }

        inner.logs.retain(|entry| entry.session_id.is_none());
        for (session_id, entries) in sessions {
            let first = entries.iter().map(|e| e.timestamp).min().unwrap_or(0);
            let last = entries.iter().map(|e| e.timestamp).max().unwrap_or(0);
            let site_id = entries[0].site_id.clone();
            let detail = serde_json::json!({
                "session_id": session_id,
                "entries": entries.len(),
                "first_timestamp": first,
                "last_timestamp": last,
            });

            let log_id = inner.next_log_id;
            inner.next_log_id += 1;
            inner.logs.push(LogEntry {
                log_id,
                site_id,
                timestamp: now_epoch(),
                log_level: LogLevel::Info,
                summary_message: format!("Consolidated session {}", session_id),
                detailed_message: Some(detail.to_string()),
                session_id: None,
            });
        }
        true
    }

    fn health(&self) -> BTreeMap<String, bool> {
        BTreeMap::from([("database".to_string(), self.lock().healthy)])
    }
}

impl CoreOps for MemoryStore {
    fn pipeline_updates(&self) -> Option<Vec<PipelineUpdate>> {
        Some(self.lock().pipeline.clone())
    }

    fn put_pipeline_hash(&self, update_path: &str, hash_value: &str) -> bool {
        let mut inner = self.lock();
        for update in inner.pipeline.iter_mut() {
            if update.update_path == update_path && update.hash_value.is_none() {
                update.hash_value = Some(hash_value.to_string());
                return true;
            }
        }
        false
    }

    fn sync_sites(&self) -> Option<usize> {
        let mut inner = self.lock();
        inner.sites = inner.official_sites.clone();
        Some(inner.sites.len())
    }

    fn put_remote_status(
        &self,
        site_name: &str,
        updates: &[RemoteStatusUpdate],
        drop_previous: bool,
        _root_path: Option<&str>,
    ) -> Option<usize> {
        let mut inner = self.lock();
        let rows = inner.remote_status.entry(site_name.to_string()).or_default();
        if drop_previous {
            rows.clear();
        }
        rows.extend(updates.iter().cloned());
        Some(updates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_insert_then_touch_then_migrate() {
        let store = MemoryStore::new("local");

        let changes = store
            .upsert(&HashRecord::new("/b/f", "h1"))
            .unwrap()
            .unwrap();
        assert_eq!(changes.created, vec!["/b/f"]);

        let first = store.get("/b/f").unwrap();
        assert_eq!(first.current_dtg_first, first.current_dtg_latest);
        assert_eq!(first.prev_hash, None);

        // Same hash: touch only.
        let changes = store
            .upsert(&HashRecord::new("/b/f", "h1"))
            .unwrap()
            .unwrap();
        assert!(changes.is_empty());
        let touched = store.get("/b/f").unwrap();
        assert_eq!(touched.current_dtg_first, first.current_dtg_first);
        assert_eq!(touched.prev_hash, None);

        // New hash: history migrates atomically.
        let changes = store
            .upsert(&HashRecord::new("/b/f", "h2"))
            .unwrap()
            .unwrap();
        assert_eq!(changes.modified, vec!["/b/f"]);
        let migrated = store.get("/b/f").unwrap();
        assert_eq!(migrated.prev_hash.as_deref(), Some("h1"));
        assert_eq!(migrated.prev_dtg_latest, Some(touched.current_dtg_latest));
        assert_eq!(migrated.current_hash, "h2");
        assert!(migrated.prev_dtg_latest.unwrap() <= migrated.current_dtg_latest);
    }

    #[test]
    fn upsert_missing_children_statement_deletes_nothing() {
        let store = MemoryStore::new("local");
        let mut dir = HashRecord::new("/b", "d1");
        dir.files = Some(vec!["f1".to_string(), "f2".to_string()]);
        store.upsert(&dir).unwrap();
        store.upsert(&HashRecord::new("/b/f1", "h1")).unwrap();
        store.upsert(&HashRecord::new("/b/f2", "h2")).unwrap();

        // A target-only update carries no child lists; nothing is pruned.
        let mut target_update = HashRecord::new("/b", "d1");
        target_update.target_hash = Some("t".to_string());
        let changes = store.upsert(&target_update).unwrap().unwrap();
        assert!(changes.deleted.is_empty());
        assert!(store.get("/b/f1").is_some());
        assert_eq!(store.get("/b").unwrap().target_hash.as_deref(), Some("t"));
    }

    #[test]
    fn upsert_dropped_children_are_deleted_recursively() {
        let store = MemoryStore::new("local");
        let mut root = HashRecord::new("/b", "d1");
        root.dirs = Some(vec!["sub".to_string()]);
        root.files = Some(vec!["keep".to_string()]);
        store.upsert(&root).unwrap();

        let mut sub = HashRecord::new("/b/sub", "d2");
        sub.files = Some(vec!["inner".to_string()]);
        store.upsert(&sub).unwrap();
        store.upsert(&HashRecord::new("/b/sub/inner", "h")).unwrap();
        store.upsert(&HashRecord::new("/b/keep", "h")).unwrap();

        let mut updated = HashRecord::new("/b", "d3");
        updated.dirs = Some(vec![]);
        updated.files = Some(vec!["keep".to_string()]);
        let changes = store.upsert(&updated).unwrap().unwrap();

        assert_eq!(changes.deleted, vec!["/b/sub", "/b/sub/inner"]);
        assert!(store.get("/b/sub").is_none());
        assert!(store.get("/b/sub/inner").is_none());
        assert!(store.get("/b/keep").is_some());
    }

    #[test]
    fn priority_updates_prunes_ancestors() {
        let store = MemoryStore::new("local");
        for path in ["/a", "/a/b", "/a/b/c"] {
            let mut record = HashRecord::new(path, "current");
            record.target_hash = Some("expected".to_string());
            store.upsert(&record).unwrap();
        }
        assert_eq!(store.priority_updates(), vec!["/a"]);
    }

    #[test]
    fn priority_updates_ignores_in_sync_rows() {
        let store = MemoryStore::new("local");
        let mut synced = HashRecord::new("/a", "same");
        synced.target_hash = Some("same".to_string());
        store.upsert(&synced).unwrap();
        store.upsert(&HashRecord::new("/b", "no-target")).unwrap();
        assert!(store.priority_updates().is_empty());
    }

    #[test]
    fn oldest_updates_hundred_percent_returns_all_children() {
        let store = MemoryStore::new("local");
        let mut root = HashRecord::new("/b", "d");
        root.files = Some(vec!["f1".to_string(), "f2".to_string(), "f3".to_string()]);
        store.upsert(&root).unwrap();
        store.upsert(&HashRecord::new("/b/f2", "h")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        store.upsert(&HashRecord::new("/b/f1", "h")).unwrap();

        let oldest = store.oldest_updates("/b", 100);
        // f3 has no record (timestamp 0), then f2, then f1.
        assert_eq!(oldest, vec!["/b/f3", "/b/f2", "/b/f1"]);
    }

    #[test]
    fn oldest_updates_unknown_root_returns_root() {
        let store = MemoryStore::new("local");
        assert_eq!(store.oldest_updates("/nope", 10), vec!["/nope"]);
    }

    #[test]
    fn oldest_updates_returns_at_least_one() {
        let store = MemoryStore::new("local");
        let mut root = HashRecord::new("/b", "d");
        root.files = Some(vec!["f1".to_string(), "f2".to_string()]);
        store.upsert(&root).unwrap();

        assert_eq!(store.oldest_updates("/b", 10).len(), 1);
    }

    #[test]
    fn put_log_assigns_ids_and_defaults_site() {
        let store = MemoryStore::new("SITE1");
        let id1 = store.put_log(&LogEntry::new("first")).unwrap();
        let id2 = store.put_log(&LogEntry::new("second")).unwrap();
        assert!(id2 > id1);

        let logs = store.get_logs(&LogQuery::default()).unwrap();
        assert!(logs.iter().all(|entry| entry.site_id == "SITE1"));
    }

    #[test]
    fn put_log_rejects_empty_summary_and_long_site() {
        let store = MemoryStore::new("local");
        assert!(store.put_log(&LogEntry::new("")).is_none());
        assert!(store
            .put_log(&LogEntry::new("x").with_site("TOOLONG"))
            .is_none());
    }

    #[test]
    fn shippable_logs_are_null_session_only() {
        let store = MemoryStore::new("local");
        store.put_log(&LogEntry::new("loose")).unwrap();
        store
            .put_log(&LogEntry::new("tagged").with_session("s-1"))
            .unwrap();

        let shippable = store.shippable_logs();
        assert_eq!(shippable.len(), 1);
        assert_eq!(shippable[0].summary_message, "loose");
    }

    #[test]
    fn delete_logs_reports_partial_failure() {
        let store = MemoryStore::new("local");
        let id = store.put_log(&LogEntry::new("x")).unwrap();
        let (deleted, failed) = store.delete_logs(&[id, 9999]);
        assert_eq!(deleted, vec![id]);
        assert_eq!(failed, vec![9999]);
    }

    #[test]
    fn consolidate_is_idempotent() {
        let store = MemoryStore::new("local");
        store
            .put_log(&LogEntry::new("a").with_session("s-1"))
            .unwrap();
        store
            .put_log(&LogEntry::new("b").with_session("s-1"))
            .unwrap();
        store.put_log(&LogEntry::new("loose")).unwrap();

        assert!(store.consolidate_logs());
        let after_first = store.get_logs(&LogQuery::default()).unwrap();
        // Two session rows collapsed into one summary; loose row untouched.
        assert_eq!(after_first.len(), 2);
        assert!(after_first.iter().all(|entry| entry.session_id.is_none()));

        assert!(store.consolidate_logs());
        let after_second = store.get_logs(&LogQuery::default()).unwrap();
        assert_eq!(after_first.len(), after_second.len());
    }

    #[test]
    fn pipeline_hash_marks_first_unprocessed_row() {
        let store = MemoryStore::new("local");
        store.seed_pipeline(vec![
            PipelineUpdate {
                id: 1,
                update_path: "/b/pkg".to_string(),
                ..Default::default()
            },
            PipelineUpdate {
                id: 2,
                update_path: "/b/pkg".to_string(),
                ..Default::default()
            },
        ]);

        assert!(store.put_pipeline_hash("/b/pkg", "abc"));
        let updates = store.pipeline_updates().unwrap();
        assert_eq!(updates[0].hash_value.as_deref(), Some("abc"));
        assert_eq!(updates[1].hash_value, None);
        assert!(!store.put_pipeline_hash("/b/missing", "abc"));
    }

    #[test]
    fn remote_status_replaces_or_appends() {
        let store = MemoryStore::new("local");
        let row = |p: &str| RemoteStatusUpdate {
            path: p.to_string(),
            local_hash: Some("l".to_string()),
            core_hash: Some("c".to_string()),
        };

        store.put_remote_status("SITE2", &[row("/b/x")], true, None);
        store.put_remote_status("SITE2", &[row("/b/y")], false, None);
        assert_eq!(store.remote_status_for("SITE2").len(), 2);

        store.put_remote_status("SITE2", &[row("/b/z")], true, None);
        assert_eq!(store.remote_status_for("SITE2").len(), 1);
    }
}
