//! Core-site pipeline store.
//!
//! The continuous-delivery pipeline publishes authorized baseline updates
//! into a store the core consumes read-mostly: the coordinator reads the
//! unprocessed updates, fingerprints them, and writes the hash back; the
//! dashboard reads the site list and the per-site status rows remote
//! coordinators report.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::record::{now_epoch, PipelineUpdate, RemoteStatusUpdate};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pipeline_updates (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    TC_id           TEXT NOT NULL DEFAULT '',
    timestamp       INTEGER NOT NULL,
    update_path     TEXT NOT NULL,
    update_size     INTEGER NOT NULL DEFAULT 0,
    hash_value      TEXT
);
CREATE TABLE IF NOT EXISTS sites (
    site_name       TEXT PRIMARY KEY,
    synced_at       INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS official_sites (
    site_name       TEXT PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS remote_status (
    site_name       TEXT NOT NULL,
    path            TEXT NOT NULL,
    local_hash      TEXT,
    core_hash       TEXT,
    reported_at     INTEGER NOT NULL
);
";

pub struct PipelineStore {
    conn: Mutex<Connection>,
}

impl PipelineStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(PipelineStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(PipelineStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All authorized update records, oldest first. `hash_value` is None on
    /// rows the core has not fingerprinted yet.
    pub fn updates(&self) -> Option<Vec<PipelineUpdate>> {
        let conn = self.lock();
        let result = (|| -> rusqlite::Result<Vec<PipelineUpdate>> {
            let mut stmt = conn.prepare(
                "SELECT id, TC_id, timestamp, update_path, update_size, hash_value
                 FROM pipeline_updates ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(PipelineUpdate {
                    id: row.get(0)?,
                    tc_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    update_path: row.get(3)?,
                    update_size: row.get(4)?,
                    hash_value: row.get(5)?,
                })
            })?;
            rows.collect()
        })();
        match result {
            Ok(updates) => Some(updates),
            Err(e) => {
                tracing::error!("Error fetching pipeline updates: {}", e);
                None
            }
        }
    }

    /// Set `hash_value` on the first matching unprocessed row.
    pub fn put_hash(&self, update_path: &str, hash_value: &str) -> bool {
        let conn = self.lock();
        let result = conn.execute(
            "UPDATE pipeline_updates SET hash_value = ?2
             WHERE id = (SELECT id FROM pipeline_updates
                         WHERE update_path = ?1 AND hash_value IS NULL
                         ORDER BY id LIMIT 1)",
            params![update_path, hash_value],
        );
        match result {
            Ok(rows) => rows > 0,
            Err(e) => {
                tracing::error!("Error updating pipeline hash for {}: {}", update_path, e);
                false
            }
        }
    }

    /// Append one authorized update (the pipeline's write path; also used by
    /// tests to seed the feed).
    pub fn publish_update(&self, update_path: &str, tc_id: &str, update_size: i64) -> Option<i64> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO pipeline_updates (TC_id, timestamp, update_path, update_size)
             VALUES (?1, ?2, ?3, ?4)",
            params![tc_id, now_epoch(), update_path, update_size],
        );
        match result {
            Ok(_) => Some(conn.last_insert_rowid()),
            Err(e) => {
                tracing::error!("Error publishing pipeline update for {}: {}", update_path, e);
                None
            }
        }
    }

    pub fn official_sites(&self) -> Option<Vec<String>> {
        let conn = self.lock();
        let result = (|| -> rusqlite::Result<Vec<String>> {
            let mut stmt =
                conn.prepare("SELECT site_name FROM official_sites ORDER BY site_name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })();
        match result {
            Ok(sites) => Some(sites),
            Err(e) => {
                tracing::error!("Error fetching official sites: {}", e);
                None
            }
        }
    }

    pub fn add_official_site(&self, site_name: &str) -> bool {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO official_sites (site_name) VALUES (?1)",
            params![site_name],
        )
        .is_ok()
    }

    /// Upsert the authoritative site list into the local sites table.
    /// Returns the number of sites synced.
    pub fn sync_sites(&self) -> Option<usize> {
        let sites = self.official_sites()?;
        let mut conn = self.lock();
        let result = (|| -> rusqlite::Result<()> {
            let tx = conn.transaction()?;
            let now = now_epoch();
            for site in &sites {
                tx.execute(
                    "INSERT INTO sites (site_name, synced_at) VALUES (?1, ?2)
                     ON CONFLICT(site_name) DO UPDATE SET synced_at = ?2",
                    params![site, now],
                )?;
            }
            tx.commit()
        })();
        match result {
            Ok(()) => {
                tracing::info!("Synced {} sites from the pipeline store", sites.len());
                Some(sites.len())
            }
            Err(e) => {
                tracing::error!("Error syncing sites table: {}", e);
                None
            }
        }
    }

    /// Record a status report from a named site by refreshing its sync time.
    pub fn touch_site(&self, site_name: &str) -> bool {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO sites (site_name, synced_at) VALUES (?1, ?2)
             ON CONFLICT(site_name) DO UPDATE SET synced_at = ?2",
            params![site_name, now_epoch()],
        );
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Error recording site status for {}: {}", site_name, e);
                false
            }
        }
    }

    /// Replace (or append to) one remote site's status segment.
    pub fn put_remote_status(
        &self,
        site_name: &str,
        updates: &[RemoteStatusUpdate],
        drop_previous: bool,
        root_path: Option<&str>,
    ) -> Option<usize> {
        let mut conn = self.lock();
        let result = (|| -> rusqlite::Result<usize> {
            let tx = conn.transaction()?;
            if drop_previous {
                match root_path {
                    // Scoped replace: only rows under the reported subtree.
                    Some(root) => {
                        tx.execute(
                            "DELETE FROM remote_status
                             WHERE site_name = ?1 AND (path = ?2 OR path LIKE ?3)",
                            params![site_name, root, format!("{}/%", root.trim_end_matches('/'))],
                        )?;
                    }
                    None => {
                        tx.execute(
                            "DELETE FROM remote_status WHERE site_name = ?1",
                            params![site_name],
                        )?;
                    }
                }
            }
            let now = now_epoch();
            for update in updates {
                tx.execute(
                    "INSERT INTO remote_status (site_name, path, local_hash, core_hash, reported_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![site_name, update.path, update.local_hash, update.core_hash, now],
                )?;
            }
            tx.commit()?;
            Ok(updates.len())
        })();
        match result {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::error!("Error storing remote status for {}: {}", site_name, e);
                None
            }
        }
    }

    /// One remote site's current status rows, for the dashboard.
    pub fn remote_status_for(&self, site_name: &str) -> Vec<RemoteStatusUpdate> {
        let conn = self.lock();
        let result = (|| -> rusqlite::Result<Vec<RemoteStatusUpdate>> {
            let mut stmt = conn.prepare(
                "SELECT path, local_hash, core_hash FROM remote_status
                 WHERE site_name = ?1 ORDER BY path",
            )?;
            let rows = stmt.query_map(params![site_name], |row| {
                Ok(RemoteStatusUpdate {
                    path: row.get(0)?,
                    local_hash: row.get(1)?,
                    core_hash: row.get(2)?,
                })
            })?;
            rows.collect()
        })();
        result.unwrap_or_else(|e| {
            tracing::error!("Error fetching remote status for {}: {}", site_name, e);
            Vec::new()
        })
    }

    /// Latest sync time per site, for the dashboard liveness view.
    pub fn site_liveness(&self) -> BTreeMap<String, i64> {
        let conn = self.lock();
        let result = (|| -> rusqlite::Result<BTreeMap<String, i64>> {
            let mut stmt = conn.prepare("SELECT site_name, synced_at FROM sites")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })();
        result.unwrap_or_else(|e| {
            tracing::error!("Error fetching site liveness: {}", e);
            BTreeMap::new()
        })
    }

    pub fn health(&self) -> bool {
        let conn = self.lock();
        let alive = conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .optional()
            .is_ok();
        if !alive {
            tracing::error!("Pipeline store failed liveness probe");
        }
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_hash_first_unprocessed() {
        let store = PipelineStore::open_in_memory().unwrap();
        store.publish_update("/b/pkg", "TC-1", 1024).unwrap();
        store.publish_update("/b/pkg", "TC-2", 2048).unwrap();

        assert!(store.put_hash("/b/pkg", "abc"));
        let updates = store.updates().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].hash_value.as_deref(), Some("abc"));
        assert_eq!(updates[1].hash_value, None);

        // Second call takes the remaining unprocessed row.
        assert!(store.put_hash("/b/pkg", "def"));
        assert!(!store.put_hash("/b/pkg", "ghi"));
        assert!(!store.put_hash("/b/other", "x"));
    }

    #[test]
    fn sync_sites_copies_official_list() {
        let store = PipelineStore::open_in_memory().unwrap();
        store.add_official_site("SITE1");
        store.add_official_site("SITE2");

        assert_eq!(store.sync_sites(), Some(2));
        let liveness = store.site_liveness();
        assert_eq!(liveness.len(), 2);
        assert!(liveness.contains_key("SITE1"));

        // Re-sync updates timestamps without duplicating rows.
        assert_eq!(store.sync_sites(), Some(2));
        assert_eq!(store.site_liveness().len(), 2);
    }

    #[test]
    fn remote_status_scoped_replace() {
        let store = PipelineStore::open_in_memory().unwrap();
        let row = |p: &str| RemoteStatusUpdate {
            path: p.to_string(),
            local_hash: Some("l".to_string()),
            core_hash: Some("c".to_string()),
        };

        store.put_remote_status("SITE2", &[row("/b/x"), row("/b/x/y")], true, None);
        assert_eq!(store.remote_status_for("SITE2").len(), 2);

        // Replacing only the /b/x segment leaves unrelated rows alone.
        store.put_remote_status("SITE2", &[row("/other")], true, None);
        store.put_remote_status("SITE2", &[row("/b/x")], true, Some("/b/x"));
        let rows = store.remote_status_for("SITE2");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.path == "/other"));
        assert!(rows.iter().any(|r| r.path == "/b/x"));
    }

    #[test]
    fn health_probe() {
        let store = PipelineStore::open_in_memory().unwrap();
        assert!(store.health());
    }
}
