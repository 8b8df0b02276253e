//! Sqlite store backend.
//!
//! The production backend on every site. One connection behind a mutex is
//! the single point of serialization: the upsert's history migration runs
//! inside a transaction, so a concurrent reader sees either the old row or
//! the fully migrated one, never a half-updated record.
//!
//! Upsert case analysis (the heart of the store):
//!
//! 1. no existing row        -> insert, `current_dtg_first = latest = now`,
//!                              emit *created*
//! 2. hash unchanged         -> touch `current_dtg_latest` only
//! 3. hash changed           -> migrate (current_hash, current_dtg_latest)
//!                              to (prev_hash, prev_dtg_latest), reset
//!                              first = latest = now, overwrite child lists,
//!                              emit *modified*
//!
//! In cases 2 and 3, child names present in the stored lists but absent from
//! the incoming ones are deleted recursively (*deleted* changes). A category
//! the caller omitted entirely (None) makes no statement and prunes nothing.
//! An incoming `target_hash` always lands: the authority writes expectations
//! through the same upsert path the engine uses.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::record::{
    join_children, now_epoch, split_children, ChangeSet, HashRecord, LogEntry, LogLevel, LogQuery,
    SessionFilter, CHILD_CATEGORIES, MAX_SITE_ID_LEN,
};
use crate::store::{compute_orphans, compute_untracked, prune_to_ancestors, Store};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hashtable (
    path                TEXT PRIMARY KEY,
    current_hash        TEXT NOT NULL,
    current_dtg_latest  INTEGER NOT NULL,
    current_dtg_first   INTEGER NOT NULL,
    prev_hash           TEXT,
    prev_dtg_latest     INTEGER,
    target_hash         TEXT,
    dirs                TEXT,
    files               TEXT,
    links               TEXT,
    session_id          TEXT
);
CREATE TABLE IF NOT EXISTS logs (
    log_id              INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id             TEXT NOT NULL,
    log_level           TEXT NOT NULL DEFAULT 'INFO',
    timestamp           INTEGER NOT NULL,
    summary_message     TEXT NOT NULL,
    detailed_message    TEXT,
    session_id          TEXT
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    default_site: String,
}

impl SqliteStore {
    /// Open or create the store database.
    pub fn open(db_path: &Path, default_site: impl Into<String>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            default_site: default_site.into(),
        })
    }

    /// Private database for tests.
    pub fn open_in_memory(default_site: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            default_site: default_site.into(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<HashRecord> {
        Ok(HashRecord {
            path: row.get("path")?,
            current_hash: row.get("current_hash")?,
            current_dtg_latest: row.get("current_dtg_latest")?,
            current_dtg_first: row.get("current_dtg_first")?,
            prev_hash: row.get("prev_hash")?,
            prev_dtg_latest: row.get("prev_dtg_latest")?,
            target_hash: row.get("target_hash")?,
            dirs: split_children(row.get::<_, Option<String>>("dirs")?.as_deref()),
            files: split_children(row.get::<_, Option<String>>("files")?.as_deref()),
            links: split_children(row.get::<_, Option<String>>("links")?.as_deref()),
            session_id: row.get("session_id")?,
        })
    }

    fn get_field<T: rusqlite::types::FromSql>(&self, path: &str, column: &str) -> Option<T> {
        let conn = self.lock();
        let sql = format!("SELECT {column} FROM hashtable WHERE path = ?1");
        match conn
            .query_row(&sql, params![path], |row| row.get::<_, T>(0))
            .optional()
        {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Error fetching {} for {}: {}", column, path, e);
                None
            }
        }
    }

    fn all_records(&self) -> Vec<HashRecord> {
        let conn = self.lock();
        let result = (|| -> rusqlite::Result<Vec<HashRecord>> {
            let mut stmt = conn.prepare("SELECT * FROM hashtable")?;
            let rows = stmt.query_map([], Self::row_to_record)?;
            rows.collect()
        })();
        match result {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Error loading hashtable rows: {}", e);
                Vec::new()
            }
        }
    }

    /// Delete `path` and, transitively, everything its stored child lists
    /// reach. Runs inside the caller's transaction.
    fn delete_subtree(
        tx: &Transaction<'_>,
        path: &str,
        deleted: &mut Vec<String>,
    ) -> rusqlite::Result<()> {
        let mut stack = vec![path.to_string()];
        while let Some(current) = stack.pop() {
            let children: Option<(Option<String>, Option<String>, Option<String>)> = tx
                .query_row(
                    "SELECT dirs, files, links FROM hashtable WHERE path = ?1",
                    params![current],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((dirs, files, links)) = children else {
                continue;
            };
            tx.execute("DELETE FROM hashtable WHERE path = ?1", params![current])?;
            deleted.push(current.clone());
            for joined in [dirs, files, links] {
                for name in split_children(joined.as_deref()).unwrap_or_default() {
                    stack.push(crate::paths::join(&current, &name));
                }
            }
        }
        Ok(())
    }

    fn upsert_tx(tx: &Transaction<'_>, record: &HashRecord) -> rusqlite::Result<ChangeSet> {
        let path = record.path.trim();
        let current_hash = record.current_hash.trim();
        let now = now_epoch();
        let mut changes = ChangeSet::default();

        let existing: Option<(String, Option<String>, Option<String>, Option<String>)> = tx
            .query_row(
                "SELECT current_hash, dirs, files, links FROM hashtable WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        // Child paths the incoming lists no longer claim. A hash-changed
        // update overwrites the stored lists, so an omitted category prunes
        // everything it used to claim; a hash-unchanged touch leaves the
        // lists alone and an omitted category prunes nothing.
        let mut dropped: Vec<String> = Vec::new();
        if let Some((ref stored_hash, ref dirs, ref files, ref links)) = existing {
            let changed = stored_hash != current_hash;
            let stored = [dirs, files, links];
            for (category, joined) in CHILD_CATEGORIES.iter().zip(stored) {
                let Some(old) = split_children(joined.as_deref()) else {
                    continue;
                };
                let empty: Vec<String> = Vec::new();
                let new = match record.children(category) {
                    Some(list) => list,
                    None if changed => &empty,
                    None => continue,
                };
                for name in &old {
                    if !new.contains(name) {
                        dropped.push(crate::paths::join(path, name));
                    }
                }
            }
        }

        match existing {
            None => {
                tracing::info!("Inserting new record for path: {}", path);
                changes.created.push(path.to_string());
                tx.execute(
                    "INSERT INTO hashtable (path, current_hash, current_dtg_latest,
                                            current_dtg_first, target_hash, dirs, files,
                                            links, session_id)
                     VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        path,
                        current_hash,
                        now,
                        record.target_hash,
                        join_children(record.dirs.as_ref()),
                        join_children(record.files.as_ref()),
                        join_children(record.links.as_ref()),
                        record.session_id,
                    ],
                )?;
            }
            Some((ref stored_hash, ..)) if stored_hash == current_hash => {
                tracing::debug!("Existing record, hash unchanged: {}", path);
                tx.execute(
                    "UPDATE hashtable
                     SET current_dtg_latest = ?2,
                         target_hash        = COALESCE(?3, target_hash)
                     WHERE path = ?1",
                    params![path, now, record.target_hash],
                )?;
            }
            Some(_) => {
                tracing::info!("Existing record, hash has changed: {}", path);
                changes.modified.push(path.to_string());
                tx.execute(
                    "UPDATE hashtable
                     SET prev_hash          = current_hash,
                         prev_dtg_latest    = current_dtg_latest,
                         current_hash       = ?2,
                         current_dtg_latest = ?3,
                         current_dtg_first  = ?3,
                         dirs               = ?4,
                         files              = ?5,
                         links              = ?6,
                         target_hash        = COALESCE(?7, target_hash),
                         session_id         = COALESCE(?8, session_id)
                     WHERE path = ?1",
                    params![
                        path,
                        current_hash,
                        now,
                        join_children(record.dirs.as_ref()),
                        join_children(record.files.as_ref()),
                        join_children(record.links.as_ref()),
                        record.target_hash,
                        record.session_id,
                    ],
                )?;
            }
        }

        for child_path in dropped {
            Self::delete_subtree(tx, &child_path, &mut changes.deleted)?;
        }
        changes.created.sort();
        changes.modified.sort();
        changes.deleted.sort();
        Ok(changes)
    }
}

impl Store for SqliteStore {
    fn get(&self, path: &str) -> Option<HashRecord> {
        let conn = self.lock();
        match conn
            .query_row(
                "SELECT * FROM hashtable WHERE path = ?1",
                params![path],
                Self::row_to_record,
            )
            .optional()
        {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Error fetching record for {}: {}", path, e);
                None
            }
        }
    }

    fn get_hash(&self, path: &str) -> Option<String> {
        self.get_field(path, "current_hash")
    }

    fn get_timestamp(&self, path: &str) -> Option<i64> {
        self.get_field(path, "current_dtg_latest")
    }

    fn upsert(&self, record: &HashRecord) -> Result<Option<ChangeSet>> {
        record.validate()?;

        let mut conn = self.lock();
        let result = (|| -> rusqlite::Result<ChangeSet> {
            let tx = conn.transaction()?;
            let changes = Self::upsert_tx(&tx, record)?;
            tx.commit()?;
            Ok(changes)
        })();
        match result {
            Ok(changes) => Ok(Some(changes)),
            Err(e) => {
                tracing::error!("Error inserting/updating record for {}: {}", record.path, e);
                Ok(None)
            }
        }
    }

    fn delete(&self, path: &str) -> bool {
        let conn = self.lock();
        match conn.execute("DELETE FROM hashtable WHERE path = ?1", params![path]) {
            Ok(rows) => {
                tracing::info!("Removed {} record from the store: {}", rows, path);
                rows > 0
            }
            Err(e) => {
                tracing::error!("Error deleting hash entry for {}: {}", path, e);
                false
            }
        }
    }

    fn priority_updates(&self) -> Vec<String> {
        let conn = self.lock();
        let result = (|| -> rusqlite::Result<Vec<String>> {
            let mut stmt = conn.prepare(
                "SELECT path FROM hashtable
                 WHERE target_hash IS NOT NULL AND target_hash != current_hash",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })();
        drop(conn);

        match result {
            Ok(paths) if paths.is_empty() => {
                tracing::debug!("All hashes in the store are in sync");
                Vec::new()
            }
            Ok(paths) => prune_to_ancestors(paths),
            Err(e) => {
                tracing::error!("Error fetching priority updates: {}", e);
                Vec::new()
            }
        }
    }

    fn find_orphans(&self) -> Vec<String> {
        compute_orphans(&self.all_records())
    }

    fn find_untracked(&self) -> Vec<String> {
        compute_untracked(&self.all_records())
    }

    fn put_log(&self, entry: &LogEntry) -> Option<i64> {
        if entry.summary_message.trim().is_empty() {
            tracing::debug!("No summary message provided, skipping log entry");
            return None;
        }
        let site_id = if entry.site_id.is_empty() {
            self.default_site.as_str()
        } else {
            entry.site_id.as_str()
        };
        if site_id.len() > MAX_SITE_ID_LEN {
            tracing::debug!("site_id must be at most 5 characters, skipping log entry");
            return None;
        }
        let timestamp = if entry.timestamp > 0 {
            entry.timestamp
        } else {
            now_epoch()
        };

        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO logs (site_id, log_level, timestamp, summary_message,
                               detailed_message, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                site_id,
                entry.log_level.as_str(),
                timestamp,
                entry.summary_message,
                entry.detailed_message,
                entry.session_id,
            ],
        );
        match result {
            Ok(_) => {
                let log_id = conn.last_insert_rowid();
                tracing::debug!("Entry inserted into logs table: {}", log_id);
                Some(log_id)
            }
            Err(e) => {
                tracing::error!("Error inserting log entry: {}", e);
                None
            }
        }
    }

    fn get_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        query.validate()?;

        let mut sql = String::from("SELECT * FROM logs");
        let mut clauses: Vec<String> = Vec::new();
        let mut bindings: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        match &query.session_id {
            Some(SessionFilter::IsNull) => clauses.push("session_id IS NULL".to_string()),
            Some(SessionFilter::Equals(sid)) => {
                bindings.push(Box::new(sid.clone()));
                clauses.push(format!("session_id = ?{}", bindings.len()));
            }
            None => {}
        }
        if let Some(days) = query.older_than_days {
            bindings.push(Box::new(now_epoch() - days * 86400));
            clauses.push(format!("timestamp < ?{}", bindings.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        // Column and direction come from validated enums, never from input.
        sql.push_str(&format!(
            " ORDER BY {} {}",
            query.order_by.column(),
            query.order_dir.keyword()
        ));
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if query.offset > 0 {
            if query.limit.is_none() {
                sql.push_str(" LIMIT -1");
            }
            sql.push_str(&format!(" OFFSET {}", query.offset));
        }

        let conn = self.lock();
        let result = (|| -> rusqlite::Result<Vec<LogEntry>> {
            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(bindings.iter().map(|b| b.as_ref()));
            let rows = stmt.query_map(params, |row| {
                Ok(LogEntry {
                    log_id: row.get("log_id")?,
                    site_id: row.get("site_id")?,
                    log_level: LogLevel::parse_lenient(&row.get::<_, String>("log_level")?),
                    timestamp: row.get("timestamp")?,
                    summary_message: row.get("summary_message")?,
                    detailed_message: row.get("detailed_message")?,
                    session_id: row.get("session_id")?,
                })
            })?;
            rows.collect()
        })();
        match result {
            Ok(entries) => {
                tracing::debug!("Retrieved {} log records", entries.len());
                Ok(entries)
            }
            Err(e) => {
                tracing::error!("Error fetching log records: {}", e);
                Ok(Vec::new())
            }
        }
    }

    fn delete_logs(&self, log_ids: &[i64]) -> (Vec<i64>, Vec<i64>) {
        let conn = self.lock();
        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for &log_id in log_ids {
            match conn.execute("DELETE FROM logs WHERE log_id = ?1", params![log_id]) {
                Ok(rows) if rows > 0 => deleted.push(log_id),
                Ok(_) => failed.push(log_id),
                Err(e) => {
                    tracing::error!("Error deleting log entry #{}: {}", log_id, e);
                    failed.push(log_id);
                }
            }
        }
        (deleted, failed)
    }

    fn consolidate_logs(&self) -> bool {
        let mut conn = self.lock();
        let result = (|| -> rusqlite::Result<()> {
            let tx = conn.transaction()?;

            let mut sessions: BTreeMap<String, (usize, i64, i64, String)> = BTreeMap::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT session_id, timestamp, site_id FROM logs
                     WHERE session_id IS NOT NULL ORDER BY log_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                for row in rows {
                    let (sid, timestamp, site_id) = row?;
                    let slot = sessions
                        .entry(sid)
                        .or_insert((0, i64::MAX, i64::MIN, site_id));
                    slot.0 += 1;
                    slot.1 = slot.1.min(timestamp);
                    slot.2 = slot.2.max(timestamp);
                }
            }
            if sessions.is_empty() {
                return tx.commit();
            }

            tx.execute("DELETE FROM logs WHERE session_id IS NOT NULL", [])?;
            for (session_id, (count, first, last, site_id)) in sessions {
                let detail = serde_json::json!({
                    "session_id": session_id,
                    "entries": count,
                    "first_timestamp": first,
                    "last_timestamp": last,
                });
                tx.execute(
                    "INSERT INTO logs (site_id, log_level, timestamp, summary_message,
                                       detailed_message, session_id)
                     VALUES (?1, 'INFO', ?2, ?3, ?4, NULL)",
                    params![
                        site_id,
                        now_epoch(),
                        format!("Consolidated session {}", session_id),
                        detail.to_string(),
                    ],
                )?;
            }
            tx.commit()
        })();
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Error consolidating logs: {}", e);
                false
            }
        }
    }

    fn health(&self) -> BTreeMap<String, bool> {
        let conn = self.lock();
        let alive = conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok();
        if !alive {
            tracing::error!("Sqlite store failed liveness probe");
        }
        BTreeMap::from([("database".to_string(), alive)])
    }
}
