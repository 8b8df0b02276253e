//! Store entities: hash records, log entries, change sets, queries.
//!
//! These are the shapes exchanged across the store trait and the REST
//! boundary. Child lists hold immediate child *names* (never paths);
//! `None` means "no statement about children" while `Some(vec![])` means
//! "known to be empty" — the store treats the two differently.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Epoch seconds now.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub const CHILD_CATEGORIES: [&str; 3] = ["dirs", "files", "links"];

// ---------------------------------------------------------------------------
// HashRecord
// ---------------------------------------------------------------------------

/// One tracked path and its fingerprint history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HashRecord {
    pub path: String,
    pub current_hash: String,
    #[serde(default)]
    pub current_dtg_latest: i64,
    #[serde(default)]
    pub current_dtg_first: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_dtg_latest: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl HashRecord {
    /// Minimal record for an upsert: path and fingerprint only.
    pub fn new(path: impl Into<String>, current_hash: impl Into<String>) -> Self {
        HashRecord {
            path: path.into(),
            current_hash: current_hash.into(),
            ..Default::default()
        }
    }

    pub fn children(&self, category: &str) -> Option<&Vec<String>> {
        match category {
            "dirs" => self.dirs.as_ref(),
            "files" => self.files.as_ref(),
            "links" => self.links.as_ref(),
            _ => None,
        }
    }

    /// All child names across categories, in (dirs, files, links) order.
    pub fn all_children(&self) -> Vec<&str> {
        CHILD_CATEGORIES
            .iter()
            .filter_map(|cat| self.children(cat))
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Upsert precondition: non-empty keys and legal child names.
    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            bail!("'path' value must be provided");
        }
        if self.current_hash.trim().is_empty() {
            bail!("'current_hash' value must be provided");
        }
        for category in CHILD_CATEGORIES {
            let Some(names) = self.children(category) else {
                continue;
            };
            for name in names {
                validate_child_name(name)
                    .map_err(|e| anyhow::anyhow!("{} entry for {}: {}", category, self.path, e))?;
            }
        }
        Ok(())
    }
}

/// Child names are stored as comma-joined text, so the characters the codec
/// cannot round-trip are rejected at the boundary.
pub fn validate_child_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("child name must not be empty");
    }
    if name != name.trim() {
        bail!("child name '{}' has leading or trailing whitespace", name);
    }
    if let Some(bad) = name.chars().find(|c| matches!(c, ',' | '[' | ']')) {
        bail!("child name '{}' contains forbidden character '{}'", name, bad);
    }
    Ok(())
}

/// Serialize a child list for a backend without array types.
pub fn join_children(names: Option<&Vec<String>>) -> Option<String> {
    names.map(|list| {
        list.iter()
            .map(|name| name.trim())
            .collect::<Vec<_>>()
            .join(",")
    })
}

/// Parse a comma-joined child list, trimming per element.
pub fn split_children(joined: Option<&str>) -> Option<Vec<String>> {
    joined.map(|text| {
        if text.is_empty() {
            return Vec::new();
        }
        text.split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    })
}

// ---------------------------------------------------------------------------
// Change tracking
// ---------------------------------------------------------------------------

/// Paths touched by one upsert, as seen by the store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Log entries
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "DEBUG")]
    Debug,
    #[default]
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// Unrecognized levels coerce to INFO rather than erroring; the log
    /// pipeline must never drop an entry over a bad level tag.
    pub fn parse_lenient(s: &str) -> LogLevel {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "WARNING" | "WARN" => LogLevel::Warning,
            "ERROR" => LogLevel::Error,
            "CRITICAL" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const MAX_SITE_ID_LEN: usize = 5;

/// One operational audit-trail entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub log_id: i64,
    #[serde(default)]
    pub site_id: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub log_level: LogLevel,
    pub summary_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detailed_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl LogEntry {
    pub fn new(summary: impl Into<String>) -> Self {
        LogEntry {
            summary_message: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detailed_message = Some(detail.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session_id = Some(session.into());
        self
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site_id = site.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Log queries
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogOrderBy {
    LogId,
    #[default]
    Timestamp,
    LogLevel,
    SiteId,
}

impl LogOrderBy {
    pub fn column(&self) -> &'static str {
        match self {
            LogOrderBy::LogId => "log_id",
            LogOrderBy::Timestamp => "timestamp",
            LogOrderBy::LogLevel => "log_level",
            LogOrderBy::SiteId => "site_id",
        }
    }

    pub fn parse(s: &str) -> Result<LogOrderBy> {
        match s {
            "log_id" => Ok(LogOrderBy::LogId),
            "timestamp" => Ok(LogOrderBy::Timestamp),
            "log_level" => Ok(LogOrderBy::LogLevel),
            "site_id" => Ok(LogOrderBy::SiteId),
            _ => bail!(
                "Invalid order_by column '{}'. Allowed: log_id, timestamp, log_level, site_id",
                s
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OrderDir {
    Asc,
    #[default]
    Desc,
}

impl OrderDir {
    pub fn keyword(&self) -> &'static str {
        match self {
            OrderDir::Asc => "ASC",
            OrderDir::Desc => "DESC",
        }
    }

    pub fn parse(s: &str) -> Result<OrderDir> {
        match s.to_uppercase().as_str() {
            "ASC" => Ok(OrderDir::Asc),
            "DESC" => Ok(OrderDir::Desc),
            _ => bail!("Order direction must be 'ASC' or 'DESC'"),
        }
    }
}

/// Session filter for log queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionFilter {
    /// Entries with no session tag (the shippable set).
    IsNull,
    /// Entries belonging to one session.
    Equals(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogQuery {
    pub limit: Option<usize>,
    pub offset: usize,
    pub order_by: LogOrderBy,
    pub order_dir: OrderDir,
    pub session_id: Option<SessionFilter>,
    pub older_than_days: Option<i64>,
}

impl LogQuery {
    /// Entries eligible for shipping to the core: null session only.
    pub fn shippable() -> Self {
        LogQuery {
            session_id: Some(SessionFilter::IsNull),
            order_by: LogOrderBy::LogId,
            order_dir: OrderDir::Asc,
            ..Default::default()
        }
    }

    pub fn older_than(days: i64) -> Self {
        LogQuery {
            older_than_days: Some(days),
            order_by: LogOrderBy::LogId,
            order_dir: OrderDir::Asc,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.limit {
            if limit == 0 {
                bail!("Limit must be a positive integer");
            }
        }
        if let Some(days) = self.older_than_days {
            if days <= 0 {
                bail!("Days must be a positive integer");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline & remote status (core site)
// ---------------------------------------------------------------------------

/// One authorized update published by the CD pipeline.
/// `hash_value` stays None until the core has fingerprinted the path.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineUpdate {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "TC_id", default)]
    pub tc_id: String,
    #[serde(default)]
    pub timestamp: i64,
    pub update_path: String,
    #[serde(default)]
    pub update_size: i64,
    #[serde(default)]
    pub hash_value: Option<String>,
}

/// One row of a remote site's hash-status report.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatusUpdate {
    pub path: String,
    #[serde(default)]
    pub local_hash: Option<String>,
    #[serde(default)]
    pub core_hash: Option<String>,
}
