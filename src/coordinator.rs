//! The periodic reconciliation loop.
//!
//! One short-lived run, invoked by an external scheduler: gate on liveness,
//! audit store integrity, rehash what drifted or aged out, reconcile with
//! the authority (or, on the authority, with the CD pipeline), and forward
//! logs. Every phase is wrapped in a monitor that writes START/FINISH log
//! pairs to the store; FINISH is emitted on every exit path.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config::Config;
use crate::merkle::{self, MerkleEngine, WorkItem, WorkState};
use crate::paths;
use crate::record::{HashRecord, LogEntry, LogLevel, RemoteStatusUpdate};
use crate::store::SiteStore;

const LOG_RETENTION_DAYS: i64 = 90;

pub struct Coordinator {
    config: Config,
    local: Arc<dyn SiteStore>,
    core: Arc<dyn SiteStore>,
    engine: MerkleEngine,
    session_id: String,
}

impl Coordinator {
    pub fn new(
        config: Config,
        local: Arc<dyn SiteStore>,
        core: Arc<dyn SiteStore>,
        engine: MerkleEngine,
        session_id: String,
    ) -> Self {
        Coordinator {
            config,
            local,
            core,
            engine,
            session_id,
        }
    }

    /// One full coordination pass. Returns the process exit code: non-zero
    /// when the liveness gate fails or no phase completed.
    pub fn run(&self) -> i32 {
        tracing::info!("Starting coordinator run");

        let health = self.local.health();
        if health.is_empty() || !health.values().all(|ok| *ok) {
            tracing::error!(
                "Unable to run coordinator due to unhealthy REST service: {:?}",
                health
            );
            return 1;
        }

        let mut completed_phases = 0u32;

        {
            let _monitor = self.phase_monitor("Coordinator - Verification");
            match self.run_verification() {
                Ok(()) => completed_phases += 1,
                Err(e) => {
                    tracing::error!("Fatal error in verification phase: {}", e);
                    self.put_log(
                        LogLevel::Error,
                        "Verification phase failed",
                        Some(json!({ "error": e.to_string() }).to_string()),
                    );
                }
            }
        }

        {
            let _monitor = self.phase_monitor("Coordinator - Log forwarding");
            match self.run_log_forwarding() {
                Ok(()) => completed_phases += 1,
                Err(e) => {
                    tracing::error!("Fatal error in log forwarding phase: {}", e);
                    self.put_log(
                        LogLevel::Error,
                        "Log forwarding phase failed",
                        Some(json!({ "error": e.to_string() }).to_string()),
                    );
                }
            }
        }

        if completed_phases == 0 {
            1
        } else {
            0
        }
    }

    // -- verification -------------------------------------------------------

    pub(crate) fn run_verification(&self) -> anyhow::Result<()> {
        tracing::info!("Verifying store integrity");
        self.audit_store_integrity();

        self.run_rehash_sweep();

        if self.config.is_core() {
            self.run_core_tasks();
        } else {
            self.run_remote_tasks();
        }
        Ok(())
    }

    fn audit_store_integrity(&self) {
        let orphans = self.local.find_orphans();
        if orphans.is_empty() {
            tracing::info!("No orphaned entries found");
        } else {
            tracing::warn!("Found orphaned entries: {:?}", orphans);
            self.put_log(
                LogLevel::Warning,
                "Found orphaned entries",
                Some(json!({ "orphans": orphans }).to_string()),
            );
        }

        let untracked = self.local.find_untracked();
        if untracked.is_empty() {
            tracing::info!("No untracked children found");
        } else {
            tracing::warn!("Found untracked children: {:?}", untracked);
            self.put_log(
                LogLevel::Warning,
                "Found untracked children",
                Some(json!({ "untracked": untracked }).to_string()),
            );
        }
    }

    /// Rehash drifted (priority) and aged (routine) paths within the runtime
    /// budget. Budget exhaustion finishes the current item and starts no new
    /// one; re-scheduling falls out of the age ordering on the next run.
    pub(crate) fn run_rehash_sweep(&self) {
        let priority = self.local.priority_updates();
        tracing::info!("Priority updates: {:?}", priority);
        let routine = self
            .local
            .oldest_updates(&self.config.baseline, self.config.update_percent);
        tracing::info!("Oldest updates: {:?}", routine);

        let mut items: Vec<WorkItem> = merkle::remove_redundant_paths_with_priority(
            &priority, &routine,
        )
        .into_iter()
        .map(|path| {
            let is_priority = priority.iter().any(|p| paths::is_within(&path, p));
            WorkItem::new(path, is_priority)
        })
        .collect();

        let deadline = Instant::now() + Duration::from_secs(self.config.max_runtime_min * 60);
        let total = items.len();
        let mut processed = 0usize;
        let mut failed: Vec<serde_json::Value> = Vec::new();

        for item in items.iter_mut() {
            if Instant::now() > deadline {
                tracing::info!("Time limit reached, stopping rehash sweep");
                break;
            }
            tracing::info!("Processing path: {}", item.path);
            match self.engine.run_work_item(item) {
                Some(_) => processed += 1,
                None => {
                    if let WorkState::Failed(failure) = &item.state {
                        failed.push(json!({ "path": item.path, "state": failure.kind() }));
                    }
                }
            }
        }

        tracing::info!("Rehash sweep processed {} of {} paths", processed, total);
        self.put_log(
            LogLevel::Info,
            "Integrity sweep complete",
            Some(
                json!({ "processed": processed, "total": total, "failed": failed }).to_string(),
            ),
        );
    }

    // -- core role ----------------------------------------------------------

    /// The authority reconciles observed drift against what the pipeline
    /// approved, then fingerprints each approved path and publishes the
    /// result as the new expectation.
    pub(crate) fn run_core_tasks(&self) {
        let change_list = self.local.priority_updates();

        let mut auth_list: Vec<String> = Vec::new();
        for update in self
            .local
            .pipeline_updates()
            .unwrap_or_default()
            .into_iter()
            .filter(|update| update.hash_value.is_none())
        {
            if !auth_list.contains(&update.update_path) {
                auth_list.push(update.update_path);
            }
        }

        // Drift not covered by any approved update is unauthorized change.
        for item in change_list
            .iter()
            .filter(|item| !auth_list.iter().any(|auth| paths::is_within(item, auth)))
        {
            tracing::warn!("Unauthorized change to: {}", item);
            self.put_log(
                LogLevel::Warning,
                "Unauthorized changes detected.",
                Some(json!({ "unauthorized_updates": [item] }).to_string()),
            );
        }

        let mut completed: Vec<String> = Vec::new();
        for path in &auth_list {
            match self.engine.compute_merkle_tree(path) {
                Ok(hash) => {
                    self.update_target_hash(path, &hash, &hash);
                    if !self.local.put_pipeline_hash(path, &hash) {
                        tracing::error!("Failed to mark pipeline update processed: {}", path);
                    }
                    completed.push(path.clone());
                }
                Err(failure) => {
                    tracing::error!("Failed to process authorized update {}: {}", path, failure);
                }
            }
        }

        tracing::info!("Authorized hash updates complete: {:?}", completed);
        self.put_log(
            LogLevel::Info,
            "Authorized hash updates complete.",
            Some(json!({ "authorized_updates": completed }).to_string()),
        );
    }

    // -- remote role --------------------------------------------------------

    /// Compare local fingerprints against the authority's, adopt its targets
    /// for divergent paths, and report the differences back for the
    /// dashboard.
    pub(crate) fn run_remote_tasks(&self) {
        let differences = self.verify_hash_status();

        for diff in &differences {
            if let (Some(local_hash), Some(core_hash)) = (&diff.local_hash, &diff.core_hash) {
                self.update_target_hash(&diff.path, local_hash, core_hash);
            }
        }

        if differences.is_empty() {
            tracing::info!("Local tree is in sync with core");
            return;
        }
        match self.core.put_remote_status(
            &self.config.site_name,
            &differences,
            true,
            Some(&self.config.baseline),
        ) {
            Some(count) => tracing::info!("Updated core with {} remote hash status rows", count),
            None => tracing::error!("Failed to update core with remote hash status"),
        }
    }

    /// Breadth-first comparison of the local and authoritative trees from
    /// the baseline root. Divergent nodes enqueue children from both sides;
    /// equal nodes end their branch — with a cryptographic composition an
    /// equal directory hash covers the entire subtree.
    pub(crate) fn verify_hash_status(&self) -> Vec<RemoteStatusUpdate> {
        let mut differences: Vec<RemoteStatusUpdate> = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::from([self.config.baseline.clone()]);
        let mut processed: HashSet<String> = HashSet::new();

        while let Some(path) = queue.pop_front() {
            if !processed.insert(path.clone()) {
                continue;
            }

            let local_hash = self.local.get_hash(&path);
            let core_hash = self.core.get_hash(&path);

            match (&local_hash, &core_hash) {
                (None, None) => continue,
                (None, Some(_)) => {
                    self.log_difference("Missing local entry for core path", &path);
                    self.enqueue_children(&path, &mut queue, &[&*self.core]);
                }
                (Some(_), None) => {
                    self.log_difference("Additional local entry not in core", &path);
                    self.enqueue_children(&path, &mut queue, &[&*self.local]);
                }
                (Some(local), Some(core)) if local != core => {
                    self.log_difference("Local entry does not match core for path", &path);
                    self.enqueue_children(&path, &mut queue, &[&*self.local, &*self.core]);
                }
                _ => continue,
            }

            differences.push(RemoteStatusUpdate {
                path,
                local_hash,
                core_hash,
            });
        }

        differences
    }

    fn enqueue_children(&self, path: &str, queue: &mut VecDeque<String>, sides: &[&dyn SiteStore]) {
        let mut children: Vec<String> = Vec::new();
        for side in sides {
            if let Some(record) = side.get(path) {
                for name in record.all_children() {
                    let child_path = paths::join(path, name);
                    if !children.contains(&child_path) {
                        children.push(child_path);
                    }
                }
            }
        }
        queue.extend(children);
    }

    fn log_difference(&self, message: &str, path: &str) {
        tracing::info!("{}: {}", message, path);
        self.put_log(
            LogLevel::Info,
            message,
            Some(json!([path]).to_string()),
        );
    }

    fn update_target_hash(&self, path: &str, current_hash: &str, target_hash: &str) {
        let mut record = HashRecord::new(path, current_hash);
        record.target_hash = Some(target_hash.to_string());
        record.session_id = Some(self.session_id.clone());
        match self.local.upsert(&record) {
            Ok(Some(_)) => {}
            Ok(None) => tracing::error!("Store failure updating target hash for {}", path),
            Err(e) => tracing::error!("Rejected target hash update for {}: {}", path, e),
        }
    }

    // -- log forwarding -----------------------------------------------------

    pub(crate) fn run_log_forwarding(&self) -> anyhow::Result<()> {
        tracing::info!("Consolidating logs");
        if !self.local.consolidate_logs() {
            tracing::error!("Log consolidation failed");
        }

        // The core's logs already live at the core; only remotes ship.
        if !self.config.is_core() {
            self.ship_logs_to_core();
        }

        let old = self.local.logs_older_than(LOG_RETENTION_DAYS)?;
        if !old.is_empty() {
            tracing::info!(
                "Deleting {} log entries older than {} days",
                old.len(),
                LOG_RETENTION_DAYS
            );
            let ids: Vec<i64> = old.iter().map(|entry| entry.log_id).collect();
            let (_, failed) = self.local.delete_logs(&ids);
            if !failed.is_empty() {
                tracing::error!("Failed to delete {} old log entries", failed.len());
            }
        }
        Ok(())
    }

    fn ship_logs_to_core(&self) {
        let entries = self.local.shippable_logs();
        if entries.is_empty() {
            return;
        }

        let mut shipped_ids: Vec<i64> = Vec::new();
        for entry in &entries {
            let mut outbound = entry.clone();
            outbound.log_id = 0;
            if self.core.put_log(&outbound).is_some() {
                shipped_ids.push(entry.log_id);
            }
        }
        if shipped_ids.len() < entries.len() {
            tracing::warn!(
                "Not all log entries were shipped to core. Failed to ship {} entries.",
                entries.len() - shipped_ids.len()
            );
        }

        tracing::info!(
            "Deleting {} shipped log entries from local storage",
            shipped_ids.len()
        );
        let (_, failed) = self.local.delete_logs(&shipped_ids);
        if !failed.is_empty() {
            tracing::error!(
                "Failed to delete {} shipped log entries from local storage",
                failed.len()
            );
        }
    }

    // -- helpers ------------------------------------------------------------

    fn put_log(&self, level: LogLevel, summary: &str, detail: Option<String>) {
        let mut entry = LogEntry::new(summary)
            .with_level(level)
            .with_site(self.config.site_name.clone())
            .with_session(self.session_id.clone());
        entry.detailed_message = detail;
        if self.local.put_log(&entry).is_none() {
            tracing::error!("Failed to record log entry: {}", summary);
        }
    }

    fn phase_monitor(&self, operation: &str) -> PhaseMonitor<'_> {
        PhaseMonitor::start(
            &*self.local,
            operation.to_string(),
            if self.config.is_core() { "Core" } else { "Remote" },
            self.config.site_name.clone(),
            self.session_id.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Phase monitor
// ---------------------------------------------------------------------------

/// Scoped timer around one coordinator phase. Emits a START log entry on
/// construction and the paired FINISH entry, with the measured duration, on
/// drop — so FINISH lands on every exit path, panics included.
struct PhaseMonitor<'a> {
    store: &'a dyn SiteStore,
    operation: String,
    role: &'static str,
    site_id: String,
    session_id: String,
    start: Instant,
}

impl<'a> PhaseMonitor<'a> {
    fn start(
        store: &'a dyn SiteStore,
        operation: String,
        role: &'static str,
        site_id: String,
        session_id: String,
    ) -> Self {
        let detail = format!("Starting {} {} tasks", operation, role);
        tracing::info!("{}", detail);
        let entry = LogEntry::new("START SESSION")
            .with_detail(detail)
            .with_site(site_id.clone())
            .with_session(session_id.clone());
        store.put_log(&entry);
        PhaseMonitor {
            store,
            operation,
            role,
            site_id,
            session_id,
            start: Instant::now(),
        }
    }
}

impl Drop for PhaseMonitor<'_> {
    fn drop(&mut self) {
        let duration = format_duration(self.start.elapsed());
        let detail = format!(
            "Completed {} {} tasks in {}",
            self.operation, self.role, duration
        );
        tracing::info!("{}", detail);
        let entry = LogEntry::new("FINISH SESSION")
            .with_detail(detail)
            .with_site(self.site_id.clone())
            .with_session(self.session_id.clone());
        self.store.put_log(&entry);
    }
}

fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs_f64();
    let minutes = (total / 60.0) as u64;
    let seconds = total % 60.0;
    if minutes > 0 {
        format!("{minutes}m {seconds:.2}s")
    } else {
        format!("{seconds:.2}s")
    }
}
