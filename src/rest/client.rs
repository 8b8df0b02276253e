//! HTTP client and the REST-backed store.
//!
//! The retry envelope is two nested loops: five quick attempts spaced by a
//! short delay, repeated up to `max_retries` times with a long pause between
//! rounds. 4xx responses return immediately (retrying a bad request cannot
//! help); 5xx, timeouts, and connection errors burn attempts. A final
//! failure yields a non-200 tuple that [`RestStore`] translates to the
//! sentinel the store contract requires.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};

use crate::record::{
    ChangeSet, HashRecord, LogEntry, LogQuery, PipelineUpdate, RemoteStatusUpdate,
};
use crate::store::{CoreOps, Store};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const INNER_ATTEMPTS: u32 = 5;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub long_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            long_delay: Duration::from_secs(30),
        }
    }
}

enum Method {
    Get,
    Post,
    Delete,
}

pub struct RestClient {
    base_url: String,
    agent: ureq::Agent,
    policy: RetryPolicy,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, policy: RetryPolicy) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .build();
        RestClient {
            base_url: base_url.into(),
            agent,
            policy,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET with query parameters. Returns (status, payload) where payload is
    /// the envelope's `data` on success or its `message` on failure.
    pub fn get(&self, endpoint: &str, params: &[(&str, String)]) -> (u16, Value) {
        self.request(Method::Get, endpoint, params, None)
    }

    pub fn post(&self, endpoint: &str, body: &Value) -> (u16, Value) {
        self.request(Method::Post, endpoint, &[], Some(body))
    }

    pub fn delete(&self, endpoint: &str, body: &Value) -> (u16, Value) {
        self.request(Method::Delete, endpoint, &[], Some(body))
    }

    fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
        body: Option<&Value>,
    ) -> (u16, Value) {
        let url = format!("{}{}", self.base_url, endpoint);

        for round in 0..self.policy.max_retries {
            for inner in 0..INNER_ATTEMPTS {
                let attempt = round * INNER_ATTEMPTS + inner + 1;

                let mut request = match method {
                    Method::Get => self.agent.get(&url),
                    Method::Post => self.agent.post(&url),
                    Method::Delete => self.agent.delete(&url),
                };
                for (key, value) in params {
                    request = request.query(key, value);
                }

                let result = match body {
                    Some(payload) => request.send_json(payload),
                    None => request.call(),
                };

                match result {
                    Ok(response) => {
                        let status = response.status();
                        let envelope: Value = response.into_json().unwrap_or(Value::Null);
                        let data = envelope.get("data").cloned().unwrap_or(Value::Null);
                        return (status, data);
                    }
                    Err(ureq::Error::Status(status, response)) => {
                        let envelope: Value = response.into_json().unwrap_or(Value::Null);
                        let message = envelope
                            .get("message")
                            .cloned()
                            .unwrap_or_else(|| json!(format!("HTTP {status}")));
                        if (400..500).contains(&status) {
                            return (status, message);
                        }
                        tracing::warn!(
                            "HTTP {} from {} on attempt #{}: {}",
                            status,
                            url,
                            attempt,
                            message
                        );
                    }
                    Err(ureq::Error::Transport(transport)) => {
                        tracing::warn!(
                            "Transport error on attempt #{} for {}: {}",
                            attempt,
                            url,
                            transport
                        );
                    }
                }

                std::thread::sleep(self.policy.retry_delay);
            }
            tracing::error!(
                "Failed to contact {} after {} attempts, pausing before retry",
                url,
                (round + 1) * INNER_ATTEMPTS
            );
            std::thread::sleep(self.policy.long_delay);
        }

        (
            503,
            json!("Service unavailable after all retry attempts"),
        )
    }
}

// ---------------------------------------------------------------------------
// Store over the wire
// ---------------------------------------------------------------------------

/// The store contract implemented over the REST boundary, so the engine and
/// coordinator do not care whether rows live in a local database or behind a
/// remote service.
pub struct RestStore {
    client: RestClient,
}

impl RestStore {
    pub fn new(client: RestClient) -> Self {
        RestStore { client }
    }

    pub fn for_url(base_url: impl Into<String>, policy: RetryPolicy) -> Self {
        RestStore::new(RestClient::new(base_url, policy))
    }

    fn get_field(&self, path: &str, field: &str) -> Option<Value> {
        let (status, data) = self.client.get(
            "/api/hashtable",
            &[("path", path.to_string()), ("field", field.to_string())],
        );
        if status == 200 {
            Some(data)
        } else {
            tracing::debug!("GET hashtable field={} for {} -> HTTP {}", field, path, status);
            None
        }
    }

    fn get_list(&self, field: &str) -> Vec<String> {
        match self.get_field("", field) {
            Some(data) => serde_json::from_value(data).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl Store for RestStore {
    fn get(&self, path: &str) -> Option<HashRecord> {
        let data = self.get_field(path, "record")?;
        serde_json::from_value(data).ok()
    }

    fn get_hash(&self, path: &str) -> Option<String> {
        self.get_field(path, "hash")?
            .as_str()
            .map(str::to_string)
    }

    fn get_timestamp(&self, path: &str) -> Option<i64> {
        self.get_field(path, "timestamp")?.as_i64()
    }

    fn upsert(&self, record: &HashRecord) -> Result<Option<ChangeSet>> {
        record.validate()?;
        let body = serde_json::to_value(record)?;
        let (status, data) = self.client.post("/api/hashtable", &body);
        match status {
            200 => Ok(Some(serde_json::from_value(data).unwrap_or_default())),
            400 => bail!("Record rejected: {}", data),
            _ => {
                tracing::error!("Upsert for {} failed with HTTP {}", record.path, status);
                Ok(None)
            }
        }
    }

    fn delete(&self, path: &str) -> bool {
        // Record deletion has no wire operation; the owning site prunes
        // through its own upserts.
        tracing::error!("Record deletion is not available over REST: {}", path);
        false
    }

    fn priority_updates(&self) -> Vec<String> {
        self.get_list("priority")
    }

    fn find_orphans(&self) -> Vec<String> {
        self.get_list("orphaned")
    }

    fn find_untracked(&self) -> Vec<String> {
        self.get_list("untracked")
    }

    fn put_log(&self, entry: &LogEntry) -> Option<i64> {
        let body = match serde_json::to_value(entry) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Unserializable log entry: {}", e);
                return None;
            }
        };
        let (status, data) = self.client.post("/api/logs", &body);
        if status != 200 {
            tracing::error!("put_log failed with HTTP {}: {}", status, data);
            return None;
        }
        data.as_i64()
    }

    fn get_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        query.validate()?;
        let (status, data) = if *query == LogQuery::shippable() {
            self.client
                .get("/api/logs", &[("action", "shippable".to_string())])
        } else if let Some(days) = query.older_than_days {
            self.client.get(
                "/api/logs",
                &[
                    ("action", "older_than".to_string()),
                    ("days", days.to_string()),
                ],
            )
        } else {
            bail!("Only shippable and older_than log queries are available over REST");
        };
        if status != 200 {
            tracing::error!("get_logs failed with HTTP {}: {}", status, data);
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(data).unwrap_or_default())
    }

    fn delete_logs(&self, log_ids: &[i64]) -> (Vec<i64>, Vec<i64>) {
        let body = json!({ "log_ids": log_ids });
        let (status, data) = self.client.delete("/api/logs", &body);
        match status {
            200 => (log_ids.to_vec(), Vec::new()),
            207 => {
                let failed: Vec<i64> = data
                    .get("failed_deletes")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let deleted = log_ids
                    .iter()
                    .copied()
                    .filter(|id| !failed.contains(id))
                    .collect();
                (deleted, failed)
            }
            _ => {
                tracing::error!("delete_logs failed with HTTP {}: {}", status, data);
                (Vec::new(), log_ids.to_vec())
            }
        }
    }

    fn consolidate_logs(&self) -> bool {
        let (status, data) = self
            .client
            .get("/api/logs", &[("action", "consolidate".to_string())]);
        status == 200 && data.as_bool().unwrap_or(false)
    }

    fn health(&self) -> BTreeMap<String, bool> {
        let (status, data) = self.client.get("/api/health", &[]);
        if status != 200 {
            return BTreeMap::new();
        }
        data.get("services")
            .and_then(|services| serde_json::from_value(services.clone()).ok())
            .unwrap_or_default()
    }
}

impl CoreOps for RestStore {
    fn pipeline_updates(&self) -> Option<Vec<PipelineUpdate>> {
        let (status, data) = self
            .client
            .get("/api/pipeline", &[("action", "updates".to_string())]);
        if status != 200 {
            tracing::error!("pipeline_updates failed with HTTP {}: {}", status, data);
            return None;
        }
        serde_json::from_value(data).ok()
    }

    fn put_pipeline_hash(&self, update_path: &str, hash_value: &str) -> bool {
        let body = json!({
            "action": "hash",
            "update_path": update_path,
            "hash_value": hash_value,
        });
        let (status, _) = self.client.post("/api/pipeline", &body);
        status == 200
    }

    fn sync_sites(&self) -> Option<usize> {
        let (status, data) = self
            .client
            .get("/api/pipeline", &[("action", "sites".to_string())]);
        if status != 200 {
            return None;
        }
        data.as_u64().map(|n| n as usize)
    }

    fn put_remote_status(
        &self,
        site_name: &str,
        updates: &[RemoteStatusUpdate],
        drop_previous: bool,
        root_path: Option<&str>,
    ) -> Option<usize> {
        let body = json!({
            "action": "remote_updates",
            "site_name": site_name,
            "updates": updates,
            "drop_previous": drop_previous,
            "root_path": root_path,
        });
        let (status, data) = self.client.post("/api/remote_status", &body);
        if status != 200 {
            tracing::error!("put_remote_status failed with HTTP {}: {}", status, data);
            return None;
        }
        data.as_u64().map(|n| n as usize)
    }
}
