//! REST service.
//!
//! A thin axum façade over the store: five resources, JSON in and out.
//! Success wraps payloads as `{"message": "Success", "data": ...}`; errors
//! as `{"error", "message", "status"}`. Partial success uses 207. The
//! pipeline and remote-status resources exist only where a pipeline store
//! is wired in (the core site); elsewhere they answer 503.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::pipeline::PipelineStore;
use crate::record::{now_epoch, HashRecord, LogEntry, LogLevel, RemoteStatusUpdate};
use crate::store::{SqliteStore, Store};

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub pipeline: Option<Arc<PipelineStore>>,
    pub site_name: String,
}

type SharedState = Arc<AppState>;
type ApiResponse = (StatusCode, Json<Value>);

// ---------------------------------------------------------------------------
// Response envelopes
// ---------------------------------------------------------------------------

fn success(data: Value) -> ApiResponse {
    (
        StatusCode::OK,
        Json(json!({ "message": "Success", "data": data })),
    )
}

fn success_with(status: StatusCode, message: &str, data: Value) -> ApiResponse {
    (status, Json(json!({ "message": message, "data": data })))
}

fn error(status: StatusCode, kind: &str, message: impl Into<String>) -> ApiResponse {
    (
        status,
        Json(json!({
            "error": kind,
            "message": message.into(),
            "status": status.as_u16(),
        })),
    )
}

fn bad_request(message: impl Into<String>) -> ApiResponse {
    error(StatusCode::BAD_REQUEST, "Bad request", message)
}

fn not_found(message: impl Into<String>) -> ApiResponse {
    error(StatusCode::NOT_FOUND, "Not Found", message)
}

fn db_error(message: impl Into<String>) -> ApiResponse {
    error(StatusCode::INTERNAL_SERVER_ERROR, "Database error", message)
}

// ---------------------------------------------------------------------------
// /api/hashtable
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct HashtableQuery {
    pub path: Option<String>,
    pub field: Option<String>,
}

async fn hashtable_get(
    State(state): State<SharedState>,
    Query(query): Query<HashtableQuery>,
) -> ApiResponse {
    let field = query.field.as_deref().unwrap_or("record");
    let path = query.path.as_deref().unwrap_or("");
    tracing::debug!("GET /api/hashtable path={} field={}", path, field);

    match field {
        "record" => match state.store.get(path) {
            Some(record) => success(serde_json::to_value(record).unwrap_or(Value::Null)),
            None => not_found("Path not found"),
        },
        "hash" => match state.store.get_hash(path) {
            Some(hash) => success(json!(hash)),
            None => not_found("Path not found"),
        },
        "timestamp" => match state.store.get_timestamp(path) {
            Some(ts) => success(json!(ts)),
            None => not_found("Path not found"),
        },
        "priority" => success(json!(state.store.priority_updates())),
        "untracked" => success(json!(state.store.find_untracked())),
        "orphaned" => success(json!(state.store.find_orphans())),
        _ => bad_request(
            "Invalid field parameter. Use 'record', 'hash', 'timestamp', 'priority', \
             'untracked', or 'orphaned'",
        ),
    }
}

async fn hashtable_post(
    State(state): State<SharedState>,
    body: Option<Json<Value>>,
) -> ApiResponse {
    let Some(Json(body)) = body else {
        return bad_request("Request body required for POST operation");
    };
    let record: HashRecord = match serde_json::from_value(body) {
        Ok(record) => record,
        Err(e) => return bad_request(format!("Invalid hash record: {e}")),
    };
    tracing::debug!("POST /api/hashtable for path: {}", record.path);

    match state.store.upsert(&record) {
        Err(e) => bad_request(e.to_string()),
        Ok(None) => db_error("Database error, see service logs"),
        Ok(Some(changes)) => success(serde_json::to_value(changes).unwrap_or(Value::Null)),
    }
}

// ---------------------------------------------------------------------------
// /api/logs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub action: Option<String>,
    pub days: Option<String>,
}

async fn logs_get(
    State(state): State<SharedState>,
    Query(query): Query<LogsQuery>,
) -> ApiResponse {
    match query.action.as_deref() {
        Some("consolidate") => {
            tracing::info!("GET /api/logs?action=consolidate");
            if state.store.consolidate_logs() {
                success(json!(true))
            } else {
                db_error("Error during log consolidation")
            }
        }
        Some("shippable") => {
            tracing::info!("GET /api/logs?action=shippable");
            let entries = state.store.shippable_logs();
            success(serde_json::to_value(entries).unwrap_or(Value::Null))
        }
        Some("older_than") => {
            let Some(days) = query.days.as_deref().and_then(|d| d.parse::<i64>().ok()) else {
                return bad_request("'days' must be a positive integer");
            };
            match state.store.logs_older_than(days) {
                Ok(entries) => success(serde_json::to_value(entries).unwrap_or(Value::Null)),
                Err(e) => bad_request(e.to_string()),
            }
        }
        other => {
            tracing::warn!("GET /api/logs with invalid action: {:?}", other);
            bad_request(
                "Invalid or missing 'action' parameter. Use 'consolidate', 'shippable', \
                 or 'older_than'",
            )
        }
    }
}

async fn logs_post(State(state): State<SharedState>, body: Option<Json<Value>>) -> ApiResponse {
    let Some(Json(body)) = body else {
        return bad_request("Request body required for POST operation");
    };

    let summary = body
        .get("summary_message")
        .and_then(Value::as_str)
        .unwrap_or("");
    if summary.trim().is_empty() {
        return bad_request("'summary_message' value must be provided");
    }

    // The origin tag defaults to this site; the level never rejects input.
    let site_id = match body.get("site_id").and_then(Value::as_str) {
        Some(site) if !site.is_empty() && !site.eq_ignore_ascii_case("local") => site.to_string(),
        _ => state.site_name.clone(),
    };
    let entry = LogEntry {
        log_id: 0,
        site_id,
        timestamp: body.get("timestamp").and_then(Value::as_i64).unwrap_or(0),
        log_level: LogLevel::parse_lenient(
            body.get("log_level").and_then(Value::as_str).unwrap_or(""),
        ),
        summary_message: summary.to_string(),
        detailed_message: body
            .get("detailed_message")
            .and_then(Value::as_str)
            .map(str::to_string),
        session_id: body
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    match state.store.put_log(&entry) {
        Some(log_id) => success(json!(log_id)),
        None => db_error("Error adding log entry"),
    }
}

async fn logs_delete(State(state): State<SharedState>, body: Option<Json<Value>>) -> ApiResponse {
    let Some(Json(body)) = body else {
        return bad_request("Request body required for DELETE operation");
    };
    let Some(log_ids) = body
        .get("log_ids")
        .and_then(|v| serde_json::from_value::<Vec<i64>>(v.clone()).ok())
    else {
        return bad_request("'log_ids' must be a list of integers");
    };

    let (deleted, failed) = state.store.delete_logs(&log_ids);
    if failed.is_empty() {
        tracing::info!("Deleted {} log entries", deleted.len());
        success(json!({ "deleted_count": [deleted.len()] }))
    } else {
        tracing::warn!("Failed to delete log entries: {:?}", failed);
        success_with(
            StatusCode::MULTI_STATUS,
            "Partial success",
            json!({ "deleted_count": [deleted.len()], "failed_deletes": failed }),
        )
    }
}

// ---------------------------------------------------------------------------
// /api/health
// ---------------------------------------------------------------------------

async fn health(State(state): State<SharedState>) -> ApiResponse {
    tracing::debug!("GET /api/health");
    let mut services: BTreeMap<String, bool> = BTreeMap::from([("api".to_string(), true)]);
    services.extend(state.store.health());
    if let Some(pipeline) = &state.pipeline {
        services.insert("pipeline".to_string(), pipeline.health());
    }

    let status = if services.values().all(|ok| *ok) {
        "healthy"
    } else {
        "unhealthy"
    };
    success(json!({
        "status": status,
        "timestamp": iso8601_utc(now_epoch()),
        "site_name": state.site_name,
        "services": services,
    }))
}

// ---------------------------------------------------------------------------
// /api/pipeline (core only)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct PipelineQuery {
    pub action: Option<String>,
}

fn pipeline_store(state: &AppState) -> Result<&Arc<PipelineStore>, ApiResponse> {
    state.pipeline.as_ref().ok_or_else(|| {
        tracing::error!("Pipeline store not available on this site");
        error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service unavailable",
            "Pipeline database instance not available",
        )
    })
}

async fn pipeline_get(
    State(state): State<SharedState>,
    Query(query): Query<PipelineQuery>,
) -> ApiResponse {
    let pipeline = match pipeline_store(&state) {
        Ok(pipeline) => pipeline,
        Err(response) => return response,
    };

    match query.action.as_deref().unwrap_or("updates") {
        "updates" => match pipeline.updates() {
            Some(updates) => {
                tracing::info!("Found {} pipeline updates", updates.len());
                success(serde_json::to_value(updates).unwrap_or(Value::Null))
            }
            None => db_error("Error getting pipeline updates"),
        },
        "sites" => match pipeline.sync_sites() {
            Some(count) => success(json!(count)),
            None => db_error("Failed to sync sites table"),
        },
        other => {
            tracing::warn!("GET /api/pipeline with invalid action: {}", other);
            bad_request("Invalid 'action' parameter. Use 'action=updates' or 'action=sites'")
        }
    }
}

async fn pipeline_post(State(state): State<SharedState>, body: Option<Json<Value>>) -> ApiResponse {
    let pipeline = match pipeline_store(&state) {
        Ok(pipeline) => pipeline.clone(),
        Err(response) => return response,
    };
    let Some(Json(body)) = body else {
        return bad_request("Request body required for POST operation");
    };

    match body.get("action").and_then(Value::as_str) {
        Some("hash") => {
            let update_path = body.get("update_path").and_then(Value::as_str).unwrap_or("");
            let hash_value = body.get("hash_value").and_then(Value::as_str).unwrap_or("");
            if update_path.is_empty() || hash_value.is_empty() {
                return bad_request(
                    "Both 'update_path' and 'hash_value' are required for hash updates",
                );
            }
            if pipeline.put_hash(update_path, hash_value) {
                tracing::info!("Updated pipeline hash for path: {}", update_path);
                success(json!(true))
            } else {
                db_error("Failed to update pipeline hash")
            }
        }
        Some("site_status") => {
            let site_name = body.get("site_name").and_then(Value::as_str).unwrap_or("");
            let status_data = body.get("status_data");
            if site_name.is_empty() || status_data.is_none() {
                return bad_request(
                    "Both 'site_name' and 'status_data' are required for site status updates",
                );
            }
            if pipeline.touch_site(site_name) {
                success(json!(true))
            } else {
                db_error("Failed to update site status")
            }
        }
        _ => bad_request("Invalid 'action' parameter. Use 'action=hash' or 'action=site_status'"),
    }
}

// ---------------------------------------------------------------------------
// /api/remote_status (core only)
// ---------------------------------------------------------------------------

async fn remote_status_post(
    State(state): State<SharedState>,
    body: Option<Json<Value>>,
) -> ApiResponse {
    let pipeline = match pipeline_store(&state) {
        Ok(pipeline) => pipeline.clone(),
        Err(response) => return response,
    };
    let Some(Json(body)) = body else {
        return bad_request("Request body required for POST operation");
    };

    if body.get("action").and_then(Value::as_str) != Some("remote_updates") {
        return bad_request("Invalid 'action' parameter. Use 'action=remote_updates'");
    }

    let site_name = body.get("site_name").and_then(Value::as_str).unwrap_or("");
    let updates: Vec<RemoteStatusUpdate> = body
        .get("updates")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    if site_name.is_empty() || updates.is_empty() {
        return bad_request("site_name and updates required for site status updates");
    }
    let drop_previous = body
        .get("drop_previous")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let root_path = body.get("root_path").and_then(Value::as_str);

    match pipeline.put_remote_status(site_name, &updates, drop_previous, root_path) {
        Some(count) => success(json!(count)),
        None => db_error("Failed to store remote status"),
    }
}

// ---------------------------------------------------------------------------
// /api/docs
// ---------------------------------------------------------------------------

async fn docs(State(state): State<SharedState>) -> ApiResponse {
    let mut endpoints = json!({
        "/api/hashtable": {
            "methods": ["GET", "POST"],
            "description": "Hash records for files, directories, and links",
            "fields": ["record", "hash", "timestamp", "priority", "untracked", "orphaned"],
        },
        "/api/logs": {
            "methods": ["GET", "POST", "DELETE"],
            "description": "Operational log entries",
            "actions": ["consolidate", "shippable", "older_than"],
        },
        "/api/health": {
            "methods": ["GET"],
            "description": "API and store liveness",
            "aliases": ["/health", "/api/lifecheck"],
        },
    });
    if state.pipeline.is_some() {
        endpoints["/api/pipeline"] = json!({
            "methods": ["GET", "POST"],
            "description": "Authorized pipeline updates and site list (core only)",
            "actions": ["updates", "sites", "hash", "site_status"],
        });
        endpoints["/api/remote_status"] = json!({
            "methods": ["POST"],
            "description": "Remote-site hash status batches (core only)",
        });
    }
    (
        StatusCode::OK,
        Json(json!({
            "api_version": "1.0",
            "site_name": state.site_name,
            "site_type": if state.pipeline.is_some() { "core" } else { "remote" },
            "endpoints": endpoints,
        })),
    )
}

// ---------------------------------------------------------------------------
// Router & entry point
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/hashtable", get(hashtable_get).post(hashtable_post))
        .route(
            "/api/logs",
            get(logs_get).post(logs_post).delete(logs_delete),
        )
        .route("/api/health", get(health))
        .route("/health", get(health))
        .route("/api/lifecheck", get(health))
        .route("/api/docs", get(docs))
        .route("/api/pipeline", get(pipeline_get).post(pipeline_post))
        .route("/api/remote_status", post(remote_status_post))
        .with_state(state)
}

/// Open the stores, bind the listener, and serve until shutdown.
pub fn run(config: &Config) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(config.db_path.as_std_path(), config.site_name.clone())
            .context("Failed to open the hash store")?,
    );
    let pipeline = if config.is_core() {
        Some(Arc::new(
            PipelineStore::open(config.pipeline_db_path.as_std_path())
                .context("Failed to open the pipeline store")?,
        ))
    } else {
        None
    };
    let state = Arc::new(AppState {
        store,
        pipeline,
        site_name: config.site_name.clone(),
    });

    let addr = format!("{}:{}", config.rest_api_host, config.rest_api_port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        tracing::info!("REST service listening on {}", addr);
        axum::serve(listener, router(state)).await?;
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Time formatting
// ---------------------------------------------------------------------------

/// Epoch seconds to an ISO-8601 UTC timestamp.
fn iso8601_utc(epoch: i64) -> String {
    let secs_of_day = epoch.rem_euclid(86400);
    let days = (epoch - secs_of_day) / 86400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        secs_of_day / 3600,
        (secs_of_day / 60) % 60,
        secs_of_day % 60
    )
}

/// Days since 1970-01-01 to (year, month, day) in the proleptic Gregorian
/// calendar.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719468;
    let era = (if z >= 0 { z } else { z - 146096 }) / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn state() -> SharedState {
        Arc::new(AppState {
            store: Arc::new(MemoryStore::new("SITE1")),
            pipeline: Some(Arc::new(PipelineStore::open_in_memory().unwrap())),
            site_name: "SITE1".to_string(),
        })
    }

    fn remote_state() -> SharedState {
        Arc::new(AppState {
            store: Arc::new(MemoryStore::new("SITE2")),
            pipeline: None,
            site_name: "SITE2".to_string(),
        })
    }

    #[test]
    fn iso8601_formats_known_instants() {
        assert_eq!(iso8601_utc(0), "1970-01-01T00:00:00Z");
        assert_eq!(iso8601_utc(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(iso8601_utc(1_700_000_000), "2023-11-14T22:13:20Z");
    }

    #[tokio::test]
    async fn hashtable_get_unknown_field_is_400() {
        let query = HashtableQuery {
            path: Some("/b".to_string()),
            field: Some("sideways".to_string()),
        };
        let (status, _) = hashtable_get(State(state()), Query(query)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn hashtable_get_missing_record_is_404() {
        let query = HashtableQuery {
            path: Some("/missing".to_string()),
            field: None,
        };
        let (status, body) = hashtable_get(State(state()), Query(query)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.0["status"], 404);
    }

    #[tokio::test]
    async fn hashtable_post_then_get_round_trip() {
        let shared = state();
        let body = json!({ "path": "/b/f", "current_hash": "abc" });
        let (status, envelope) =
            hashtable_post(State(shared.clone()), Some(Json(body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope.0["message"], "Success");
        assert_eq!(envelope.0["data"]["created"][0], "/b/f");

        let query = HashtableQuery {
            path: Some("/b/f".to_string()),
            field: Some("hash".to_string()),
        };
        let (status, envelope) = hashtable_get(State(shared), Query(query)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope.0["data"], "abc");
    }

    #[tokio::test]
    async fn hashtable_post_missing_hash_is_400() {
        let body = json!({ "path": "/b/f" });
        let (status, _) = hashtable_post(State(state()), Some(Json(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logs_post_defaults_site_and_sanitizes_level() {
        let shared = state();
        let body = json!({
            "summary_message": "hello",
            "log_level": "NOT-A-LEVEL",
            "site_id": "local",
        });
        let (status, _) = logs_post(State(shared.clone()), Some(Json(body))).await;
        assert_eq!(status, StatusCode::OK);

        let entries = shared.store.shippable_logs();
        assert_eq!(entries[0].site_id, "SITE1");
        assert_eq!(entries[0].log_level, LogLevel::Info);
    }

    #[tokio::test]
    async fn logs_get_requires_known_action() {
        let query = LogsQuery {
            action: Some("rotate".to_string()),
            days: None,
        };
        let (status, _) = logs_get(State(state()), Query(query)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logs_older_than_validates_days() {
        let query = LogsQuery {
            action: Some("older_than".to_string()),
            days: Some("ninety".to_string()),
        };
        let (status, _) = logs_get(State(state()), Query(query)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let query = LogsQuery {
            action: Some("older_than".to_string()),
            days: Some("-1".to_string()),
        };
        let (status, _) = logs_get(State(state()), Query(query)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logs_delete_partial_success_is_207() {
        let shared = state();
        let id = shared.store.put_log(&LogEntry::new("x")).unwrap();
        let body = json!({ "log_ids": [id, 999] });
        let (status, envelope) = logs_delete(State(shared), Some(Json(body))).await;
        assert_eq!(status, StatusCode::MULTI_STATUS);
        assert_eq!(envelope.0["data"]["failed_deletes"][0], 999);
    }

    #[tokio::test]
    async fn health_is_200_with_services() {
        let (status, envelope) = health(State(state())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope.0["data"]["status"], "healthy");
        assert_eq!(envelope.0["data"]["services"]["api"], true);
        assert_eq!(envelope.0["data"]["services"]["database"], true);
        assert_eq!(envelope.0["data"]["site_name"], "SITE1");
    }

    #[tokio::test]
    async fn pipeline_unavailable_on_remote_site() {
        let query = PipelineQuery {
            action: Some("updates".to_string()),
        };
        let (status, _) = pipeline_get(State(remote_state()), Query(query)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn remote_status_requires_updates() {
        let body = json!({
            "action": "remote_updates",
            "site_name": "SITE2",
            "updates": [],
        });
        let (status, _) = remote_status_post(State(state()), Some(Json(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn remote_status_batch_lands_in_pipeline_store() {
        let shared = state();
        let body = json!({
            "action": "remote_updates",
            "site_name": "SITE2",
            "updates": [
                { "path": "/b/x", "local_hash": "l", "core_hash": "c" },
            ],
        });
        let (status, envelope) = remote_status_post(State(shared.clone()), Some(Json(body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope.0["data"], 1);

        let rows = shared.pipeline.as_ref().unwrap().remote_status_for("SITE2");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "/b/x");
    }
}
