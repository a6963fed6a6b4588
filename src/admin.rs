// src/admin.rs

use axum::{
    extract::{Path, Query, Request, State},
    http::header,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

use crate::config::settings::GroupConfigOverride;
use crate::error::{AppError, Result};
use crate::key_service::KeyService;
use crate::models::{Group, HeaderRule, KeyStatus, Upstream};
use crate::state::AppState;
use crate::tasks::{TaskKind, TaskState};

/// JSON admin API, authenticated with `Authorization: Bearer <AUTH_KEY>`.
pub fn admin_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/:id", put(update_group).delete(delete_group))
        .route("/api/groups/:id/validate", post(validate_group))
        .route("/api/keys/add", post(add_keys))
        .route("/api/keys/add-async", post(add_keys_async))
        .route("/api/keys/delete", post(delete_keys))
        .route("/api/keys/delete-async", post(delete_keys_async))
        .route("/api/keys/restore", post(restore_keys))
        .route("/api/keys/restore-all", post(restore_all_keys))
        .route("/api/keys/clear-invalid", post(clear_invalid_keys))
        .route("/api/keys/clear-all", post(clear_all_keys))
        .route("/api/keys/clear-stats", post(clear_key_stats))
        .route("/api/keys/test", post(test_keys))
        .route("/api/keys/export", get(export_keys))
        .route("/api/keys/weight", put(update_key_weight))
        .route("/api/keys/weight-batch", put(update_keys_weight))
        .route("/api/keys/weight/reset", post(reset_group_weights))
        .route("/api/keys/weight/reset-one", post(reset_key_weight))
        .route("/api/keys/real-time-weight", get(real_time_weight))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/tasks/:kind", get(task_status))
        .route("/api/logs", get(recent_logs))
        .layer(middleware::from_fn_with_state(state, admin_auth))
}

async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == state.config.auth_key);

    if !authorized {
        return AppError::Authentication {
            message: "invalid admin key".to_string(),
        }
        .into_response();
    }
    next.run(req).await
}

fn key_service(state: &AppState) -> KeyService {
    KeyService::new(
        state.db.clone(),
        state.pool.clone(),
        state.validator.clone(),
        state.crypto.clone(),
    )
}

// --- Groups ---

#[derive(Deserialize)]
struct GroupPayload {
    name: String,
    channel_type: String,
    upstreams: Vec<Upstream>,
    #[serde(default)]
    validation_endpoint: String,
    #[serde(default)]
    test_model: String,
    #[serde(default)]
    header_rules: Vec<HeaderRule>,
    #[serde(default)]
    proxy_keys: String,
    #[serde(default)]
    config_override: GroupConfigOverride,
}

impl GroupPayload {
    fn validate(&self, state: &AppState) -> Result<()> {
        if self.name.trim().is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AppError::validation(
                "name",
                "group name must be a non-empty URL-safe token",
            ));
        }
        if self.upstreams.is_empty() {
            return Err(AppError::validation("upstreams", "at least one upstream is required"));
        }
        for upstream in &self.upstreams {
            url::Url::parse(&upstream.url)
                .map_err(|e| AppError::validation("upstreams", format!("bad url '{}': {e}", upstream.url)))?;
        }
        state.channels.get(&self.channel_type)?;
        Ok(())
    }
}

async fn list_groups(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Group>>> {
    Ok(Json(state.db.list_groups().await?))
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GroupPayload>,
) -> Result<Json<Group>> {
    payload.validate(&state)?;
    let mut group = Group {
        id: 0,
        name: payload.name,
        channel_type: payload.channel_type,
        upstreams: payload.upstreams,
        validation_endpoint: payload.validation_endpoint,
        test_model: payload.test_model,
        header_rules: payload.header_rules,
        proxy_keys: payload.proxy_keys,
        config_override: payload.config_override,
        created_at: Utc::now(),
    };
    group.id = state.db.create_group(&group).await?;
    Ok(Json(group))
}

async fn update_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<GroupPayload>,
) -> Result<Json<Group>> {
    payload.validate(&state)?;
    let existing = state.db.find_group_by_id(id).await?;
    let group = Group {
        id,
        name: existing.name,
        channel_type: payload.channel_type,
        upstreams: payload.upstreams,
        validation_endpoint: payload.validation_endpoint,
        test_model: payload.test_model,
        header_rules: payload.header_rules,
        proxy_keys: payload.proxy_keys,
        config_override: payload.config_override,
        created_at: existing.created_at,
    };
    state.db.update_group(&group).await?;
    Ok(Json(group))
}

async fn delete_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.pool.remove_all(id).await?;
    state.db.delete_group(id).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

// --- Keys ---

#[derive(Deserialize)]
struct KeyTextRequest {
    group_id: i64,
    keys_text: String,
}

#[derive(Deserialize)]
struct GroupIdRequest {
    group_id: i64,
}

async fn add_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyTextRequest>,
) -> Result<Json<serde_json::Value>> {
    state.db.find_group_by_id(req.group_id).await?;
    let result = key_service(&state)
        .add_multiple_keys(req.group_id, &req.keys_text, None)
        .await?;
    Ok(Json(serde_json::to_value(result)?))
}

async fn add_keys_async(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyTextRequest>,
) -> Result<Json<serde_json::Value>> {
    state.db.find_group_by_id(req.group_id).await?;
    let total = crate::key_service::parse_keys_with_weight(&req.keys_text).len();
    let handle = state.tasks.start(TaskKind::ImportKeys, req.group_id, total)?;
    let task_id = handle.id();

    let service = key_service(&state);
    tokio::spawn(async move {
        let progress = handle.clone();
        let outcome = service
            .add_multiple_keys(req.group_id, &req.keys_text, Some(&move |n| progress.progress(n)))
            .await;
        match outcome {
            Ok(result) => handle.finish(serde_json::to_value(result).unwrap_or_default()),
            Err(e) => {
                error!(error = %e, "async key import failed");
                handle.fail(e.to_string());
            }
        }
    });
    Ok(Json(serde_json::json!({"task_id": task_id})))
}

async fn delete_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyTextRequest>,
) -> Result<Json<serde_json::Value>> {
    state.db.find_group_by_id(req.group_id).await?;
    let result = key_service(&state)
        .delete_multiple_keys(req.group_id, &req.keys_text, None)
        .await?;
    Ok(Json(serde_json::to_value(result)?))
}

async fn delete_keys_async(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyTextRequest>,
) -> Result<Json<serde_json::Value>> {
    state.db.find_group_by_id(req.group_id).await?;
    let total = crate::key_service::parse_keys_with_weight(&req.keys_text).len();
    let handle = state.tasks.start(TaskKind::DeleteKeys, req.group_id, total)?;
    let task_id = handle.id();

    let service = key_service(&state);
    tokio::spawn(async move {
        let progress = handle.clone();
        let outcome = service
            .delete_multiple_keys(req.group_id, &req.keys_text, Some(&move |n| progress.progress(n)))
            .await;
        match outcome {
            Ok(result) => handle.finish(serde_json::to_value(result).unwrap_or_default()),
            Err(e) => {
                error!(error = %e, "async key deletion failed");
                handle.fail(e.to_string());
            }
        }
    });
    Ok(Json(serde_json::json!({"task_id": task_id})))
}

async fn restore_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyTextRequest>,
) -> Result<Json<serde_json::Value>> {
    let result = key_service(&state)
        .restore_multiple_keys(req.group_id, &req.keys_text)
        .await?;
    Ok(Json(serde_json::to_value(result)?))
}

async fn restore_all_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GroupIdRequest>,
) -> Result<Json<serde_json::Value>> {
    let restored = key_service(&state).restore_all_invalid(req.group_id).await?;
    Ok(Json(serde_json::json!({"restored_count": restored})))
}

async fn clear_invalid_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GroupIdRequest>,
) -> Result<Json<serde_json::Value>> {
    let removed = key_service(&state).clear_invalid(req.group_id).await?;
    Ok(Json(serde_json::json!({"removed_count": removed})))
}

async fn clear_all_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GroupIdRequest>,
) -> Result<Json<serde_json::Value>> {
    let removed = key_service(&state).clear_all(req.group_id).await?;
    Ok(Json(serde_json::json!({"removed_count": removed})))
}

async fn clear_key_stats(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GroupIdRequest>,
) -> Result<Json<serde_json::Value>> {
    let cleared = key_service(&state).clear_stats(req.group_id).await?;
    Ok(Json(serde_json::json!({"cleared_count": cleared})))
}

async fn test_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyTextRequest>,
) -> Result<Json<serde_json::Value>> {
    let group = state.db.find_group_by_id(req.group_id).await?;
    let results = key_service(&state)
        .test_multiple_keys(&group, &req.keys_text)
        .await?;
    Ok(Json(serde_json::to_value(results)?))
}

#[derive(Deserialize)]
struct ExportQuery {
    group_id: i64,
    #[serde(default = "default_status_filter")]
    status: String,
}

fn default_status_filter() -> String {
    "all".to_string()
}

async fn export_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExportQuery>,
) -> Result<String> {
    key_service(&state).export_keys(query.group_id, &query.status).await
}

#[derive(Deserialize)]
struct KeyWeightRequest {
    key_id: i64,
    weight: i64,
}

async fn update_key_weight(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyWeightRequest>,
) -> Result<Json<serde_json::Value>> {
    state.pool.update_weight(req.key_id, req.weight).await?;
    Ok(Json(serde_json::json!({"key_id": req.key_id, "weight": req.weight})))
}

#[derive(Deserialize)]
struct KeysWeightRequest {
    group_id: i64,
    keys_text: String,
    weight: i64,
}

async fn update_keys_weight(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeysWeightRequest>,
) -> Result<Json<serde_json::Value>> {
    let result = key_service(&state)
        .update_keys_weight(req.group_id, &req.keys_text, req.weight)
        .await?;
    Ok(Json(serde_json::to_value(result)?))
}

async fn reset_group_weights(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GroupIdRequest>,
) -> Result<Json<serde_json::Value>> {
    let updated = key_service(&state).reset_keys_weight(req.group_id).await?;
    Ok(Json(serde_json::json!({"updated_count": updated})))
}

#[derive(Deserialize)]
struct KeyIdRequest {
    key_id: i64,
}

async fn reset_key_weight(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyIdRequest>,
) -> Result<Json<serde_json::Value>> {
    state.pool.reset_weight(req.key_id).await?;
    Ok(Json(serde_json::json!({"key_id": req.key_id})))
}

#[derive(Deserialize)]
struct KeyIdQuery {
    key_id: i64,
}

async fn real_time_weight(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyIdQuery>,
) -> Result<Json<serde_json::Value>> {
    let weight = state.pool.real_time_weight(query.key_id).await;
    Ok(Json(serde_json::json!({"key_id": query.key_id, "weight": weight})))
}

// --- Validation ---

#[derive(Deserialize)]
struct ValidateRequest {
    #[serde(default = "default_status_filter")]
    status: String,
}

async fn validate_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<serde_json::Value>> {
    let group = state.db.find_group_by_id(id).await?;
    let status = match req.status.as_str() {
        "active" => Some(KeyStatus::Active),
        "invalid" => Some(KeyStatus::Invalid),
        "all" => None,
        other => {
            return Err(AppError::validation(
                "status",
                format!("invalid status filter '{other}'"),
            ))
        }
    };

    let total = state.db.keys_by_group(id, status).await?.len();
    let handle = state.tasks.start(TaskKind::ValidateGroup, id, total)?;
    let task_id = handle.id();

    let validator = state.validator.clone();
    tokio::spawn(async move {
        let progress = handle.clone();
        let callback: Arc<dyn Fn(usize) + Send + Sync> = Arc::new(move |n| progress.progress(n));
        match validator.sweep_group(&group, status, Some(callback)).await {
            Ok(summary) => handle.finish(serde_json::to_value(summary).unwrap_or_default()),
            Err(e) => {
                error!(group_id = id, error = %e, "manual validation sweep failed");
                handle.fail(e.to_string());
            }
        }
    });
    Ok(Json(serde_json::json!({"task_id": task_id})))
}

async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> Result<Json<TaskState>> {
    let kind = TaskKind::parse(&kind)
        .ok_or_else(|| AppError::validation("kind", format!("unknown task kind '{kind}'")))?;
    state
        .tasks
        .status(kind)
        .map(Json)
        .ok_or_else(|| AppError::not_found("task"))
}

// --- Settings & logs ---

async fn get_settings(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    Ok(Json(serde_json::to_value(state.settings.current().as_ref())?))
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(fields): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<Json<serde_json::Value>> {
    state.settings.update(&fields).await?;
    Ok(Json(serde_json::to_value(state.settings.current().as_ref())?))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_limit")]
    limit: i64,
}

fn default_log_limit() -> i64 {
    100
}

async fn recent_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<serde_json::Value>>> {
    Ok(Json(state.db.recent_request_logs(query.limit.clamp(1, 1000)).await?))
}
