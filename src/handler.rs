// src/handler.rs

use axum::{
    body::to_bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::settings::SystemSettings;
use crate::error::{
    is_retryable_status, parse_upstream_error, AppError, Result, DEFAULT_RETRYABLE_STATUSES,
};
use crate::models::Group;
use crate::proxy;
use crate::request_log::RequestLogEntry;
use crate::state::AppState;

/// How many selection rounds to spend looking for a key id not yet tried in
/// this request before giving up on distinctness.
const DISTINCT_SELECT_ROUNDS: usize = 8;

/// Simple health check handler. Returns HTTP 200 OK.
#[instrument(name = "health_check", level = "debug", skip_all)]
pub async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// The transparent proxy endpoint: `ANY /proxy/{group}/{rest...}`.
#[instrument(name = "proxy_handler", skip_all, fields(group = %group_name, path = %rest))]
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path((group_name, rest)): Path<(String, String)>,
    req: Request,
) -> Result<Response> {
    let started = Instant::now();
    let group = state.db.find_group_by_name(&group_name).await?;
    let cfg = state.settings.effective_for(&group.config_override);

    let method = req.method().clone();
    let headers = req.headers().clone();
    let query = req.uri().query().map(str::to_string);

    authenticate_client(&state, &group, &cfg, &headers, query.as_deref())?;

    // The body is always fully buffered: retries and affinity both need it.
    let body_bytes = to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| AppError::InvalidRequest {
            message: format!("failed to buffer request body: {e}"),
        })?;

    let channel = state.channels.get(&group.channel_type)?;
    let inspect_url = Url::parse(&format!(
        "http://inspect.local/{}{}",
        rest.trim_start_matches('/'),
        query.as_deref().map(|q| format!("?{q}")).unwrap_or_default()
    ))?;
    let is_stream = channel.is_stream(&headers, &inspect_url, &body_bytes);
    let model = channel.extract_model(&body_bytes);
    debug!(is_stream, model = model.as_deref().unwrap_or(""), "request classified");

    let forward_headers = proxy::build_forward_headers(&headers);
    let client = state.get_client(&cfg).await?;
    let response_header_timeout = Duration::from_secs(cfg.response_header_timeout_s);

    let max_attempts = cfg.max_retries + 1;
    let mut seen_keys: HashSet<i64> = HashSet::new();
    let mut last_error: Option<(u16, String)> = None;
    let mut last_key_id: Option<i64> = None;
    let mut attempts: u32 = 0;

    for attempt in 0..max_attempts {
        let key = match select_distinct_key(&state, &group, &cfg, &body_bytes, &seen_keys).await {
            Ok(Some(key)) => key,
            Ok(None) => break,
            Err(AppError::NoActiveKeys) if attempt == 0 => {
                record_request(
                    &state, &group, &cfg, None, model.clone(), &method, &rest, 503, false, 0,
                    started, Some("no active keys".into()), &body_bytes,
                );
                return Err(AppError::NoActiveKeys);
            }
            Err(e) if attempt == 0 => return Err(e),
            Err(_) => break,
        };
        seen_keys.insert(key.id);
        last_key_id = Some(key.id);
        attempts += 1;

        let upstream = proxy::pick_upstream(&group.upstreams)?;
        let mut target = proxy::build_target_url(&upstream.url, &rest, query.as_deref())?;
        let mut out_headers = forward_headers.clone();
        channel.rewrite_request(&mut out_headers, &mut target, &key.key_value, &group);

        debug!(
            attempt = attempt + 1,
            key_id = key.id,
            key = %key.preview(),
            upstream = %upstream.url,
            "forwarding request"
        );

        // Each attempt yields exactly one report. If the client disconnects
        // while this attempt is in flight, dropping the handler (or the
        // response body later) aborts the upstream call and the reporter
        // books the attempt as an uncounted disconnect.
        let reporter =
            proxy::AttemptReporter::new(state.pool.clone(), key.id, group.id, cfg.blacklist_threshold);

        let upstream_response = match proxy::forward(
            &client,
            method.clone(),
            target,
            out_headers,
            body_bytes.clone(),
            response_header_timeout,
        )
        .await
        {
            Ok(response) => response,
            Err(e) => {
                let message = e.to_string();
                warn!(key_id = key.id, error = %message, "upstream request failed, trying next key");
                reporter.failure(&message);
                last_error = Some((502, message));
                continue;
            }
        };

        let status = upstream_response.status().as_u16();
        if is_retryable_status(status, DEFAULT_RETRYABLE_STATUSES) {
            let body = upstream_response.bytes().await.unwrap_or_default();
            let message = format!("[status {status}] {}", parse_upstream_error(&body));
            warn!(key_id = key.id, status, "retryable upstream status, trying next key");
            reporter.failure(&message);
            last_error = Some((status, message));
            continue;
        }

        // Terminal response, success or not at the HTTP level: stream it
        // back. The success report fires once the upstream body closes
        // normally, not at header receipt.
        info!(key_id = key.id, status, attempts, "upstream responded, streaming body");
        record_request(
            &state, &group, &cfg, Some(key.id), model.clone(), &method, &rest, status,
            status < 400, attempts, started, None, &body_bytes,
        );
        return proxy::stream_response(upstream_response, reporter);
    }

    // Retry budget exhausted or no distinct key left.
    let (status, message) = last_error.unwrap_or((503, "no active keys available".to_string()));
    warn!(status, attempts, error = %message, "all attempts exhausted");
    record_request(
        &state, &group, &cfg, last_key_id, model, &method, &rest, status, false, attempts,
        started, Some(message.clone()), &body_bytes,
    );
    Err(AppError::Upstream { status, message })
}

/// Client authentication against the union of global and group proxy keys.
/// Carriers in precedence order: bearer token, `x-api-key`, `?key=`,
/// `?access_token=`.
fn authenticate_client(
    state: &AppState,
    group: &Group,
    cfg: &SystemSettings,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<()> {
    let presented = extract_client_credential(headers, query).ok_or_else(|| {
        AppError::Authentication {
            message: "missing proxy key".to_string(),
        }
    })?;

    let allowed = cfg
        .proxy_keys
        .split(',')
        .chain(group.proxy_keys.split(','))
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .chain(std::iter::once(state.config.auth_key.as_str()));

    for key in allowed {
        if key == presented {
            return Ok(());
        }
    }
    Err(AppError::Authentication {
        message: "invalid proxy key".to_string(),
    })
}

fn extract_client_credential(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    if let Some(query) = query {
        for param in ["key", "access_token"] {
            if let Some(value) = url::form_urlencoded::parse(query.as_bytes())
                .find(|(k, _)| k == param)
                .map(|(_, v)| v.into_owned())
            {
                return Some(value);
            }
        }
    }
    None
}

/// Selects a key not yet tried in this request. Affinity may repeatedly hand
/// back the same pinned key, so a bounded number of rounds is spent before
/// giving up; `Ok(None)` means every active key has been tried.
async fn select_distinct_key(
    state: &AppState,
    group: &Group,
    cfg: &SystemSettings,
    body: &[u8],
    seen: &HashSet<i64>,
) -> Result<Option<crate::models::ApiKey>> {
    for _ in 0..DISTINCT_SELECT_ROUNDS {
        let key = state
            .pool
            .select_with_affinity(group.id, body, cfg.enable_cache_hit)
            .await?;
        if !seen.contains(&key.id) {
            return Ok(Some(key));
        }
    }
    Ok(None)
}

#[allow(clippy::too_many_arguments)]
fn record_request(
    state: &AppState,
    group: &Group,
    cfg: &SystemSettings,
    key_id: Option<i64>,
    model: Option<String>,
    method: &axum::http::Method,
    path: &str,
    status_code: u16,
    success: bool,
    attempts: u32,
    started: Instant,
    error: Option<String>,
    body: &[u8],
) {
    let request_body = if cfg.enable_request_body_logging {
        Some(String::from_utf8_lossy(body).into_owned())
    } else {
        None
    };
    state.request_logger.record(RequestLogEntry {
        id: Uuid::new_v4(),
        group_name: group.name.clone(),
        key_id,
        model,
        method: method.to_string(),
        path: path.to_string(),
        status_code,
        success,
        attempts,
        duration_ms: started.elapsed().as_millis() as u64,
        error,
        request_body,
        created_at: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn credential_extraction_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-bearer"),
        );
        headers.insert("x-api-key", HeaderValue::from_static("from-header"));

        assert_eq!(
            extract_client_credential(&headers, Some("key=from-query")),
            Some("from-bearer".to_string())
        );

        headers.remove(header::AUTHORIZATION);
        assert_eq!(
            extract_client_credential(&headers, Some("key=from-query")),
            Some("from-header".to_string())
        );

        let empty = HeaderMap::new();
        assert_eq!(
            extract_client_credential(&empty, Some("key=from-query")),
            Some("from-query".to_string())
        );
        assert_eq!(
            extract_client_credential(&empty, Some("access_token=tok")),
            Some("tok".to_string())
        );
        assert_eq!(extract_client_credential(&empty, None), None);
        assert_eq!(extract_client_credential(&empty, Some("other=x")), None);
    }
}
