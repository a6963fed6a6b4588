// tests/proxy_integration_tests.rs
//
// End-to-end behavior of the proxy pipeline against a stub upstream:
// auth rewriting, body passthrough, retries across keys, blacklisting,
// and the admin surface.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use secrecy::Secret;
use tower::ServiceExt;
use wiremock::matchers::{header as match_header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use keypool_proxy::config::AppConfig;
use keypool_proxy::create_router;
use keypool_proxy::key_service::KeyService;
use keypool_proxy::models::KeyStatus;
use keypool_proxy::state::AppState;

const ADMIN_KEY: &str = "admin-secret";
const PROXY_KEY: &str = "proxy-key";

fn test_config() -> AppConfig {
    AppConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        auth_key: ADMIN_KEY.to_string(),
        encryption_key: None,
        database_dsn: "sqlite::memory:".to_string(),
        redis_dsn: None,
        is_slave: true,
    }
}

async fn test_state(channel_type: &str, upstream_url: &str, keys: &[&str]) -> (Arc<AppState>, Router, i64) {
    let state = Arc::new(AppState::new(test_config()).await.unwrap());

    // Accept PROXY_KEY on every group.
    let mut fields = serde_json::Map::new();
    fields.insert("proxy_keys".to_string(), serde_json::json!(PROXY_KEY));
    state.settings.update(&fields).await.unwrap();

    let group_id = state
        .db
        .create_group(&keypool_proxy::models::Group {
            id: 0,
            name: "testgroup".to_string(),
            channel_type: channel_type.to_string(),
            upstreams: vec![keypool_proxy::models::Upstream {
                url: upstream_url.to_string(),
                weight: 1,
            }],
            validation_endpoint: String::new(),
            test_model: "test-model".to_string(),
            header_rules: vec![],
            proxy_keys: String::new(),
            config_override: Default::default(),
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    if !keys.is_empty() {
        let service = KeyService::new(
            state.db.clone(),
            state.pool.clone(),
            state.validator.clone(),
            state.crypto.clone(),
        );
        service
            .add_multiple_keys(group_id, &keys.join("\n"), None)
            .await
            .unwrap();
    }

    let app = create_router(state.clone());
    (state, app, group_id)
}

fn proxy_request(path_and_query: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path_and_query)
        .header(header::AUTHORIZATION, format!("Bearer {PROXY_KEY}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

#[tokio::test]
async fn happy_path_rewrites_auth_and_streams_body_back() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(match_header("authorization", "Bearer sk-upstream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"{"id":"cmpl-1","choices":[]}"#, "application/json"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let (_state, app, _gid) = test_state("openai", &upstream.uri(), &["sk-upstream"]).await;

    let request_body = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#;
    let response = app
        .oneshot(proxy_request("/proxy/testgroup/v1/chat/completions", request_body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, br#"{"id":"cmpl-1","choices":[]}"#);

    // The upstream saw the pool key, not the client's proxy key, and the body
    // travelled through unchanged.
    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].headers.get("authorization").unwrap(),
        "Bearer sk-upstream"
    );
    assert_eq!(received[0].body, request_body.as_bytes());
}

#[tokio::test]
async fn missing_or_wrong_proxy_key_is_rejected() {
    let upstream = MockServer::start().await;
    let (_state, app, _gid) = test_state("openai", &upstream.uri(), &["sk-upstream"]).await;

    let no_auth = Request::builder()
        .method("POST")
        .uri("/proxy/testgroup/v1/chat/completions")
        .body(Body::from("{}"))
        .unwrap();
    let response = app.clone().oneshot(no_auth).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .method("POST")
        .uri("/proxy/testgroup/v1/chat/completions")
        .header(header::AUTHORIZATION, "Bearer not-the-key")
        .body(Body::from("{}"))
        .unwrap();
    let response = app.clone().oneshot(wrong).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Query-string carrier is accepted.
    let via_query = Request::builder()
        .method("POST")
        .uri(format!("/proxy/testgroup/v1/chat/completions?key={PROXY_KEY}"))
        .body(Body::from("{}"))
        .unwrap();
    let response = app.oneshot(via_query).await.unwrap();
    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(upstream.received_requests().await.unwrap().len() <= 1);
}

#[tokio::test]
async fn unknown_group_is_not_found() {
    let upstream = MockServer::start().await;
    let (_state, app, _gid) = test_state("openai", &upstream.uri(), &["sk-upstream"]).await;

    let response = app
        .oneshot(proxy_request("/proxy/nosuchgroup/v1/chat/completions", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_pool_maps_to_service_unavailable() {
    let upstream = MockServer::start().await;
    let (_state, app, _gid) = test_state("openai", &upstream.uri(), &[]).await;

    let response = app
        .oneshot(proxy_request("/proxy/testgroup/v1/chat/completions", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn retry_moves_to_a_different_key_on_server_error() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(match_header("authorization", "Bearer sk-bad"))
        .respond_with(ResponseTemplate::new(500).set_body_raw(
            r#"{"error":{"message":"server exploded"}}"#,
            "application/json",
        ))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(match_header("authorization", "Bearer sk-good"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"ok":true}"#, "application/json"))
        .mount(&upstream)
        .await;

    let (state, app, gid) = test_state("openai", &upstream.uri(), &["sk-bad", "sk-good"]).await;
    let bad_hash = state.crypto.hash("sk-bad");

    // The client always sees success; whichever order keys are tried, the
    // engine lands on the good one. Keep issuing requests until the bad key
    // has provably been attempted and punished once.
    let mut bad_failures = 0;
    for _ in 0..30 {
        let response = app
            .clone()
            .oneshot(proxy_request("/proxy/testgroup/v1/chat/completions", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let keys = state.db.keys_by_group(gid, None).await.unwrap();
        let bad = keys.iter().find(|k| k.key_hash == bad_hash).unwrap();
        bad_failures = bad.failure_count;
        if bad_failures >= 1 {
            break;
        }
    }
    assert!(bad_failures >= 1, "bad key should have accumulated a failure");
}

#[tokio::test]
async fn repeated_failures_blacklist_until_pool_is_empty() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_raw(
            r#"{"error":{"message":"overloaded"}}"#,
            "application/json",
        ))
        .mount(&upstream)
        .await;

    let (state, app, gid) = test_state("openai", &upstream.uri(), &["sk-only"]).await;

    // Default threshold is 3: three failing requests blacklist the key.
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(proxy_request("/proxy/testgroup/v1/chat/completions", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Reports are fire-and-forget; wait for this one to land before the
        // next request so the count is deterministic.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let keys = state.db.keys_by_group(gid, None).await.unwrap();
            if keys[0].failure_count > 0 || keys[0].status == KeyStatus::Invalid {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "report never landed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let keys = state.db.keys_by_group(gid, None).await.unwrap();
        if keys[0].status == KeyStatus::Invalid {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "key never blacklisted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // With the only key blacklisted the pool is empty.
    let response = app
        .clone()
        .oneshot(proxy_request("/proxy/testgroup/v1/chat/completions", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Admin restore brings it back.
    let keys = state.db.keys_by_group(gid, None).await.unwrap();
    state.pool.restore_keys(gid).await.unwrap();
    let restored = state.db.find_key(keys[0].id).await.unwrap();
    assert_eq!(restored.status, KeyStatus::Active);
    assert_eq!(restored.failure_count, 0);
}

#[tokio::test]
async fn non_retryable_client_errors_pass_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_raw(
            r#"{"error":{"message":"bad request"}}"#,
            "application/json",
        ))
        .expect(1)
        .mount(&upstream)
        .await;

    let (_state, app, _gid) = test_state("openai", &upstream.uri(), &["sk-upstream"]).await;
    let response = app
        .oneshot(proxy_request("/proxy/testgroup/v1/chat/completions", "{}"))
        .await
        .unwrap();

    // One upstream call, no retry, body mirrored.
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_bytes(response).await, br#"{"error":{"message":"bad request"}}"#);
}

#[tokio::test]
async fn event_stream_bytes_are_mirrored() {
    let sse = "data: {\"delta\":\"hel\"}\n\ndata: {\"delta\":\"lo\"}\n\ndata: [DONE]\n\n";
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(&upstream)
        .await;

    let (_state, app, _gid) = test_state("openai", &upstream.uri(), &["sk-upstream"]).await;
    let response = app
        .oneshot(proxy_request(
            "/proxy/testgroup/v1/chat/completions",
            r#"{"model":"gpt-4o","stream":true,"messages":[]}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );
    assert_eq!(body_bytes(response).await, sse.as_bytes());
}

#[tokio::test]
async fn gemini_channel_replaces_key_query_param() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .mount(&upstream)
        .await;

    let (_state, app, _gid) = test_state("gemini", &upstream.uri(), &["gm-pool-key"]).await;
    let response = app
        .oneshot(proxy_request(
            &format!("/proxy/testgroup/v1beta/models/gemini-pro:generateContent?key={PROXY_KEY}"),
            r#"{"contents":[]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].headers.get("x-goog-api-key").unwrap(), "gm-pool-key");
    let key_params: Vec<String> = received[0]
        .url
        .query_pairs()
        .filter(|(k, _)| k == "key")
        .map(|(_, v)| v.into_owned())
        .collect();
    assert_eq!(key_params, vec!["gm-pool-key".to_string()]);
}

#[tokio::test]
async fn success_is_reported_only_after_the_body_closes() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"ok":true}"#, "application/json"))
        .mount(&upstream)
        .await;

    let (state, app, gid) = test_state("openai", &upstream.uri(), &["sk-upstream"]).await;

    let response = app
        .oneshot(proxy_request("/proxy/testgroup/v1/chat/completions", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Headers have arrived but the body has not been consumed: no success has
    // been booked yet.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let key = state.db.keys_by_group(gid, None).await.unwrap().remove(0);
    assert_eq!(key.request_count, 0);

    // Draining the body to its clean end books the success.
    assert_eq!(body_bytes(response).await, br#"{"ok":true}"#);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let key = state.db.keys_by_group(gid, None).await.unwrap().remove(0);
        if key.request_count == 1 {
            assert_eq!(key.failure_count, 0);
            assert_eq!(key.status, KeyStatus::Active);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "success report never landed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn client_disconnect_mid_stream_is_uncounted() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: {\"delta\":\"never read\"}\n\n",
            "text/event-stream",
        ))
        .mount(&upstream)
        .await;

    let (state, app, gid) = test_state("openai", &upstream.uri(), &["sk-upstream"]).await;

    let response = app
        .oneshot(proxy_request(
            "/proxy/testgroup/v1/chat/completions",
            r#"{"model":"gpt-4o","stream":true,"messages":[]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The client goes away without reading the body. The attempt is reported
    // with the disconnect marker: uncounted, so neither a success nor a
    // failure lands on the key.
    drop(response);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let key = state.db.keys_by_group(gid, None).await.unwrap().remove(0);
    assert_eq!(key.status, KeyStatus::Active);
    assert_eq!(key.failure_count, 0);
    assert_eq!(key.request_count, 0);
}

#[tokio::test]
async fn request_logs_capture_final_outcome() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .mount(&upstream)
        .await;

    let (state, app, _gid) = test_state("openai", &upstream.uri(), &["sk-upstream"]).await;
    let response = app
        .oneshot(proxy_request(
            "/proxy/testgroup/v1/chat/completions",
            r#"{"model":"gpt-4o","messages":[]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The log writer flushes on a one-second ticker.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let logs = loop {
        let logs = state.db.recent_request_logs(10).await.unwrap();
        if !logs.is_empty() {
            break logs;
        }
        assert!(tokio::time::Instant::now() < deadline, "log entry never flushed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(logs[0]["group_name"], "testgroup");
    assert_eq!(logs[0]["status_code"], 200);
    assert_eq!(logs[0]["success"], true);
    assert_eq!(logs[0]["model"], "gpt-4o");
    assert_eq!(logs[0]["attempts"], 1);
}

// --- Admin surface ---

fn admin_request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_KEY}"))
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn admin_requires_bearer_auth() {
    let upstream = MockServer::start().await;
    let (_state, app, _gid) = test_state("openai", &upstream.uri(), &[]).await;

    let anonymous = Request::builder()
        .method("GET")
        .uri("/api/groups")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(anonymous).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.oneshot(admin_request("GET", "/api/groups", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_key_lifecycle_add_export_weight_delete() {
    let upstream = MockServer::start().await;
    let (_state, app, gid) = test_state("openai", &upstream.uri(), &[]).await;

    // Import two keys, one with an explicit weight suffix.
    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            "/api/keys/add",
            Some(serde_json::json!({"group_id": gid, "keys_text": "sk-one\nsk-two:25"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(result["added_count"], 2);
    assert_eq!(result["total_in_group"], 2);

    // Re-importing the same keys is a no-op.
    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            "/api/keys/add",
            Some(serde_json::json!({"group_id": gid, "keys_text": "sk-one sk-two"})),
        ))
        .await
        .unwrap();
    let result: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(result["added_count"], 0);
    assert_eq!(result["ignored_count"], 2);

    // Export returns the plaintext keys, one per line.
    let response = app
        .clone()
        .oneshot(admin_request(
            "GET",
            &format!("/api/keys/export?group_id={gid}&status=active"),
            None,
        ))
        .await
        .unwrap();
    let exported = String::from_utf8(body_bytes(response).await).unwrap();
    let mut lines: Vec<&str> = exported.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["sk-one", "sk-two"]);

    // Batch weight update by plaintext.
    let response = app
        .clone()
        .oneshot(admin_request(
            "PUT",
            "/api/keys/weight-batch",
            Some(serde_json::json!({"group_id": gid, "keys_text": "sk-one", "weight": 42})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(result["updated_count"], 1);

    // Delete one key.
    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            "/api/keys/delete",
            Some(serde_json::json!({"group_id": gid, "keys_text": "sk-two"})),
        ))
        .await
        .unwrap();
    let result: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(result["deleted_count"], 1);
    assert_eq!(result["total_in_group"], 1);
}

#[tokio::test]
async fn admin_settings_round_trip_and_group_override() {
    let upstream = MockServer::start().await;
    let (state, app, _gid) = test_state("openai", &upstream.uri(), &[]).await;

    let response = app
        .clone()
        .oneshot(admin_request(
            "PUT",
            "/api/settings",
            Some(serde_json::json!({"max_retries": 7, "enable_cache_hit": true})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let current = state.settings.current();
    assert_eq!(current.max_retries, 7);
    assert!(current.enable_cache_hit);

    // Group override wins over the system value.
    let ov = keypool_proxy::config::settings::GroupConfigOverride {
        max_retries: Some(1),
        ..Default::default()
    };
    assert_eq!(state.settings.effective_for(&ov).max_retries, 1);
    assert!(state.settings.effective_for(&ov).enable_cache_hit);
}

#[tokio::test]
async fn encrypted_state_round_trips_through_proxy() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(match_header("authorization", "Bearer sk-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut config = test_config();
    config.encryption_key = Some(Secret::new("vault-key".to_string()));
    let state = Arc::new(AppState::new(config).await.unwrap());
    let mut fields = serde_json::Map::new();
    fields.insert("proxy_keys".to_string(), serde_json::json!(PROXY_KEY));
    state.settings.update(&fields).await.unwrap();

    let gid = state
        .db
        .create_group(&keypool_proxy::models::Group {
            id: 0,
            name: "enc".to_string(),
            channel_type: "openai".to_string(),
            upstreams: vec![keypool_proxy::models::Upstream {
                url: upstream.uri(),
                weight: 1,
            }],
            validation_endpoint: String::new(),
            test_model: String::new(),
            header_rules: vec![],
            proxy_keys: String::new(),
            config_override: Default::default(),
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let service = KeyService::new(
        state.db.clone(),
        state.pool.clone(),
        state.validator.clone(),
        state.crypto.clone(),
    );
    service.add_multiple_keys(gid, "sk-secret", None).await.unwrap();

    // At rest: ciphertext, not plaintext.
    let stored = state.db.keys_by_group(gid, None).await.unwrap();
    assert_ne!(stored[0].key_value, "sk-secret");

    let app = create_router(state.clone());
    let response = app
        .oneshot(proxy_request("/proxy/enc/v1/chat/completions", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
