// tests/validator_tests.rs
//
// Key validator behavior against a stub upstream: on-demand probes, manual
// test batches, and recovery sweeps over blacklisted keys.

use std::sync::Arc;

use wiremock::matchers::{header as match_header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use keypool_proxy::config::AppConfig;
use keypool_proxy::error::AppError;
use keypool_proxy::key_service::KeyService;
use keypool_proxy::models::{Group, KeyStatus, Upstream};
use keypool_proxy::state::AppState;

fn test_config() -> AppConfig {
    AppConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        auth_key: "admin-secret".to_string(),
        encryption_key: None,
        database_dsn: "sqlite::memory:".to_string(),
        redis_dsn: None,
        is_slave: true,
    }
}

async fn state_with_group(upstream_url: &str, keys: &[&str]) -> (Arc<AppState>, Group) {
    let state = Arc::new(AppState::new(test_config()).await.unwrap());
    let mut group = Group {
        id: 0,
        name: "probe".to_string(),
        channel_type: "openai".to_string(),
        upstreams: vec![Upstream {
            url: upstream_url.to_string(),
            weight: 1,
        }],
        validation_endpoint: String::new(),
        test_model: "test-model".to_string(),
        header_rules: vec![],
        proxy_keys: String::new(),
        config_override: Default::default(),
        created_at: chrono::Utc::now(),
    };
    group.id = state.db.create_group(&group).await.unwrap();

    if !keys.is_empty() {
        let service = KeyService::new(
            state.db.clone(),
            state.pool.clone(),
            state.validator.clone(),
            state.crypto.clone(),
        );
        service
            .add_multiple_keys(group.id, &keys.join("\n"), None)
            .await
            .unwrap();
    }
    (state, group)
}

#[tokio::test]
async fn probe_success_reports_into_the_pool() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .mount(&upstream)
        .await;

    let (state, group) = state_with_group(&upstream.uri(), &["sk-valid"]).await;
    let key = state.db.keys_by_group(group.id, None).await.unwrap().remove(0);

    let (ok, error) = state.validator.validate_key(&group, &key).await;
    assert!(ok);
    assert!(error.is_none());
    assert_eq!(
        state.db.find_key(key.id).await.unwrap().status,
        KeyStatus::Active
    );
}

#[tokio::test]
async fn failed_probe_disables_the_key_immediately() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_raw(
            r#"{"error":{"message":"Incorrect API key provided"}}"#,
            "application/json",
        ))
        .mount(&upstream)
        .await;

    let (state, group) = state_with_group(&upstream.uri(), &["sk-dead"]).await;
    let key = state.db.keys_by_group(group.id, None).await.unwrap().remove(0);

    let (ok, error) = state.validator.validate_key(&group, &key).await;
    assert!(!ok);
    let message = error.unwrap();
    assert!(message.contains("[status 401]"), "got: {message}");
    assert!(message.contains("Incorrect API key provided"), "got: {message}");

    // Manual probes force-disable on first failure.
    assert_eq!(
        state.db.find_key(key.id).await.unwrap().status,
        KeyStatus::Invalid
    );
}

#[tokio::test]
async fn sweep_recovers_blacklisted_keys_that_work_again() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .mount(&upstream)
        .await;

    let (state, group) = state_with_group(&upstream.uri(), &["sk-a", "sk-b"]).await;
    let keys = state.db.keys_by_group(group.id, None).await.unwrap();

    // Blacklist both keys.
    for key in &keys {
        state
            .pool
            .apply_report(key.id, group.id, false, "[status 500] down", true, 3)
            .await
            .unwrap();
    }
    assert!(matches!(
        state.pool.select(group.id).await,
        Err(AppError::NoActiveKeys)
    ));

    // Sweep only invalid keys; the upstream is healthy again, so both recover.
    let summary = state
        .validator
        .sweep_group(&group, Some(KeyStatus::Invalid), None)
        .await
        .unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.valid, 2);
    assert_eq!(summary.invalid, 0);

    for key in &keys {
        let refreshed = state.db.find_key(key.id).await.unwrap();
        assert_eq!(refreshed.status, KeyStatus::Active);
        assert_eq!(refreshed.failure_count, 0);
    }
    assert!(state.pool.select(group.id).await.is_ok());
}

#[tokio::test]
async fn sweep_reports_progress() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .mount(&upstream)
        .await;

    let (state, group) = state_with_group(&upstream.uri(), &["sk-a", "sk-b", "sk-c"]).await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    let callback: Arc<dyn Fn(usize) + Send + Sync> = Arc::new(move |n| {
        seen_cb.lock().unwrap().push(n);
    });

    let summary = state
        .validator
        .sweep_group(&group, None, Some(callback))
        .await
        .unwrap();
    assert_eq!(summary.total, 3);

    let progress = seen.lock().unwrap();
    assert_eq!(progress.len(), 3);
    assert_eq!(*progress.iter().max().unwrap(), 3);
}

#[tokio::test]
async fn test_keys_probes_unknown_keys_without_pool_reports() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(match_header("authorization", "Bearer sk-member"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(match_header("authorization", "Bearer sk-stranger"))
        .respond_with(ResponseTemplate::new(403).set_body_raw(
            r#"{"error":{"message":"forbidden"}}"#,
            "application/json",
        ))
        .mount(&upstream)
        .await;

    let (state, group) = state_with_group(&upstream.uri(), &["sk-member"]).await;

    let results = state
        .validator
        .test_keys(&group, &["sk-member".to_string(), "sk-stranger".to_string()])
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_valid);
    assert!(!results[1].is_valid);
    assert!(results[1].error.as_deref().unwrap().contains("forbidden"));

    // The member key stays active; the stranger never entered the pool.
    let keys = state.db.keys_by_group(group.id, None).await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].status, KeyStatus::Active);
}
