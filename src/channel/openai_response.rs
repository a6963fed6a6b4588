// src/channel/openai_response.rs

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue};
use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::channel::{apply_header_rules, probe_result, strip_client_auth, validation_url, Channel};
use crate::error::Result;
use crate::models::Group;

/// OpenAI Responses API adapter. Same bearer auth as chat/completions but the
/// validation probe uses the `input` field of `/v1/responses`.
pub struct OpenAiResponseChannel;

#[async_trait]
impl Channel for OpenAiResponseChannel {
    fn name(&self) -> &'static str {
        "openai-response"
    }

    fn rewrite_request(&self, headers: &mut HeaderMap, url: &mut Url, key_plaintext: &str, group: &Group) {
        strip_client_auth(headers, url);
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key_plaintext}")) {
            headers.insert(header::AUTHORIZATION, value);
        }
        apply_header_rules(headers, &group.header_rules);
    }

    async fn validate_key(
        &self,
        client: &Client,
        key_plaintext: &str,
        group: &Group,
        timeout: Duration,
    ) -> Result<()> {
        let url = validation_url(group, "/v1/responses")?;
        let payload = serde_json::json!({
            "model": group.test_model,
            "input": "hi",
        });
        let response = client
            .post(url)
            .bearer_auth(key_plaintext)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await?;
        probe_result(response).await
    }
}
