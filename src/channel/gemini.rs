// src/channel/gemini.rs

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::channel::{
    apply_header_rules, default_is_stream, probe_result, strip_client_auth, validation_url, Channel,
};
use crate::error::Result;
use crate::models::Group;

/// Google Gemini generate-content adapter. Auth travels both as the
/// `x-goog-api-key` header and the `key=` query parameter; any client-supplied
/// `key` parameter is replaced, never forwarded.
pub struct GeminiChannel;

#[async_trait]
impl Channel for GeminiChannel {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn rewrite_request(&self, headers: &mut HeaderMap, url: &mut Url, key_plaintext: &str, group: &Group) {
        strip_client_auth(headers, url);
        if let Ok(value) = HeaderValue::from_str(key_plaintext) {
            headers.insert("x-goog-api-key", value);
        }
        url.query_pairs_mut().append_pair("key", key_plaintext);
        apply_header_rules(headers, &group.header_rules);
    }

    fn is_stream(&self, headers: &HeaderMap, url: &Url, body: &[u8]) -> bool {
        if url.path().contains(":streamGenerateContent") {
            return true;
        }
        if url.query_pairs().any(|(k, v)| k == "alt" && v == "sse") {
            return true;
        }
        default_is_stream(headers, url, body)
    }

    fn extract_model(&self, body: &[u8]) -> Option<String> {
        // Gemini carries the model in the path, not the body; fall back to the
        // body for OpenAI-compat payloads sent through this channel.
        crate::channel::default_extract_model(body)
    }

    async fn validate_key(
        &self,
        client: &Client,
        key_plaintext: &str,
        group: &Group,
        timeout: Duration,
    ) -> Result<()> {
        let default_endpoint = format!("/v1beta/models/{}:generateContent", group.test_model);
        let mut url = validation_url(group, &default_endpoint)?;
        url.query_pairs_mut().append_pair("key", key_plaintext);
        let payload = serde_json::json!({
            "contents": [{"parts": [{"text": "hi"}]}],
        });
        let response = client
            .post(url)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await?;
        probe_result(response).await
    }
}
