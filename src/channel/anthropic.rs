// src/channel/anthropic.rs

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::channel::{apply_header_rules, probe_result, strip_client_auth, validation_url, Channel};
use crate::error::Result;
use crate::models::Group;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages adapter. Auth is `x-api-key`; the API version header is
/// pinned unless the client already set one.
pub struct AnthropicChannel;

#[async_trait]
impl Channel for AnthropicChannel {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn rewrite_request(&self, headers: &mut HeaderMap, url: &mut Url, key_plaintext: &str, group: &Group) {
        strip_client_auth(headers, url);
        if let Ok(value) = HeaderValue::from_str(key_plaintext) {
            headers.insert("x-api-key", value);
        }
        if !headers.contains_key("anthropic-version") {
            headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
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
        let url = validation_url(group, "/v1/messages")?;
        let payload = serde_json::json!({
            "model": group.test_model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
        });
        let response = client
            .post(url)
            .header("x-api-key", key_plaintext)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await?;
        probe_result(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::test_group;

    #[test]
    fn sets_api_key_and_version() {
        let channel = AnthropicChannel;
        let group = test_group("anthropic");
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "client-key".parse().unwrap());
        let mut url = Url::parse("https://up.example.com/v1/messages").unwrap();

        channel.rewrite_request(&mut headers, &mut url, "sk-ant-pool", &group);

        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-pool");
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
    }

    #[test]
    fn preserves_client_pinned_version() {
        let channel = AnthropicChannel;
        let group = test_group("anthropic");
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", "2024-10-22".parse().unwrap());
        let mut url = Url::parse("https://up.example.com/v1/messages").unwrap();

        channel.rewrite_request(&mut headers, &mut url, "sk-ant-pool", &group);
        assert_eq!(headers.get("anthropic-version").unwrap(), "2024-10-22");
    }
}
