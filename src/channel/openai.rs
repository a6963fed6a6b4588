// src/channel/openai.rs

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue};
use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::channel::{apply_header_rules, probe_result, strip_client_auth, validation_url, Channel};
use crate::error::Result;
use crate::models::Group;

/// OpenAI-compatible chat/completions adapter. Auth is `Authorization: Bearer`.
pub struct OpenAiChannel;

#[async_trait]
impl Channel for OpenAiChannel {
    fn name(&self) -> &'static str {
        "openai"
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
        let url = validation_url(group, "/v1/chat/completions")?;
        let payload = serde_json::json!({
            "model": group.test_model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::test_group;

    #[test]
    fn bearer_auth_replaces_client_credentials() {
        let channel = OpenAiChannel;
        let group = test_group("openai");
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer proxy-secret".parse().unwrap());
        let mut url = Url::parse("https://up.example.com/v1/chat/completions?key=p").unwrap();

        channel.rewrite_request(&mut headers, &mut url, "sk-upstream", &group);

        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer sk-upstream");
        assert!(url.query().is_none());
    }

    #[test]
    fn header_rules_run_after_auth() {
        let channel = OpenAiChannel;
        let mut group = test_group("openai");
        group.header_rules = vec![crate::models::HeaderRule {
            action: crate::models::HeaderRuleAction::Set,
            key: "x-org".into(),
            value: "team-a".into(),
        }];
        let mut headers = HeaderMap::new();
        let mut url = Url::parse("https://up.example.com/v1/chat/completions").unwrap();

        channel.rewrite_request(&mut headers, &mut url, "sk-upstream", &group);
        assert_eq!(headers.get("x-org").unwrap(), "team-a");
    }
}
