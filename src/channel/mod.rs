// src/channel/mod.rs

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod openai_response;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{parse_upstream_error, AppError, Result};
use crate::models::{Group, HeaderRule, HeaderRuleAction};

/// Client-supplied auth carriers, stripped before vendor auth is applied.
const CLIENT_AUTH_HEADERS: &[&str] = &["authorization", "x-api-key", "x-goog-api-key"];
const CLIENT_AUTH_QUERY_PARAMS: &[&str] = &["key", "access_token"];

/// A vendor adapter: knows how to authenticate an outbound request, detect
/// streaming, extract the model name, and probe a single key.
///
/// Adapters never mutate client input buffers; they operate on the freshly
/// allocated outbound request the proxy engine hands them.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Applies vendor auth to the outbound request, strips client-supplied
    /// auth, and applies the group's header rules.
    fn rewrite_request(&self, headers: &mut HeaderMap, url: &mut Url, key_plaintext: &str, group: &Group);

    /// Whether the response should be treated as an event stream.
    fn is_stream(&self, headers: &HeaderMap, url: &Url, body: &[u8]) -> bool {
        default_is_stream(headers, url, body)
    }

    /// Parses `"model"` from the request body for logging and validation.
    fn extract_model(&self, body: &[u8]) -> Option<String> {
        default_extract_model(body)
    }

    /// Vendor-specific single-shot probe against the group's validation
    /// endpoint. Non-2xx responses become `AppError::Upstream` carrying the
    /// parsed upstream message.
    async fn validate_key(
        &self,
        client: &Client,
        key_plaintext: &str,
        group: &Group,
        timeout: Duration,
    ) -> Result<()>;
}

/// Named adapter registry, populated once at startup.
pub struct ChannelRegistry {
    adapters: HashMap<&'static str, Arc<dyn Channel>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        registry.register(Arc::new(openai::OpenAiChannel));
        registry.register(Arc::new(openai_response::OpenAiResponseChannel));
        registry.register(Arc::new(gemini::GeminiChannel));
        registry.register(Arc::new(anthropic::AnthropicChannel));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn Channel>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    pub fn get(&self, channel_type: &str) -> Result<Arc<dyn Channel>> {
        self.adapters
            .get(channel_type)
            .cloned()
            .ok_or_else(|| AppError::validation("channel_type", format!("unknown channel '{channel_type}'")))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.adapters.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Removes every client auth carrier from headers and query string.
pub fn strip_client_auth(headers: &mut HeaderMap, url: &mut Url) {
    for name in CLIENT_AUTH_HEADERS {
        headers.remove(*name);
    }
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !CLIENT_AUTH_QUERY_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if retained.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &retained {
            pairs.append_pair(k, v);
        }
    }
}

/// Applies the group's ordered header directives.
pub fn apply_header_rules(headers: &mut HeaderMap, rules: &[HeaderRule]) {
    for rule in rules {
        let Ok(name) = rule.key.parse::<HeaderName>() else {
            continue;
        };
        match rule.action {
            HeaderRuleAction::Set => {
                if let Ok(value) = HeaderValue::from_str(&rule.value) {
                    headers.insert(name, value);
                }
            }
            HeaderRuleAction::Remove => {
                headers.remove(name);
            }
        }
    }
}

/// Shared stream detection: `Accept: text/event-stream`, `?stream=true`, or
/// `"stream": true` in a JSON body.
pub fn default_is_stream(headers: &HeaderMap, url: &Url, body: &[u8]) -> bool {
    if headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
    {
        return true;
    }
    if url.query_pairs().any(|(k, v)| k == "stream" && v == "true") {
        return true;
    }
    #[derive(serde::Deserialize)]
    struct StreamPayload {
        #[serde(default)]
        stream: bool,
    }
    serde_json::from_slice::<StreamPayload>(body)
        .map(|p| p.stream)
        .unwrap_or(false)
}

pub fn default_extract_model(body: &[u8]) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct ModelPayload {
        model: String,
    }
    serde_json::from_slice::<ModelPayload>(body)
        .ok()
        .map(|p| p.model)
        .filter(|m| !m.is_empty())
}

/// Builds the probe URL from the group's first upstream and its validation
/// endpoint, preserving any query the endpoint carries.
pub fn validation_url(group: &Group, default_endpoint: &str) -> Result<Url> {
    let upstream = group.upstreams.first().ok_or_else(|| {
        AppError::validation("upstreams", format!("group '{}' has no upstreams", group.name))
    })?;
    let endpoint = if group.validation_endpoint.is_empty() {
        default_endpoint
    } else {
        &group.validation_endpoint
    };
    let base = Url::parse(upstream.url.trim_end_matches('/'))?;
    let (path, query) = match endpoint.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (endpoint, None),
    };
    let mut url = Url::parse(&format!(
        "{}{}",
        base.as_str().trim_end_matches('/'),
        path
    ))?;
    url.set_query(query);
    Ok(url)
}

/// Converts a probe response into the validator's result shape, reading the
/// error body on non-2xx.
pub async fn probe_result(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.bytes().await.unwrap_or_default();
    let message = parse_upstream_error(&body);
    Err(AppError::Upstream {
        status: status.as_u16(),
        message: format!("[status {}] {}", status.as_u16(), message),
    })
}
