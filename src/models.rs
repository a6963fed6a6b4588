// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::settings::GroupConfigOverride;

/// Status of an API key within its group pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Invalid,
}

impl KeyStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single credential in a group's pool.
///
/// `key_value` holds ciphertext when the record comes from the database and
/// plaintext when it was synthesized by the pool for an outbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub group_id: i64,
    pub key_value: String,
    pub key_hash: String,
    pub status: KeyStatus,
    pub base_weight: i64,
    pub weight: i64,
    pub failure_count: i64,
    pub request_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub notes: Option<String>,
}

impl ApiKey {
    /// Short preview of the key for logging. Never logs the full value.
    pub fn preview(&self) -> String {
        preview_key(&self.key_value)
    }
}

pub fn preview_key(key: &str) -> String {
    if key.chars().count() > 8 {
        let head: String = key.chars().take(4).collect();
        let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        format!("{head}...{tail}")
    } else {
        "***".to_string()
    }
}

/// One upstream target URL with its selection weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub url: String,
    #[serde(default = "default_upstream_weight")]
    pub weight: u32,
}

fn default_upstream_weight() -> u32 {
    1
}

/// Header manipulation directive applied by a channel after auth rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRule {
    pub action: HeaderRuleAction,
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderRuleAction {
    Set,
    Remove,
}

/// A logical partition owning a set of keys and a set of upstream endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub channel_type: String,
    pub upstreams: Vec<Upstream>,
    pub validation_endpoint: String,
    pub test_model: String,
    #[serde(default)]
    pub header_rules: Vec<HeaderRule>,
    /// Comma-separated group-scoped proxy keys, unioned with the global set.
    #[serde(default)]
    pub proxy_keys: String,
    #[serde(default)]
    pub config_override: GroupConfigOverride,
    pub created_at: DateTime<Utc>,
}

/// Result of a one-off validation probe for a single key.
#[derive(Debug, Clone, Serialize)]
pub struct KeyTestResult {
    pub key_value: String,
    pub is_valid: bool,
    pub error: Option<String>,
}
