// src/config/settings.rs

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::db::Database;
use crate::error::Result;

/// System-wide tunables, stored in the `system_settings` table and published
/// as a versioned snapshot. Each field can be overridden per group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SystemSettings {
    /// Additional attempts after the first, each on a distinct key.
    pub max_retries: u32,
    /// Consecutive failures before a key is blacklisted; 0 disables.
    pub blacklist_threshold: u32,
    pub request_timeout_s: u64,
    pub connect_timeout_s: u64,
    pub idle_conn_timeout_s: u64,
    pub response_header_timeout_s: u64,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    /// Outbound proxy for upstream calls, e.g. `socks5://127.0.0.1:1080`.
    pub proxy_url: Option<String>,
    pub key_validation_interval_min: u64,
    pub key_validation_concurrency: usize,
    pub key_validation_timeout_s: u64,
    pub enable_cache_hit: bool,
    pub enable_request_body_logging: bool,
    /// Comma-separated global proxy keys accepted on every group.
    pub proxy_keys: String,
    pub graceful_shutdown_timeout_s: u64,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            blacklist_threshold: 3,
            request_timeout_s: 600,
            connect_timeout_s: 15,
            idle_conn_timeout_s: 120,
            response_header_timeout_s: 600,
            max_idle_conns: 100,
            max_idle_conns_per_host: 50,
            proxy_url: None,
            key_validation_interval_min: 60,
            key_validation_concurrency: 10,
            key_validation_timeout_s: 20,
            enable_cache_hit: false,
            enable_request_body_logging: false,
            proxy_keys: String::new(),
            graceful_shutdown_timeout_s: 10,
        }
    }
}

/// Per-group override of [`SystemSettings`]; every field optional, `None`
/// inherits the system value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GroupConfigOverride {
    pub max_retries: Option<u32>,
    pub blacklist_threshold: Option<u32>,
    pub request_timeout_s: Option<u64>,
    pub connect_timeout_s: Option<u64>,
    pub idle_conn_timeout_s: Option<u64>,
    pub response_header_timeout_s: Option<u64>,
    pub max_idle_conns: Option<usize>,
    pub max_idle_conns_per_host: Option<usize>,
    pub proxy_url: Option<String>,
    pub key_validation_interval_min: Option<u64>,
    pub key_validation_concurrency: Option<usize>,
    pub key_validation_timeout_s: Option<u64>,
    pub enable_cache_hit: Option<bool>,
    pub enable_request_body_logging: Option<bool>,
}

impl SystemSettings {
    /// Produces the effective per-group configuration by overlaying the
    /// group's override onto this snapshot.
    pub fn merged_with(&self, ov: &GroupConfigOverride) -> SystemSettings {
        SystemSettings {
            max_retries: ov.max_retries.unwrap_or(self.max_retries),
            blacklist_threshold: ov.blacklist_threshold.unwrap_or(self.blacklist_threshold),
            request_timeout_s: ov.request_timeout_s.unwrap_or(self.request_timeout_s),
            connect_timeout_s: ov.connect_timeout_s.unwrap_or(self.connect_timeout_s),
            idle_conn_timeout_s: ov.idle_conn_timeout_s.unwrap_or(self.idle_conn_timeout_s),
            response_header_timeout_s: ov
                .response_header_timeout_s
                .unwrap_or(self.response_header_timeout_s),
            max_idle_conns: ov.max_idle_conns.unwrap_or(self.max_idle_conns),
            max_idle_conns_per_host: ov
                .max_idle_conns_per_host
                .unwrap_or(self.max_idle_conns_per_host),
            proxy_url: ov.proxy_url.clone().or_else(|| self.proxy_url.clone()),
            key_validation_interval_min: ov
                .key_validation_interval_min
                .unwrap_or(self.key_validation_interval_min),
            key_validation_concurrency: ov
                .key_validation_concurrency
                .unwrap_or(self.key_validation_concurrency),
            key_validation_timeout_s: ov
                .key_validation_timeout_s
                .unwrap_or(self.key_validation_timeout_s),
            enable_cache_hit: ov.enable_cache_hit.unwrap_or(self.enable_cache_hit),
            enable_request_body_logging: ov
                .enable_request_body_logging
                .unwrap_or(self.enable_request_body_logging),
            proxy_keys: self.proxy_keys.clone(),
            graceful_shutdown_timeout_s: self.graceful_shutdown_timeout_s,
        }
    }
}

/// Hot-reloadable settings registry. Readers pay one pointer load per access
/// and always see a consistent snapshot.
pub struct SettingsManager {
    snapshot: ArcSwap<SystemSettings>,
    db: Database,
}

impl SettingsManager {
    /// Loads the current settings from the database, falling back to defaults
    /// for any missing field.
    pub async fn load(db: Database) -> Result<Self> {
        let settings = Self::read_from_db(&db).await?;
        info!(?settings, "System settings loaded");
        Ok(Self {
            snapshot: ArcSwap::from_pointee(settings),
            db,
        })
    }

    async fn read_from_db(db: &Database) -> Result<SystemSettings> {
        let rows = db.load_system_settings().await?;
        let mut value = serde_json::to_value(SystemSettings::default())
            .expect("default settings serialize");
        let map = value.as_object_mut().expect("settings serialize to an object");
        for (key, raw) in rows {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) {
                map.insert(key, parsed);
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Current snapshot; cheap enough to call on every request.
    pub fn current(&self) -> Arc<SystemSettings> {
        self.snapshot.load_full()
    }

    /// Effective configuration for a group.
    pub fn effective_for(&self, ov: &GroupConfigOverride) -> SystemSettings {
        self.snapshot.load().merged_with(ov)
    }

    /// Persists the given fields and republishes the snapshot.
    pub async fn update(&self, fields: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        for (key, value) in fields {
            self.db
                .upsert_system_setting(key, &serde_json::to_string(value)?)
                .await?;
        }
        self.reload().await
    }

    /// Re-reads the settings from the database and swaps the snapshot.
    pub async fn reload(&self) -> Result<()> {
        let settings = Self::read_from_db(&self.db).await?;
        self.snapshot.store(Arc::new(settings));
        info!("System settings snapshot republished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_where_present() {
        let sys = SystemSettings {
            max_retries: 3,
            blacklist_threshold: 5,
            ..SystemSettings::default()
        };
        let ov = GroupConfigOverride {
            max_retries: Some(1),
            enable_cache_hit: Some(true),
            proxy_url: Some("socks5://127.0.0.1:1080".to_string()),
            ..GroupConfigOverride::default()
        };

        let eff = sys.merged_with(&ov);
        assert_eq!(eff.max_retries, 1);
        assert_eq!(eff.blacklist_threshold, 5);
        assert!(eff.enable_cache_hit);
        assert_eq!(eff.proxy_url.as_deref(), Some("socks5://127.0.0.1:1080"));
    }

    #[test]
    fn empty_override_is_identity() {
        let sys = SystemSettings::default();
        let eff = sys.merged_with(&GroupConfigOverride::default());
        assert_eq!(eff, sys);
    }

    #[test]
    fn override_deserializes_from_partial_json() {
        let ov: GroupConfigOverride =
            serde_json::from_str(r#"{"blacklist_threshold": 9, "enable_cache_hit": true}"#).unwrap();
        assert_eq!(ov.blacklist_threshold, Some(9));
        assert_eq!(ov.enable_cache_hit, Some(true));
        assert_eq!(ov.max_retries, None);
    }
}
