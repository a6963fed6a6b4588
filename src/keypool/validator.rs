// src/keypool/validator.rs

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelRegistry;
use crate::config::settings::SettingsManager;
use crate::crypto::EncryptionService;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::keypool::KeyPool;
use crate::models::{ApiKey, Group, KeyStatus, KeyTestResult};

/// Outcome summary of one sweep over a group.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepSummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
}

struct ValidatorInner {
    db: Database,
    pool: KeyPool,
    channels: Arc<ChannelRegistry>,
    settings: Arc<SettingsManager>,
    crypto: Arc<EncryptionService>,
    client: reqwest::Client,
    /// Groups with a sweep currently in flight; a group is never swept twice
    /// concurrently.
    active_sweeps: Mutex<HashSet<i64>>,
}

/// Probes single keys on demand and sweeps whole pools on a schedule with
/// bounded concurrency.
#[derive(Clone)]
pub struct KeyValidator {
    inner: Arc<ValidatorInner>,
}

/// Removes the group from the active-sweep set when the sweep ends, on every
/// exit path.
struct SweepGuard {
    inner: Arc<ValidatorInner>,
    group_id: i64,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.inner
            .active_sweeps
            .lock()
            .expect("active sweeps lock poisoned")
            .remove(&self.group_id);
    }
}

impl KeyValidator {
    pub fn new(
        db: Database,
        pool: KeyPool,
        channels: Arc<ChannelRegistry>,
        settings: Arc<SettingsManager>,
        crypto: Arc<EncryptionService>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            inner: Arc::new(ValidatorInner {
                db,
                pool,
                channels,
                settings,
                crypto,
                client,
                active_sweeps: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Probes one pool key and reports the outcome through the same channel
    /// the proxy engine uses. A failed probe disables the key immediately.
    pub async fn validate_key(&self, group: &Group, key: &ApiKey) -> (bool, Option<String>) {
        let plaintext = match self.inner.crypto.decrypt(&key.key_value) {
            Ok(value) => value,
            Err(_) => key.key_value.clone(),
        };
        let (ok, error) = self.probe(group, &plaintext).await;

        let threshold = self
            .inner
            .settings
            .effective_for(&group.config_override)
            .blacklist_threshold;
        if let Err(e) = self
            .inner
            .pool
            .apply_report(
                key.id,
                group.id,
                ok,
                error.as_deref().unwrap_or_default(),
                true,
                threshold,
            )
            .await
        {
            error!(key_id = key.id, error = %e, "failed to report validation outcome");
        }
        (ok, error)
    }

    /// One-off test of plaintext keys that may or may not belong to the pool.
    /// Keys found in the group report their outcome into the pool; unknown
    /// keys are only probed.
    pub async fn test_keys(&self, group: &Group, key_values: &[String]) -> Result<Vec<KeyTestResult>> {
        let hashes: Vec<String> = key_values.iter().map(|v| self.inner.crypto.hash(v)).collect();
        let known = self.inner.db.keys_by_hashes(group.id, &hashes, None).await?;
        let threshold = self
            .inner
            .settings
            .effective_for(&group.config_override)
            .blacklist_threshold;

        let mut results = Vec::with_capacity(key_values.len());
        for key_value in key_values {
            let (ok, error) = self.probe(group, key_value).await;

            let hash = self.inner.crypto.hash(key_value);
            if let Some(known_key) = known.iter().find(|k| k.key_hash == hash) {
                if let Err(e) = self
                    .inner
                    .pool
                    .apply_report(
                        known_key.id,
                        group.id,
                        ok,
                        error.as_deref().unwrap_or_default(),
                        true,
                        threshold,
                    )
                    .await
                {
                    error!(key_id = known_key.id, error = %e, "failed to report test outcome");
                }
            }

            results.push(KeyTestResult {
                key_value: crate::models::preview_key(key_value),
                is_valid: ok,
                error,
            });
        }
        Ok(results)
    }

    async fn probe(&self, group: &Group, key_plaintext: &str) -> (bool, Option<String>) {
        let channel = match self.inner.channels.get(&group.channel_type) {
            Ok(channel) => channel,
            Err(e) => return (false, Some(e.to_string())),
        };
        let timeout = Duration::from_secs(
            self.inner
                .settings
                .effective_for(&group.config_override)
                .key_validation_timeout_s,
        );
        match channel
            .validate_key(&self.inner.client, key_plaintext, group, timeout)
            .await
        {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        }
    }

    /// Sweeps a group's keys, bounded by the configured probe concurrency.
    /// `status` filters which keys are probed; `None` probes everything.
    /// Running two sweeps for the same group concurrently is refused.
    pub async fn sweep_group(
        &self,
        group: &Group,
        status: Option<KeyStatus>,
        progress: Option<Arc<dyn Fn(usize) + Send + Sync>>,
    ) -> Result<SweepSummary> {
        {
            let mut active = self
                .inner
                .active_sweeps
                .lock()
                .expect("active sweeps lock poisoned");
            if !active.insert(group.id) {
                return Err(AppError::TaskInProgress);
            }
        }
        let _guard = SweepGuard {
            inner: self.inner.clone(),
            group_id: group.id,
        };

        let keys = self.inner.db.keys_by_group(group.id, status).await?;
        let concurrency = self
            .inner
            .settings
            .effective_for(&group.config_override)
            .key_validation_concurrency
            .max(1);

        info!(
            group = %group.name,
            key_count = keys.len(),
            concurrency,
            "starting key sweep"
        );

        let total = keys.len();
        let processed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let results: Vec<bool> = stream::iter(keys)
            .map(|key| {
                let validator = self.clone();
                let group = group.clone();
                let processed = processed.clone();
                let progress = progress.clone();
                async move {
                    let (ok, _) = validator.validate_key(&group, &key).await;
                    let done = processed.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                    if let Some(callback) = progress {
                        callback(done);
                    }
                    ok
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let valid = results.iter().filter(|ok| **ok).count();
        let summary = SweepSummary {
            total,
            valid,
            invalid: total - valid,
        };
        info!(group = %group.name, ?summary, "key sweep finished");
        Ok(summary)
    }

    /// Scheduler loop: every `key_validation_interval_min`, probe each group's
    /// blacklisted keys to recover the ones that started working again.
    pub fn start_scheduler(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let validator = self.clone();
        tokio::spawn(async move {
            loop {
                let interval_min = validator
                    .inner
                    .settings
                    .current()
                    .key_validation_interval_min
                    .max(1);
                let sleep = tokio::time::sleep(Duration::from_secs(interval_min * 60));
                tokio::select! {
                    () = sleep => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("key validation scheduler stopping");
                            return;
                        }
                        continue;
                    }
                }

                let groups = match validator.inner.db.list_groups().await {
                    Ok(groups) => groups,
                    Err(e) => {
                        error!(error = %e, "failed to list groups for scheduled validation");
                        continue;
                    }
                };
                for group in groups {
                    match validator
                        .sweep_group(&group, Some(KeyStatus::Invalid), None)
                        .await
                    {
                        Ok(summary) if summary.total > 0 => {
                            debug!(group = %group.name, recovered = summary.valid, "scheduled sweep done");
                        }
                        Ok(_) => {}
                        Err(AppError::TaskInProgress) => {
                            warn!(group = %group.name, "skipping scheduled sweep, one already running");
                        }
                        Err(e) => {
                            error!(group = %group.name, error = %e, "scheduled sweep failed");
                        }
                    }
                }
            }
        })
    }
}
