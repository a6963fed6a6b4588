// src/keypool/mod.rs

pub mod cache_hit;
pub mod validator;

use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::crypto::EncryptionService;
use crate::db::{Database, NewKey};
use crate::error::{AppError, Result};
use crate::keypool::cache_hit::{affinity_candidate, prompt_hash, CacheHitEntry, DROP_COUNTS};
use crate::models::{ApiKey, KeyStatus};
use crate::store::Store;

pub const DEFAULT_WEIGHT: i64 = 500;
pub const MIN_WEIGHT: i64 = 1;
pub const MAX_WEIGHT: i64 = 1000;

const CACHE_HIT_TTL: Duration = Duration::from_secs(10 * 60);
const HASH_DELETION_DELAY: Duration = Duration::from_secs(5 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const WEIGHT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

const LOCKED_MAX_RETRIES: u32 = 3;
const LOCKED_BASE_DELAY: Duration = Duration::from_millis(50);
const LOCKED_MAX_JITTER_MS: u64 = 150;

/// Classification hook deciding which error messages must not count against a
/// key's failure budget.
pub type UncountedPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// In-process bookkeeping for one affinity entry, mirroring what the store
/// holds until its TTL fires.
#[derive(Debug, Clone)]
struct CacheHitRecord {
    group_id: i64,
    hash: String,
    key_id: i64,
    exp_time: i64,
}

struct PoolInner {
    db: Database,
    store: Arc<dyn Store>,
    crypto: Arc<EncryptionService>,
    uncounted: UncountedPredicate,
    records: RwLock<HashMap<String, CacheHitRecord>>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

/// Authoritative per-group key pool.
///
/// Exclusively owns runtime mutations of `status`, `failure_count` and
/// `weight`; the proxy engine only reads selected keys and reports outcomes.
#[derive(Clone)]
pub struct KeyPool {
    inner: Arc<PoolInner>,
}

fn key_hash_key(key_id: i64) -> String {
    format!("key:{key_id}")
}

fn active_list_key(group_id: i64) -> String {
    format!("group:{group_id}:active_keys")
}

fn cache_hit_key(group_id: i64, hash: &str) -> String {
    format!("cache_hit:group:{group_id}:hash:{hash}")
}

fn clamp_weight(weight: i64, base_weight: i64) -> i64 {
    weight.clamp(MIN_WEIGHT, base_weight.max(MIN_WEIGHT))
}

impl KeyPool {
    pub fn new(
        db: Database,
        store: Arc<dyn Store>,
        crypto: Arc<EncryptionService>,
        uncounted: UncountedPredicate,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                db,
                store,
                crypto,
                uncounted,
                records: RwLock::new(HashMap::new()),
                maintenance: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    // --- Selection ---

    /// Weighted-random selection over the group's active keys.
    ///
    /// The active list is a rotation substrate, not a consistent snapshot:
    /// concurrent callers may interleave rotations. The guarantee is that each
    /// key is picked with probability close to `weight / total_weight`.
    pub async fn select(&self, group_id: i64) -> Result<ApiKey> {
        let list_key = active_list_key(group_id);

        let list_len = match self.inner.store.llen(&list_key).await {
            Ok(len) => len,
            Err(AppError::StoreNotFound) => 0,
            Err(e) => return Err(e),
        };
        if list_len == 0 {
            return Err(AppError::NoActiveKeys);
        }

        if list_len == 1 {
            let key_id = self.rotate_one(&list_key).await?;
            return self.get_key_details(group_id, key_id).await;
        }

        let first_id = self.rotate_one(&list_key).await?;

        let mut candidates: Vec<(i64, i64)> = Vec::with_capacity(list_len as usize);
        let mut total_weight: i64 = 0;

        if let Ok(details) = self.inner.store.hgetall(&key_hash_key(first_id)).await {
            let weight = parse_weight_field(&details);
            candidates.push((first_id, weight));
            total_weight += weight;
        }

        for _ in 1..list_len {
            let next_id = match self.rotate_one(&list_key).await {
                Ok(id) => id,
                Err(_) => break,
            };
            if next_id == first_id {
                break;
            }
            if let Ok(details) = self.inner.store.hgetall(&key_hash_key(next_id)).await {
                let weight = parse_weight_field(&details);
                candidates.push((next_id, weight));
                total_weight += weight;
            }
        }

        if candidates.is_empty() || total_weight == 0 {
            return Err(AppError::NoActiveKeys);
        }

        let pick = rand::thread_rng().gen_range(0..total_weight);
        let mut cumulative = 0;
        let mut selected_id = candidates[0].0;
        for (id, weight) in &candidates {
            cumulative += weight;
            if pick < cumulative {
                selected_id = *id;
                break;
            }
        }

        self.get_key_details(group_id, selected_id).await
    }

    /// Selection with prompt affinity: requests whose leading messages match a
    /// recent request are steered back to the same key to maximize upstream
    /// prompt caching.
    pub async fn select_with_affinity(
        &self,
        group_id: i64,
        body: &[u8],
        enable: bool,
    ) -> Result<ApiKey> {
        if !enable {
            return self.select(group_id).await;
        }
        let Some(messages) = affinity_candidate(body) else {
            return self.select(group_id).await;
        };

        for drop_count in DROP_COUNTS {
            let Some(hash) = prompt_hash(&messages, drop_count) else {
                continue;
            };
            let Ok(entry) = self.get_cache_hit_entry(group_id, &hash).await else {
                continue;
            };

            match self.get_key_details(group_id, entry.key_id).await {
                Ok(key) if key.status == KeyStatus::Active => {
                    // Register the newest prefix hash so the follow-up request
                    // matches on drop_count = 2.
                    if let Some(new_hash) = prompt_hash(&messages, 2) {
                        if new_hash != hash {
                            self.set_cache_hit_entry(group_id, &new_hash, entry.key_id).await;
                            self.adjust_weight_async(entry.key_id, -1);
                        }
                    }
                    if drop_count > 2 {
                        self.schedule_hash_deletion(group_id, hash.clone(), entry.key_id);
                    }
                    debug!(
                        group_id,
                        key_id = entry.key_id,
                        drop_count,
                        "affinity matched existing prompt hash"
                    );
                    return Ok(key);
                }
                _ => {
                    // The referenced key is gone or blacklisted; evict the
                    // entry and give the weight back.
                    let cache_key = cache_hit_key(group_id, &hash);
                    let _ = self.inner.store.delete(&cache_key).await;
                    self.remove_record(&cache_key);
                    self.adjust_weight_async(entry.key_id, 1);
                }
            }
        }

        let key = self.select(group_id).await?;
        if let Some(new_hash) = prompt_hash(&messages, 2) {
            self.set_cache_hit_entry(group_id, &new_hash, key.id).await;
            self.adjust_weight_async(key.id, -1);
            debug!(group_id, key_id = key.id, "affinity registered new prompt hash");
        }
        Ok(key)
    }

    async fn rotate_one(&self, list_key: &str) -> Result<i64> {
        let raw = match self.inner.store.rotate(list_key).await {
            Ok(raw) => raw,
            Err(AppError::StoreNotFound) => return Err(AppError::NoActiveKeys),
            Err(e) => return Err(e),
        };
        raw.parse::<i64>().map_err(|_| AppError::Store {
            message: format!("active list holds non-numeric id '{raw}'"),
        })
    }

    /// Materializes a full key from the hot cache, decrypting the stored
    /// ciphertext. Falls back to the stored value when decryption fails, for
    /// pools written before encryption was enabled.
    async fn get_key_details(&self, group_id: i64, key_id: i64) -> Result<ApiKey> {
        let details = self.inner.store.hgetall(&key_hash_key(key_id)).await?;
        if details.is_empty() {
            return Err(AppError::StoreNotFound);
        }

        let base_weight = details
            .get("base_weight")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_WEIGHT);
        let weight = details
            .get("weight")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|w| *w > 0)
            .unwrap_or(base_weight);
        let failure_count = details
            .get("failure_count")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let created_at = details
            .get("created_at")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);
        let status = details
            .get("status")
            .and_then(|s| KeyStatus::parse(s))
            .unwrap_or(KeyStatus::Active);

        let stored_value = details.get("key_string").cloned().unwrap_or_default();
        let key_value = match self.inner.crypto.decrypt(&stored_value) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(key_id, error = %e, "failed to decrypt key value, using stored value");
                stored_value.clone()
            }
        };

        Ok(ApiKey {
            id: key_id,
            group_id,
            key_value,
            key_hash: details.get("key_hash").cloned().unwrap_or_default(),
            status,
            base_weight,
            weight,
            failure_count,
            request_count: 0,
            last_used_at: None,
            created_at,
            notes: None,
        })
    }

    // --- Status accounting ---

    /// Fire-and-forget outcome report. The request pipeline never blocks on
    /// the resulting database round-trip.
    pub fn report(
        &self,
        key_id: i64,
        group_id: i64,
        ok: bool,
        error_message: &str,
        force_disable_on_failure: bool,
        blacklist_threshold: u32,
    ) {
        let pool = self.clone();
        let message = error_message.to_string();
        tokio::spawn(async move {
            if let Err(e) = pool
                .apply_report(key_id, group_id, ok, &message, force_disable_on_failure, blacklist_threshold)
                .await
            {
                error!(key_id, error = %e, "failed to apply key status report");
            }
        });
    }

    /// Synchronous core of [`report`](Self::report); exposed for the validator
    /// and for tests that need deterministic ordering.
    pub async fn apply_report(
        &self,
        key_id: i64,
        group_id: i64,
        ok: bool,
        error_message: &str,
        force_disable_on_failure: bool,
        blacklist_threshold: u32,
    ) -> Result<()> {
        if ok {
            self.handle_success(key_id, group_id).await
        } else if (self.inner.uncounted)(error_message) {
            debug!(key_id, error = error_message, "uncounted error, skipping failure handling");
            Ok(())
        } else {
            self.handle_failure(key_id, group_id, force_disable_on_failure, blacklist_threshold)
                .await
        }
    }

    async fn handle_success(&self, key_id: i64, group_id: i64) -> Result<()> {
        if let Err(e) = self.inner.db.bump_key_usage(key_id).await {
            debug!(key_id, error = %e, "failed to bump key usage counters");
        }

        let details = self.inner.store.hgetall(&key_hash_key(key_id)).await?;
        let failure_count = details
            .get("failure_count")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let is_active = details.get("status").map(String::as_str) == Some("active");

        if failure_count == 0 && is_active {
            return Ok(());
        }

        self.with_locked_retry(|| self.success_transition(key_id, group_id, is_active))
            .await
    }

    async fn success_transition(&self, key_id: i64, group_id: i64, was_active: bool) -> Result<()> {
        let mut tx = self.inner.db.pool().begin().await?;
        if was_active {
            sqlx::query("UPDATE api_keys SET failure_count = 0 WHERE id = ?1")
                .bind(key_id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("UPDATE api_keys SET failure_count = 0, status = 'active' WHERE id = ?1")
                .bind(key_id)
                .execute(&mut *tx)
                .await?;
        }

        let key_hash = key_hash_key(key_id);
        if was_active {
            self.inner
                .store
                .hset(&key_hash, &[("failure_count", "0".to_string())])
                .await?;
        } else {
            self.inner
                .store
                .hset(
                    &key_hash,
                    &[("failure_count", "0".to_string()), ("status", "active".to_string())],
                )
                .await?;
            let list_key = active_list_key(group_id);
            self.inner.store.lrem(&list_key, &key_id.to_string()).await?;
            self.inner.store.lpush(&list_key, &[key_id.to_string()]).await?;
            debug!(key_id, "key recovered, restored to active pool");
        }

        tx.commit().await?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        key_id: i64,
        group_id: i64,
        force_disable: bool,
        blacklist_threshold: u32,
    ) -> Result<()> {
        let details = self.inner.store.hgetall(&key_hash_key(key_id)).await?;
        if details.get("status").map(String::as_str) == Some("invalid") {
            return Ok(());
        }
        let failure_count = details
            .get("failure_count")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        self.with_locked_retry(|| {
            self.failure_transition(key_id, group_id, failure_count, force_disable, blacklist_threshold)
        })
        .await
    }

    async fn failure_transition(
        &self,
        key_id: i64,
        group_id: i64,
        prior_failure_count: i64,
        force_disable: bool,
        blacklist_threshold: u32,
    ) -> Result<()> {
        let new_count = prior_failure_count + 1;
        let should_blacklist =
            force_disable || (blacklist_threshold > 0 && new_count >= i64::from(blacklist_threshold));

        let mut tx = self.inner.db.pool().begin().await?;
        if should_blacklist {
            sqlx::query("UPDATE api_keys SET failure_count = ?2, status = 'invalid' WHERE id = ?1")
                .bind(key_id)
                .bind(new_count)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("UPDATE api_keys SET failure_count = ?2 WHERE id = ?1")
                .bind(key_id)
                .bind(new_count)
                .execute(&mut *tx)
                .await?;
        }

        let key_hash = key_hash_key(key_id);
        self.inner.store.hincrby(&key_hash, "failure_count", 1).await?;

        if should_blacklist {
            if force_disable {
                warn!(key_id, "manual test failed, key disabled immediately");
            } else {
                warn!(key_id, threshold = blacklist_threshold, "key reached blacklist threshold, disabling");
            }
            self.inner
                .store
                .lrem(&active_list_key(group_id), &key_id.to_string())
                .await?;
            self.inner
                .store
                .hset(&key_hash, &[("status", "invalid".to_string())])
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Bounded retry for the transient SQL contention class.
    async fn with_locked_retry<F, Fut>(&self, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut last_err = None;
        for attempt in 0..LOCKED_MAX_RETRIES {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_database_locked() && attempt + 1 < LOCKED_MAX_RETRIES => {
                    let jitter = rand::thread_rng().gen_range(0..LOCKED_MAX_JITTER_MS);
                    let delay = LOCKED_BASE_DELAY + Duration::from_millis(jitter);
                    debug!(attempt = attempt + 1, ?delay, "database locked, retrying");
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| AppError::database("locked retry budget exhausted")))
    }

    // --- Startup load ---

    /// Rebuilds the hot projection from the database: per-key hashes in bulk
    /// batches, then each group's active list.
    pub async fn load_from_db(&self) -> Result<()> {
        let keys = self.inner.db.all_keys().await?;
        info!(key_count = keys.len(), "loading key pool projection from database");

        let mut active_ids: HashMap<i64, Vec<String>> = HashMap::new();
        for batch in keys.chunks(1000) {
            let entries: Vec<(String, Vec<(&'static str, String)>)> = batch
                .iter()
                .map(|key| (key_hash_key(key.id), api_key_to_fields(key)))
                .collect();
            self.inner.store.hset_bulk(entries).await?;

            for key in batch {
                if key.status == KeyStatus::Active {
                    active_ids.entry(key.group_id).or_default().push(key.id.to_string());
                }
            }
        }

        for (group_id, ids) in active_ids {
            let list_key = active_list_key(group_id);
            self.inner.store.delete(&list_key).await?;
            self.inner.store.lpush(&list_key, &ids).await?;
        }
        Ok(())
    }

    // --- Bulk operations ---

    /// Inserts pre-hashed, pre-encrypted keys and mirrors them into the hot
    /// cache. The mirror runs inside the transaction boundary: a mirror
    /// failure rolls the insert back.
    pub async fn add_keys(&self, group_id: i64, new_keys: Vec<NewKey>) -> Result<Vec<ApiKey>> {
        if new_keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.inner.db.pool().begin().await?;
        let now = Utc::now();
        let mut created = Vec::with_capacity(new_keys.len());
        for key in &new_keys {
            let result = sqlx::query(
                "INSERT INTO api_keys
                 (group_id, key_value, key_hash, status, base_weight, weight,
                  failure_count, request_count, created_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?4, 0, 0, ?5)",
            )
            .bind(group_id)
            .bind(&key.key_value)
            .bind(&key.key_hash)
            .bind(key.weight)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            created.push(ApiKey {
                id: result.last_insert_rowid(),
                group_id,
                key_value: key.key_value.clone(),
                key_hash: key.key_hash.clone(),
                status: KeyStatus::Active,
                base_weight: key.weight,
                weight: key.weight,
                failure_count: 0,
                request_count: 0,
                last_used_at: None,
                created_at: now,
                notes: None,
            });
        }

        for key in &created {
            self.add_key_to_store(key).await?;
        }

        tx.commit().await?;
        Ok(created)
    }

    /// Removes the keys whose plaintext values are given, matching by hash.
    pub async fn remove_keys(&self, group_id: i64, key_values: &[String]) -> Result<u64> {
        let hashes = self.hashes_for(key_values);
        if hashes.is_empty() {
            return Ok(0);
        }
        let keys = self.inner.db.keys_by_hashes(group_id, &hashes, None).await?;
        self.delete_and_unmirror(group_id, keys).await
    }

    /// Restores every invalid key in the group.
    pub async fn restore_keys(&self, group_id: i64) -> Result<u64> {
        let keys = self
            .inner
            .db
            .keys_by_group(group_id, Some(KeyStatus::Invalid))
            .await?;
        self.restore_and_mirror(keys).await
    }

    /// Restores the specific invalid keys whose plaintext values are given.
    pub async fn restore_specific(&self, group_id: i64, key_values: &[String]) -> Result<u64> {
        let hashes = self.hashes_for(key_values);
        if hashes.is_empty() {
            return Ok(0);
        }
        let keys = self
            .inner
            .db
            .keys_by_hashes(group_id, &hashes, Some(KeyStatus::Invalid))
            .await?;
        self.restore_and_mirror(keys).await
    }

    pub async fn remove_invalid(&self, group_id: i64) -> Result<u64> {
        let keys = self
            .inner
            .db
            .keys_by_group(group_id, Some(KeyStatus::Invalid))
            .await?;
        self.delete_and_unmirror(group_id, keys).await
    }

    pub async fn remove_all(&self, group_id: i64) -> Result<u64> {
        let keys = self.inner.db.keys_by_group(group_id, None).await?;
        self.delete_and_unmirror(group_id, keys).await
    }

    async fn restore_and_mirror(&self, keys: Vec<ApiKey>) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = keys.iter().map(|k| k.id).collect();

        let mut tx = self.inner.db.pool().begin().await?;
        let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 1)).collect();
        let sql = format!(
            "UPDATE api_keys SET status = 'active', failure_count = 0 WHERE id IN ({})",
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(id);
        }
        let restored = query.execute(&mut *tx).await?.rows_affected();

        for key in &keys {
            let mut restored_key = key.clone();
            restored_key.status = KeyStatus::Active;
            restored_key.failure_count = 0;
            self.add_key_to_store(&restored_key).await?;
        }

        tx.commit().await?;
        Ok(restored)
    }

    async fn delete_and_unmirror(&self, group_id: i64, keys: Vec<ApiKey>) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = keys.iter().map(|k| k.id).collect();

        let mut tx = self.inner.db.pool().begin().await?;
        let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 1)).collect();
        let sql = format!("DELETE FROM api_keys WHERE id IN ({})", placeholders.join(", "));
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(id);
        }
        let removed = query.execute(&mut *tx).await?.rows_affected();

        for key in &keys {
            self.remove_key_from_store(key.id, group_id).await?;
            self.clear_records_for_key(key.id).await;
        }

        tx.commit().await?;
        Ok(removed)
    }

    fn hashes_for(&self, key_values: &[String]) -> Vec<String> {
        key_values
            .iter()
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(|v| self.inner.crypto.hash(v))
            .collect()
    }

    async fn add_key_to_store(&self, key: &ApiKey) -> Result<()> {
        self.inner
            .store
            .hset(&key_hash_key(key.id), &api_key_to_fields(key))
            .await?;
        if key.status == KeyStatus::Active {
            let list_key = active_list_key(key.group_id);
            self.inner.store.lrem(&list_key, &key.id.to_string()).await?;
            self.inner.store.lpush(&list_key, &[key.id.to_string()]).await?;
        }
        Ok(())
    }

    async fn remove_key_from_store(&self, key_id: i64, group_id: i64) -> Result<()> {
        self.inner
            .store
            .lrem(&active_list_key(group_id), &key_id.to_string())
            .await?;
        self.inner.store.delete(&key_hash_key(key_id)).await?;
        Ok(())
    }

    // --- Weight administration ---

    /// Sets both `base_weight` and runtime `weight`, persists, mirrors into
    /// the cache, and purges affinity entries pinned to the key.
    pub async fn update_weight(&self, key_id: i64, weight: i64) -> Result<()> {
        validate_weight(weight)?;
        self.with_locked_retry(|| self.apply_weight_update(key_id, weight)).await?;
        self.clear_records_for_key(key_id).await;
        Ok(())
    }

    async fn apply_weight_update(&self, key_id: i64, weight: i64) -> Result<()> {
        let mut tx = self.inner.db.pool().begin().await?;
        let updated = sqlx::query("UPDATE api_keys SET base_weight = ?2, weight = ?2 WHERE id = ?1")
            .bind(key_id)
            .bind(weight)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(AppError::not_found(format!("key {key_id}")));
        }
        self.inner
            .store
            .hset(
                &key_hash_key(key_id),
                &[
                    ("base_weight", weight.to_string()),
                    ("weight", weight.to_string()),
                ],
            )
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Bulk weight update by key hash. Returns the number of keys updated.
    pub async fn update_weights(&self, group_id: i64, key_hashes: &[String], weight: i64) -> Result<u64> {
        validate_weight(weight)?;
        if key_hashes.is_empty() {
            return Ok(0);
        }
        let keys = self.inner.db.keys_by_hashes(group_id, key_hashes, None).await?;
        let mut updated = 0;
        for key in &keys {
            self.with_locked_retry(|| self.apply_weight_update(key.id, weight)).await?;
            self.clear_records_for_key(key.id).await;
            updated += 1;
        }
        Ok(updated)
    }

    /// Resets every key in the group to the default weight.
    pub async fn reset_weights(&self, group_id: i64) -> Result<u64> {
        let keys = self.inner.db.keys_by_group(group_id, None).await?;
        let mut updated = 0;
        for key in &keys {
            self.with_locked_retry(|| self.apply_weight_update(key.id, DEFAULT_WEIGHT))
                .await?;
            self.clear_records_for_key(key.id).await;
            updated += 1;
        }
        Ok(updated)
    }

    /// Resets a single key's runtime weight back to its base weight.
    pub async fn reset_weight(&self, key_id: i64) -> Result<()> {
        let key = self.inner.db.find_key(key_id).await?;
        let base_weight = if key.base_weight > 0 { key.base_weight } else { DEFAULT_WEIGHT };
        self.inner.db.persist_key_weight(key_id, base_weight).await?;
        self.inner
            .store
            .hset(&key_hash_key(key_id), &[("weight", base_weight.to_string())])
            .await?;
        self.clear_records_for_key(key_id).await;
        Ok(())
    }

    /// Live weight as the selection algorithm sees it; 0 when the key is not
    /// in the hot cache.
    pub async fn real_time_weight(&self, key_id: i64) -> i64 {
        match self.inner.store.hgetall(&key_hash_key(key_id)).await {
            Ok(details) => details
                .get("weight")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Asynchronous cache-only weight nudge from the affinity logic, clamped
    /// to `[1, base_weight]`. No database write; the sync ticker reconciles.
    pub fn adjust_weight_async(&self, key_id: i64, delta: i64) {
        let pool = self.clone();
        tokio::spawn(async move {
            pool.apply_weight_adjust(key_id, delta).await;
        });
    }

    async fn apply_weight_adjust(&self, key_id: i64, delta: i64) {
        let Ok(details) = self.inner.store.hgetall(&key_hash_key(key_id)).await else {
            return;
        };
        if details.is_empty() {
            return;
        }
        let base_weight = details
            .get("base_weight")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_WEIGHT);
        let current = details
            .get("weight")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(base_weight);
        let new_weight = clamp_weight(current + delta, base_weight);
        let _ = self
            .inner
            .store
            .hset(&key_hash_key(key_id), &[("weight", new_weight.to_string())])
            .await;
    }

    // --- Cache-hit bookkeeping ---

    async fn get_cache_hit_entry(&self, group_id: i64, hash: &str) -> Result<CacheHitEntry> {
        let data = self.inner.store.get(&cache_hit_key(group_id, hash)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn set_cache_hit_entry(&self, group_id: i64, hash: &str, key_id: i64) {
        let cache_key = cache_hit_key(group_id, hash);
        let exp_time = (Utc::now() + chrono::Duration::from_std(CACHE_HIT_TTL).expect("ttl fits"))
            .timestamp();
        let entry = CacheHitEntry { key_id, exp_time };
        let Ok(data) = serde_json::to_vec(&entry) else {
            return;
        };
        if let Err(e) = self.inner.store.set(&cache_key, data, Some(CACHE_HIT_TTL)).await {
            debug!(error = %e, "failed to set cache-hit entry");
            return;
        }
        self.inner
            .records
            .write()
            .expect("cache-hit records lock poisoned")
            .insert(
                cache_key,
                CacheHitRecord {
                    group_id,
                    hash: hash.to_string(),
                    key_id,
                    exp_time,
                },
            );
    }

    fn remove_record(&self, cache_key: &str) {
        self.inner
            .records
            .write()
            .expect("cache-hit records lock poisoned")
            .remove(cache_key);
    }

    /// Drops every affinity entry that pins work to the given key.
    async fn clear_records_for_key(&self, key_id: i64) {
        let doomed: Vec<String> = {
            let records = self.inner.records.read().expect("cache-hit records lock poisoned");
            records
                .iter()
                .filter(|(_, record)| record.key_id == key_id)
                .map(|(cache_key, _)| cache_key.clone())
                .collect()
        };
        if doomed.is_empty() {
            return;
        }
        for cache_key in &doomed {
            let _ = self.inner.store.delete(cache_key).await;
            self.remove_record(cache_key);
        }
        debug!(key_id, count = doomed.len(), "cleared cache-hit records for key");
    }

    /// A superseded hash stays routable for five more minutes, then its weight
    /// cost is refunded.
    fn schedule_hash_deletion(&self, group_id: i64, hash: String, key_id: i64) {
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(HASH_DELETION_DELAY).await;
            let cache_key = cache_hit_key(group_id, &hash);
            if pool.inner.store.delete(&cache_key).await.is_ok() {
                pool.adjust_weight_async(key_id, 1);
                debug!(group_id, key_id, "deleted superseded prompt hash, restored weight");
            }
            pool.remove_record(&cache_key);
        });
    }

    // --- Maintenance tickers ---

    /// Starts the expiry sweeper (1 min) and the weight sync (5 min). Not
    /// started on slave instances.
    pub fn start_maintenance(&self) {
        let cleanup_pool = self.clone();
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cleanup_pool.cleanup_expired_entries().await;
            }
        });

        let sync_pool = self.clone();
        let sync = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WEIGHT_SYNC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sync_pool.sync_weights_to_db().await;
            }
        });

        let mut handles = self.inner.maintenance.lock().expect("maintenance lock poisoned");
        handles.push(cleanup);
        handles.push(sync);
    }

    pub fn stop_maintenance(&self) {
        let mut handles = self.inner.maintenance.lock().expect("maintenance lock poisoned");
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    /// Sweeps expired affinity entries (the store may have TTL-evicted them
    /// already) and refunds their weight cost.
    pub async fn cleanup_expired_entries(&self) {
        let now = Utc::now().timestamp();
        let expired: Vec<CacheHitRecord> = {
            let records = self.inner.records.read().expect("cache-hit records lock poisoned");
            records
                .values()
                .filter(|record| record.exp_time <= now)
                .cloned()
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        for record in &expired {
            let cache_key = cache_hit_key(record.group_id, &record.hash);
            let _ = self.inner.store.delete(&cache_key).await;
            self.adjust_weight_async(record.key_id, 1);
            self.remove_record(&cache_key);
        }
        debug!(count = expired.len(), "cleaned up expired cache-hit entries");
    }

    /// Persists every store-side weight that drifted from the database value.
    pub async fn sync_weights_to_db(&self) {
        let rows = match self.inner.db.all_key_weights().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to fetch keys for weight sync");
                return;
            }
        };

        let mut updated = 0;
        for (key_id, db_weight) in rows {
            let Ok(details) = self.inner.store.hgetall(&key_hash_key(key_id)).await else {
                continue;
            };
            if details.is_empty() {
                continue;
            }
            let store_weight = details
                .get("weight")
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|w| *w > 0)
                .unwrap_or(DEFAULT_WEIGHT);
            if store_weight != db_weight {
                match self.inner.db.persist_key_weight(key_id, store_weight).await {
                    Ok(()) => updated += 1,
                    Err(e) => error!(key_id, error = %e, "failed to sync weight to database"),
                }
            }
        }
        if updated > 0 {
            debug!(count = updated, "weight sync persisted drifted keys");
        }
    }
}

fn validate_weight(weight: i64) -> Result<()> {
    if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
        return Err(AppError::validation(
            "weight",
            format!("weight must be between {MIN_WEIGHT} and {MAX_WEIGHT}, got {weight}"),
        ));
    }
    Ok(())
}

fn parse_weight_field(details: &HashMap<String, String>) -> i64 {
    details
        .get("weight")
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|w| *w > 0)
        .unwrap_or(DEFAULT_WEIGHT)
}

/// Field projection of a key for the `key:{id}` cache hash. `key_string`
/// stays ciphertext at rest.
fn api_key_to_fields(key: &ApiKey) -> Vec<(&'static str, String)> {
    let base_weight = if key.base_weight > 0 { key.base_weight } else { DEFAULT_WEIGHT };
    let weight = if key.weight > 0 { key.weight } else { base_weight };
    vec![
        ("id", key.id.to_string()),
        ("key_string", key.key_value.clone()),
        ("key_hash", key.key_hash.clone()),
        ("status", key.status.as_str().to_string()),
        ("base_weight", base_weight.to_string()),
        ("weight", weight.to_string()),
        ("failure_count", key.failure_count.to_string()),
        ("group_id", key.group_id.to_string()),
        ("created_at", key.created_at.timestamp().to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_clamping_respects_base_and_floor() {
        assert_eq!(clamp_weight(0, 500), 1);
        assert_eq!(clamp_weight(-5, 500), 1);
        assert_eq!(clamp_weight(501, 500), 500);
        assert_eq!(clamp_weight(250, 500), 250);
        assert_eq!(clamp_weight(2, 1), 1);
    }

    #[test]
    fn weight_validation_bounds() {
        assert!(validate_weight(0).is_err());
        assert!(validate_weight(1).is_ok());
        assert!(validate_weight(1000).is_ok());
        assert!(validate_weight(1001).is_err());
    }

    #[test]
    fn store_keys_are_stable() {
        assert_eq!(key_hash_key(42), "key:42");
        assert_eq!(active_list_key(7), "group:7:active_keys");
        assert_eq!(cache_hit_key(7, "abc"), "cache_hit:group:7:hash:abc");
    }

    #[test]
    fn missing_weight_field_defaults() {
        let mut details = HashMap::new();
        assert_eq!(parse_weight_field(&details), DEFAULT_WEIGHT);
        details.insert("weight".to_string(), "0".to_string());
        assert_eq!(parse_weight_field(&details), DEFAULT_WEIGHT);
        details.insert("weight".to_string(), "17".to_string());
        assert_eq!(parse_weight_field(&details), 17);
    }
}
