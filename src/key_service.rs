// src/key_service.rs

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::crypto::EncryptionService;
use crate::db::{Database, NewKey};
use crate::error::{AppError, Result};
use crate::keypool::validator::KeyValidator;
use crate::keypool::{KeyPool, DEFAULT_WEIGHT, MAX_WEIGHT, MIN_WEIGHT};
use crate::models::{Group, KeyStatus, KeyTestResult};

/// Upper bound on one batch request.
pub const MAX_REQUEST_KEYS: usize = 5000;
/// Keys per database chunk on bulk operations.
pub const CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct KeyWithWeight {
    pub key: String,
    pub weight: i64,
}

#[derive(Debug, Serialize)]
pub struct AddKeysResult {
    pub added_count: usize,
    pub ignored_count: usize,
    pub total_in_group: i64,
}

#[derive(Debug, Serialize)]
pub struct DeleteKeysResult {
    pub deleted_count: u64,
    pub ignored_count: usize,
    pub total_in_group: i64,
}

#[derive(Debug, Serialize)]
pub struct RestoreKeysResult {
    pub restored_count: u64,
    pub ignored_count: usize,
    pub total_in_group: i64,
}

#[derive(Debug, Serialize)]
pub struct UpdateWeightResult {
    pub updated_count: u64,
    pub ignored_count: usize,
    pub total_in_group: i64,
}

/// Business logic over key batches: text parsing, dedup, chunked pool calls,
/// export and one-off testing.
#[derive(Clone)]
pub struct KeyService {
    db: Database,
    pool: KeyPool,
    validator: KeyValidator,
    crypto: Arc<EncryptionService>,
}

impl KeyService {
    pub fn new(
        db: Database,
        pool: KeyPool,
        validator: KeyValidator,
        crypto: Arc<EncryptionService>,
    ) -> Self {
        Self {
            db,
            pool,
            validator,
            crypto,
        }
    }

    pub fn parse_keys_with_weight(&self, text: &str) -> Vec<KeyWithWeight> {
        parse_keys_with_weight(text)
    }

    pub fn parse_keys(&self, text: &str) -> Vec<String> {
        parse_keys_with_weight(text)
            .into_iter()
            .map(|kw| kw.key)
            .collect()
    }

    /// Creates new keys from a text block: pre-filters empties and
    /// duplicates, skips hashes already in the group, encrypts, inserts in
    /// chunks of 500, and mirrors into the cache.
    pub async fn add_multiple_keys(
        &self,
        group_id: i64,
        keys_text: &str,
        progress: Option<&(dyn Fn(usize) + Send + Sync)>,
    ) -> Result<AddKeysResult> {
        let parsed = self.parse_keys_with_weight(keys_text);
        check_batch(parsed.len())?;

        let existing: std::collections::HashSet<String> =
            self.db.existing_hashes(group_id).await?.into_iter().collect();

        let mut unique = std::collections::HashSet::new();
        let mut to_create: Vec<NewKey> = Vec::new();
        for kw in &parsed {
            let trimmed = kw.key.trim();
            if trimmed.is_empty() || !unique.insert(trimmed.to_string()) {
                continue;
            }
            let key_hash = self.crypto.hash(trimmed);
            if existing.contains(&key_hash) {
                continue;
            }
            let encrypted = match self.crypto.encrypt(trimmed) {
                Ok(ct) => ct,
                Err(e) => {
                    warn!(error = %e, "failed to encrypt key, skipping");
                    continue;
                }
            };
            to_create.push(NewKey {
                group_id,
                key_value: encrypted,
                key_hash,
                weight: kw.weight.clamp(MIN_WEIGHT, MAX_WEIGHT),
            });
        }

        let mut added = 0;
        for chunk in to_create.chunks(CHUNK_SIZE) {
            let chunk: Vec<NewKey> = chunk
                .iter()
                .map(|k| NewKey {
                    group_id: k.group_id,
                    key_value: k.key_value.clone(),
                    key_hash: k.key_hash.clone(),
                    weight: k.weight,
                })
                .collect();
            let created = self.pool.add_keys(group_id, chunk).await?;
            added += created.len();
            if let Some(callback) = progress {
                callback(added);
            }
        }

        debug!(group_id, added, ignored = parsed.len() - added, "key import finished");
        Ok(AddKeysResult {
            added_count: added,
            ignored_count: parsed.len() - added,
            total_in_group: self.db.count_keys(group_id).await?,
        })
    }

    pub async fn delete_multiple_keys(
        &self,
        group_id: i64,
        keys_text: &str,
        progress: Option<&(dyn Fn(usize) + Send + Sync)>,
    ) -> Result<DeleteKeysResult> {
        let keys = self.parse_keys(keys_text);
        check_batch(keys.len())?;

        let mut deleted = 0;
        let mut processed = 0;
        for chunk in keys.chunks(CHUNK_SIZE) {
            deleted += self.pool.remove_keys(group_id, chunk).await?;
            processed += chunk.len();
            if let Some(callback) = progress {
                callback(processed);
            }
        }

        Ok(DeleteKeysResult {
            deleted_count: deleted,
            ignored_count: keys.len().saturating_sub(deleted as usize),
            total_in_group: self.db.count_keys(group_id).await?,
        })
    }

    pub async fn restore_multiple_keys(&self, group_id: i64, keys_text: &str) -> Result<RestoreKeysResult> {
        let keys = self.parse_keys(keys_text);
        check_batch(keys.len())?;

        let mut restored = 0;
        for chunk in keys.chunks(CHUNK_SIZE) {
            restored += self.pool.restore_specific(group_id, chunk).await?;
        }

        Ok(RestoreKeysResult {
            restored_count: restored,
            ignored_count: keys.len().saturating_sub(restored as usize),
            total_in_group: self.db.count_keys(group_id).await?,
        })
    }

    pub async fn restore_all_invalid(&self, group_id: i64) -> Result<u64> {
        self.pool.restore_keys(group_id).await
    }

    pub async fn clear_invalid(&self, group_id: i64) -> Result<u64> {
        self.pool.remove_invalid(group_id).await
    }

    pub async fn clear_all(&self, group_id: i64) -> Result<u64> {
        self.pool.remove_all(group_id).await
    }

    pub async fn update_keys_weight(
        &self,
        group_id: i64,
        keys_text: &str,
        weight: i64,
    ) -> Result<UpdateWeightResult> {
        if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
            return Err(AppError::validation(
                "weight",
                format!("weight must be between {MIN_WEIGHT} and {MAX_WEIGHT}"),
            ));
        }
        let keys = self.parse_keys(keys_text);
        check_batch(keys.len())?;

        let hashes: Vec<String> = keys.iter().map(|k| self.crypto.hash(k.trim())).collect();
        let mut updated = 0;
        for chunk in hashes.chunks(CHUNK_SIZE) {
            updated += self.pool.update_weights(group_id, chunk, weight).await?;
        }

        Ok(UpdateWeightResult {
            updated_count: updated,
            ignored_count: keys.len().saturating_sub(updated as usize),
            total_in_group: self.db.count_keys(group_id).await?,
        })
    }

    pub async fn reset_keys_weight(&self, group_id: i64) -> Result<u64> {
        self.pool.reset_weights(group_id).await
    }

    pub async fn clear_stats(&self, group_id: i64) -> Result<u64> {
        self.db.clear_key_stats(group_id).await
    }

    /// Decrypted keys of a group, one per line, filtered by status
    /// (`active`, `invalid` or `all`).
    pub async fn export_keys(&self, group_id: i64, status_filter: &str) -> Result<String> {
        let status = match status_filter {
            "active" => Some(KeyStatus::Active),
            "invalid" => Some(KeyStatus::Invalid),
            "all" => None,
            other => {
                return Err(AppError::validation(
                    "status",
                    format!("invalid status filter '{other}'"),
                ))
            }
        };

        let keys = self.db.keys_by_group(group_id, status).await?;
        let mut out = String::new();
        for key in &keys {
            match self.crypto.decrypt(&key.key_value) {
                Ok(plaintext) => {
                    out.push_str(&plaintext);
                    out.push('\n');
                }
                Err(e) => warn!(key_id = key.id, error = %e, "failed to decrypt key for export, skipping"),
            }
        }
        Ok(out)
    }

    /// One-off validation of a key batch against the group's channel.
    pub async fn test_multiple_keys(&self, group: &Group, keys_text: &str) -> Result<Vec<KeyTestResult>> {
        let keys = self.parse_keys(keys_text);
        check_batch(keys.len())?;

        let mut results = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(CHUNK_SIZE) {
            results.extend(self.validator.test_keys(group, chunk).await?);
        }
        Ok(results)
    }
}

fn check_batch(len: usize) -> Result<()> {
    if len > MAX_REQUEST_KEYS {
        return Err(AppError::validation(
            "keys_text",
            format!("batch size exceeds the limit of {MAX_REQUEST_KEYS} keys, got {len}"),
        ));
    }
    if len == 0 {
        return Err(AppError::validation(
            "keys_text",
            "no valid keys found in the input text",
        ));
    }
    Ok(())
}

/// Parses a key batch from text. Accepts a JSON array of strings or
/// delimiter-separated text; each key may carry a `:weight` suffix
/// (e.g. `sk-xxx:10`), defaulting to weight 500.
pub fn parse_keys_with_weight(text: &str) -> Vec<KeyWithWeight> {
    if let Ok(keys) = serde_json::from_str::<Vec<String>>(text) {
        if !keys.is_empty() {
            return keys.iter().filter_map(|k| parse_key_with_weight(k)).collect();
        }
    }

    text.split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter_map(parse_key_with_weight)
        .collect()
}

/// Parses one key token with an optional `:weight` suffix. The key itself may
/// contain colons; only the last segment is considered a weight, and only when
/// it parses into the valid range.
fn parse_key_with_weight(input: &str) -> Option<KeyWithWeight> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Some(idx) = input.rfind(':') {
        if idx > 0 && idx < input.len() - 1 {
            if let Ok(weight) = input[idx + 1..].parse::<i64>() {
                if (MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
                    let key = input[..idx].trim();
                    if !key.is_empty() {
                        return Some(KeyWithWeight {
                            key: key.to_string(),
                            weight,
                        });
                    }
                }
            }
        }
    }

    Some(KeyWithWeight {
        key: input.to_string(),
        weight: DEFAULT_WEIGHT,
    })
}
