// src/store/memory.rs

use crate::error::{AppError, Result};
use crate::store::Store;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 16;

#[derive(Debug)]
enum Entry {
    Value { data: Vec<u8>, expires_at: Option<Instant> },
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

/// In-process store implementation: one mutex-guarded map per shard, keys
/// assigned to shards by hash. Used when no `REDIS_DSN` is configured.
pub struct MemoryStore {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    fn is_expired(entry: &Entry) -> bool {
        matches!(entry, Entry::Value { expires_at: Some(at), .. } if *at <= Instant::now())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut guard = self.shard(key).lock().expect("store shard poisoned");
        match guard.get(key) {
            Some(entry) if Self::is_expired(entry) => {
                guard.remove(key);
                Err(AppError::StoreNotFound)
            }
            Some(Entry::Value { data, .. }) => Ok(data.clone()),
            Some(_) => Err(AppError::Store {
                message: format!("key '{key}' holds a non-value type"),
            }),
            None => Err(AppError::StoreNotFound),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut guard = self.shard(key).lock().expect("store shard poisoned");
        guard.insert(
            key.to_string(),
            Entry::Value {
                data: value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.shard(key).lock().expect("store shard poisoned");
        guard.remove(key);
        Ok(())
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut guard = self.shard(key).lock().expect("store shard poisoned");
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry {
            Entry::Hash(map) => {
                for (field, value) in fields {
                    map.insert((*field).to_string(), value.clone());
                }
                Ok(())
            }
            _ => Err(AppError::Store {
                message: format!("key '{key}' holds a non-hash type"),
            }),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let guard = self.shard(key).lock().expect("store shard poisoned");
        match guard.get(key) {
            Some(Entry::Hash(map)) => Ok(map.clone()),
            Some(_) => Err(AppError::Store {
                message: format!("key '{key}' holds a non-hash type"),
            }),
            None => Ok(HashMap::new()),
        }
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut guard = self.shard(key).lock().expect("store shard poisoned");
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry {
            Entry::Hash(map) => {
                let current: i64 = map.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
                let next = current + delta;
                map.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            _ => Err(AppError::Store {
                message: format!("key '{key}' holds a non-hash type"),
            }),
        }
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<()> {
        let mut guard = self.shard(key).lock().expect("store shard poisoned");
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()));
        match entry {
            Entry::List(list) => {
                for value in values {
                    list.push_front(value.clone());
                }
                Ok(())
            }
            _ => Err(AppError::Store {
                message: format!("key '{key}' holds a non-list type"),
            }),
        }
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<()> {
        let mut guard = self.shard(key).lock().expect("store shard poisoned");
        if let Some(Entry::List(list)) = guard.get_mut(key) {
            list.retain(|v| v != value);
        }
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let guard = self.shard(key).lock().expect("store shard poisoned");
        match guard.get(key) {
            Some(Entry::List(list)) => Ok(list.len() as i64),
            Some(_) => Err(AppError::Store {
                message: format!("key '{key}' holds a non-list type"),
            }),
            None => Ok(0),
        }
    }

    async fn rotate(&self, key: &str) -> Result<String> {
        let mut guard = self.shard(key).lock().expect("store shard poisoned");
        match guard.get_mut(key) {
            Some(Entry::List(list)) => match list.pop_front() {
                Some(value) => {
                    list.push_back(value.clone());
                    Ok(value)
                }
                None => Err(AppError::StoreNotFound),
            },
            Some(_) => Err(AppError::Store {
                message: format!("key '{key}' holds a non-list type"),
            }),
            None => Err(AppError::StoreNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_delete_round_trip() {
        let store = MemoryStore::new();
        assert!(matches!(store.get("k").await, Err(AppError::StoreNotFound)));

        store.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"v");

        store.delete("k").await.unwrap();
        assert!(matches!(store.get("k").await, Err(AppError::StoreNotFound)));
        // Deleting again is not an error.
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn ttl_expires_values() {
        let store = MemoryStore::new();
        store
            .set("k", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get("k").await.is_ok());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(store.get("k").await, Err(AppError::StoreNotFound)));
    }

    #[tokio::test]
    async fn hash_operations() {
        let store = MemoryStore::new();
        assert!(store.hgetall("h").await.unwrap().is_empty());

        store
            .hset("h", &[("status", "active".into()), ("weight", "500".into())])
            .await
            .unwrap();
        let map = store.hgetall("h").await.unwrap();
        assert_eq!(map.get("status").unwrap(), "active");
        assert_eq!(map.get("weight").unwrap(), "500");

        assert_eq!(store.hincrby("h", "failure_count", 1).await.unwrap(), 1);
        assert_eq!(store.hincrby("h", "failure_count", 2).await.unwrap(), 3);
        assert_eq!(store.hincrby("h", "failure_count", -3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rotate_cycles_head_to_tail() {
        let store = MemoryStore::new();
        assert!(matches!(store.rotate("l").await, Err(AppError::StoreNotFound)));

        // lpush pushes to the head, so pushing 1,2,3 yields [3,2,1].
        store
            .lpush("l", &["1".into(), "2".into(), "3".into()])
            .await
            .unwrap();
        assert_eq!(store.llen("l").await.unwrap(), 3);

        assert_eq!(store.rotate("l").await.unwrap(), "3");
        assert_eq!(store.rotate("l").await.unwrap(), "2");
        assert_eq!(store.rotate("l").await.unwrap(), "1");
        assert_eq!(store.rotate("l").await.unwrap(), "3");
        assert_eq!(store.llen("l").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn lrem_removes_all_occurrences() {
        let store = MemoryStore::new();
        store
            .lpush("l", &["a".into(), "b".into(), "a".into()])
            .await
            .unwrap();
        store.lrem("l", "a").await.unwrap();
        assert_eq!(store.llen("l").await.unwrap(), 1);
        assert_eq!(store.rotate("l").await.unwrap(), "b");
        // lrem on a missing key is a no-op.
        store.lrem("missing", "x").await.unwrap();
    }

    #[tokio::test]
    async fn type_mismatch_is_an_error() {
        let store = MemoryStore::new();
        store.hset("h", &[("f", "v".into())]).await.unwrap();
        assert!(store.rotate("h").await.is_err());
        assert!(store.get("h").await.is_err());
    }
}
