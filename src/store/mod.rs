// src/store/mod.rs

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Hot-cache capability set shared by the key pool and the task harness.
///
/// Two implementations exist: an in-process sharded map and an external Redis
/// cache. Callers must observe identical semantics from both; TTLs are coarse
/// (seconds).
#[async_trait]
pub trait Store: Send + Sync {
    /// Single value lookup. Returns `AppError::StoreNotFound` for missing keys.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Sets string fields on a hash, creating it if absent.
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    /// Returns an empty map for a missing hash.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Increments an integer hash field, creating it at `delta` if absent.
    /// Returns the new value.
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// Pushes values onto the head of a list.
    async fn lpush(&self, key: &str, values: &[String]) -> Result<()>;

    /// Removes every occurrence of `value` from the list.
    async fn lrem(&self, key: &str, value: &str) -> Result<()>;

    /// Length of a list; 0 for a missing key.
    async fn llen(&self, key: &str) -> Result<i64>;

    /// Atomically pops the head of the list, appends it to the tail, and
    /// returns it. `AppError::StoreNotFound` when the list is empty or absent.
    async fn rotate(&self, key: &str) -> Result<String>;

    /// Bulk HSET used for the startup load. The default implementation applies
    /// the entries one by one; the Redis store overrides it with a pipeline.
    async fn hset_bulk(&self, entries: Vec<(String, Vec<(&'static str, String)>)>) -> Result<()> {
        for (key, fields) in entries {
            self.hset(&key, &fields).await?;
        }
        Ok(())
    }
}
