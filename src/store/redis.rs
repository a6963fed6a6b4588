// src/store/redis.rs

use crate::error::{AppError, Result};
use crate::store::Store;
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// Redis-backed store implementation. Selected when `REDIS_DSN` is set, which
/// also enables multiple proxy instances to share one pool projection.
pub struct RedisStore {
    pool: Pool,
    key_prefix: String,
}

impl RedisStore {
    pub fn connect(dsn: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let pool = Config::from_url(dsn)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| AppError::Store {
                message: format!("failed to create Redis pool: {e}"),
            })?;
        info!("Redis connection pool created");
        Ok(Self {
            pool,
            key_prefix: key_prefix.into(),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(Into::into)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.get(self.prefixed(key)).await?;
        value.ok_or(AppError::StoreNotFound)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let key = self.prefixed(key);
        match ttl {
            Some(ttl) if ttl.as_secs() > 0 => {
                let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
            }
            _ => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(self.prefixed(key)).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset_multiple(self.prefixed(key), fields).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(self.prefixed(key)).await?;
        Ok(map)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        let value: i64 = conn.hincr(self.prefixed(key), field, delta).await?;
        Ok(value)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: () = conn.lpush(self.prefixed(key), values).await?;
        Ok(())
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.lrem(self.prefixed(key), 0, value).await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        let len: i64 = conn.llen(self.prefixed(key)).await?;
        Ok(len)
    }

    async fn rotate(&self, key: &str) -> Result<String> {
        let mut conn = self.conn().await?;
        let key = self.prefixed(key);
        // LMOVE src src LEFT RIGHT pops the head and appends it to the tail
        // in one atomic server-side step.
        let value: Option<String> = conn
            .lmove(&key, &key, redis::Direction::Left, redis::Direction::Right)
            .await?;
        value.ok_or(AppError::StoreNotFound)
    }

    async fn hset_bulk(&self, entries: Vec<(String, Vec<(&'static str, String)>)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for (key, fields) in &entries {
            pipe.hset_multiple(self.prefixed(key), fields).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
