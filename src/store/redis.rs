//! Redis-backed queue store for clustered deployments
//!
//! Every node in a cluster shares one Redis instance; the list and hash
//! commands used here are individually atomic, which is the coordination
//! guarantee the queue protocol is built on.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::AsyncCommands;
use std::collections::HashMap;

use super::{QueueStore, StoreError, StoreResult};
use crate::config::RedisConfig;

/// Redis [`QueueStore`] implementation
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Create a store and verify the connection with a PING
    pub async fn new(config: &RedisConfig) -> StoreResult<Self> {
        let pool_config = PoolConfig::from_url(&config.url);
        let pool = pool_config
            .builder()
            .map_err(|e| StoreError::Pool(format!("failed to create pool builder: {e}")))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Pool(format!("failed to create pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable {
                reason: e.to_string(),
            })?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

        tracing::info!(url = %config.url, "connected to Redis queue store");

        Ok(Self { pool })
    }

    async fn conn(&self) -> StoreResult<Connection> {
        self.pool.get().await.map_err(|e| StoreError::Unavailable {
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.lpop(key, None).await?;
        Ok(value)
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.lrem(key, 0, value).await?;
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let values: Vec<String> = conn.lrange(key, start as isize, stop as isize).await?;
        Ok(values)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }
}
