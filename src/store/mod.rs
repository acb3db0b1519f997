//! The queue/lock store boundary
//!
//! Every cross-node coordination primitive in the task system is expressed
//! through this trait: atomic list pop/push plus hash get/set, keyed under a
//! cluster-wide namespace. The [`redis`] implementation backs clustered
//! deployments; the [`memory`] implementation satisfies non-clustered mode
//! and tests with the same operation set.
//!
//! Store errors always propagate — there is no silent degradation to a local
//! fallback during normal operation.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Errors raised by queue store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached
    #[error("queue store unavailable: {reason}")]
    Unavailable { reason: String },

    /// Connection pool failure
    #[error("pool error: {0}")]
    Pool(String),

    /// Underlying Redis command failure
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl StoreError {
    /// Store errors are transient by nature; callers may retry
    pub fn is_recoverable(&self) -> bool {
        true
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Atomic list and hash operations required by the queue coordinator
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a value to the tail of a list
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Pop the head of a list
    async fn lpop(&self, key: &str) -> StoreResult<Option<String>>;

    /// Remove every occurrence of a value from a list; returns removed count
    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64>;

    /// Length of a list
    async fn llen(&self, key: &str) -> StoreResult<u64>;

    /// Inclusive range of a list; negative indices count from the tail
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    /// Set a hash field
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Read a hash field
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Read a whole hash
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Delete a hash field; returns whether it existed
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;
}
