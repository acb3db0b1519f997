//! In-memory queue store for non-clustered mode and tests
//!
//! Implements the same operation set as the Redis store over process-local
//! maps. One `Mutex` per structure kind keeps each operation atomic relative
//! to the others, which is all the queue protocol requires.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use super::{QueueStore, StoreResult};

/// Process-local [`QueueStore`] implementation
#[derive(Debug, Default)]
pub struct MemoryStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut lists = self.lists.lock().await;
        lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut lists = self.lists.lock().await;
        Ok(lists.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut lists = self.lists.lock().await;
        match lists.get_mut(key) {
            Some(list) => {
                let before = list.len();
                list.retain(|v| v != value);
                Ok((before - list.len()) as u64)
            }
            None => Ok(0),
        }
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let lists = self.lists.lock().await;
        Ok(lists.get(key).map(VecDeque::len).unwrap_or(0) as u64)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let lists = self.lists.lock().await;
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let clamp = |i: i64| -> i64 {
            let i = if i < 0 { len + i } else { i };
            i.clamp(0, len)
        };
        let start = clamp(start);
        let stop = clamp(stop);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut hashes = self.hashes.lock().await;
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let hashes = self.hashes.lock().await;
        Ok(hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let hashes = self.hashes.lock().await;
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut hashes = self.hashes.lock().await;
        Ok(hashes
            .get_mut(key)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_fifo_order() {
        let store = MemoryStore::new();
        store.rpush("q", "a").await.unwrap();
        store.rpush("q", "b").await.unwrap();

        assert_eq!(store.llen("q").await.unwrap(), 2);
        assert_eq!(store.lpop("q").await.unwrap(), Some("a".to_string()));
        assert_eq!(store.lpop("q").await.unwrap(), Some("b".to_string()));
        assert_eq!(store.lpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lrem_removes_all_occurrences() {
        let store = MemoryStore::new();
        store.rpush("q", "x").await.unwrap();
        store.rpush("q", "y").await.unwrap();
        store.rpush("q", "x").await.unwrap();

        assert_eq!(store.lrem("q", "x").await.unwrap(), 2);
        assert_eq!(store.llen("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lrange_negative_indices() {
        let store = MemoryStore::new();
        for v in ["a", "b", "c", "d"] {
            store.rpush("q", v).await.unwrap();
        }
        assert_eq!(store.lrange("q", 0, -1).await.unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(store.lrange("q", 1, 2).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.lrange("q", -2, -1).await.unwrap(), vec!["c", "d"]);
        assert!(store.lrange("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = MemoryStore::new();
        store.hset("h", "f", "v").await.unwrap();

        assert_eq!(store.hget("h", "f").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.hgetall("h").await.unwrap().len(), 1);
        assert!(store.hdel("h", "f").await.unwrap());
        assert!(!store.hdel("h", "f").await.unwrap());
    }
}
