//! Pluggable backing stores for the blackboard.
//!
//! The blackboard itself only speaks JSON documents with TTLs; production
//! deployments back it with redis, tests and store-less deployments use the
//! in-memory implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(String),

    #[error("store returned malformed JSON: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set_json_with_ttl(
        &self,
        key: &str,
        value: &Value,
        ttl: Duration,
    ) -> Result<(), StoreError>;
}

/// In-memory store with TTL expiry on read.
#[derive(Default)]
pub struct MemoryBackingStore {
    entries: DashMap<String, (Value, Option<Instant>)>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StoreError> {
        if let Some(entry) = self.entries.get(key) {
            let (value, deadline) = entry.value();
            if deadline.map(|d| Instant::now() < d).unwrap_or(true) {
                return Ok(Some(value.clone()));
            }
        }
        // Expired entries are dropped lazily.
        self.entries
            .remove_if(key, |_, (_, deadline)| {
                deadline.map(|d| Instant::now() >= d).unwrap_or(false)
            });
        Ok(None)
    }

    async fn set_json_with_ttl(
        &self,
        key: &str,
        value: &Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            (value.clone(), Instant::now().checked_add(ttl)),
        );
        Ok(())
    }
}

/// Redis-backed store using a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisBackingStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisBackingStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Io(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl BackingStore for RedisBackingStore {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        match raw {
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| StoreError::Malformed(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set_json_with_ttl(
        &self,
        key: &str,
        value: &Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let raw = value.to_string();
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, raw, secs)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryBackingStore::new();
        store
            .set_json_with_ttl("k", &json!({"a": 1}), Duration::from_secs(60))
            .await
            .unwrap();
        let got = store.get_json("k").await.unwrap().unwrap();
        assert_eq!(got["a"], 1);
        assert!(store.get_json("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_expires() {
        let store = MemoryBackingStore::new();
        store
            .set_json_with_ttl("k", &json!(1), Duration::from_millis(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get_json("k").await.unwrap().is_none());
    }
}
