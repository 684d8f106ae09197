use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use topic_bus::{retry_connect, RetryExhausted, RetryPolicy};
use tracing::{info, warn};

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub name: String,
    pub data: String,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn now(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("encode entry: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Unavailable(#[from] RetryExhausted),
}

/// Append-only log storage. `recent` returns entries oldest first.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, entry: LogEntry) -> Result<(), StoreError>;
    async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError>;
}

pub type StoreHandle = Arc<dyn LogStore>;

/// Bounded ring of entries; the oldest entry is evicted once `capacity` is reached.
pub struct InMemoryLogStore {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl InMemoryLogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, entry: LogEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.iter().skip(skip).cloned().collect())
    }
}

/// Entries kept as JSON strings in one Redis list, trimmed to `max_len`.
pub struct RedisLogStore {
    conn: ConnectionManager,
    key: String,
    max_len: isize,
}

impl RedisLogStore {
    /// Dials Redis under `policy`. Exhausting the policy is returned as
    /// [`StoreError::Unavailable`].
    pub async fn connect(
        url: &str,
        key: impl Into<String>,
        max_len: usize,
        policy: &RetryPolicy,
    ) -> Result<Self, StoreError> {
        let conn = retry_connect("redis", policy, || async {
            let client = redis::Client::open(url)?;
            client.get_connection_manager().await
        })
        .await?;
        let key = key.into();
        info!(key = %key, max_len, "redis log store ready");
        Ok(Self {
            conn,
            key,
            max_len: isize::try_from(max_len.max(1)).unwrap_or(isize::MAX),
        })
    }
}

#[async_trait]
impl LogStore for RedisLogStore {
    async fn append(&self, entry: LogEntry) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&entry)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .rpush(&self.key, payload)
            .ignore()
            .ltrim(&self.key, -self.max_len, -1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = -isize::try_from(limit).unwrap_or(isize::MAX);
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.key)
            .arg(start)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        let mut out = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<LogEntry>(&item) {
                Ok(entry) => out.push(entry),
                Err(err) => warn!(key = %self.key, error = %err, "skipping malformed log entry"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn memory_store_evicts_oldest() {
        let store = InMemoryLogStore::new(2);
        for data in ["a", "b", "c"] {
            store.append(LogEntry::now("log", data)).await.unwrap();
        }
        let recent = store.recent(10).await.unwrap();
        let data: Vec<&str> = recent.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn memory_store_limits_to_newest() {
        let store = InMemoryLogStore::default();
        for data in ["a", "b", "c"] {
            store.append(LogEntry::now("log", data)).await.unwrap();
        }
        let recent = store.recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].data, "c");
        assert!(store.recent(0).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_redis_gives_up_after_policy() {
        let policy = RetryPolicy::Bounded {
            attempts: 2,
            interval: Duration::from_millis(10),
        };
        let err = RedisLogStore::connect("not a redis url", "logs", 10, &policy)
            .await
            .err()
            .expect("connect should fail");
        match err {
            StoreError::Unavailable(exhausted) => {
                assert_eq!(exhausted.dependency, "redis");
                assert_eq!(exhausted.attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn redis_store_roundtrip() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let key = format!("logger-service:test:{}", Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let store = RedisLogStore::connect(&url, &key, 2, &RetryPolicy::store())
            .await
            .expect("redis");
        for data in ["a", "b", "c"] {
            store.append(LogEntry::now("log", data)).await.unwrap();
        }
        let recent = store.recent(10).await.unwrap();
        let data: Vec<&str> = recent.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["b", "c"]);
    }
}
