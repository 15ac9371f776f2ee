//! Persistence and publication for the adaptive throttling engine.
//!
//! The store holds the runtime configuration, the thresholds published to
//! the flow controller, and the adjustment audit log. Redis is the
//! production backend; the in-memory backend serves tests and single-node
//! setups without Redis.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
#[cfg(test)]
use mockall::automock;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::throttle_config::ThrottleConfig;
use crate::models::{Dimension, ThrottleAdjustmentLog};
use crate::utils::format_key;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Store operation timed out")]
    Timeout,
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Storage seam shared by the engine and the API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ThrottleStore: Send + Sync {
    async fn load_config(&self) -> Result<Option<ThrottleConfig>, StoreError>;

    async fn save_config(&self, config: &ThrottleConfig) -> Result<(), StoreError>;

    async fn delete_config(&self) -> Result<(), StoreError>;

    /// Threshold currently published for the flow controller
    async fn load_threshold(&self, dimension: Dimension) -> Result<Option<u64>, StoreError>;

    /// Publish `entry.new_threshold` and append `entry` to the log, atomically
    async fn commit_adjustment(&self, entry: &ThrottleAdjustmentLog) -> Result<(), StoreError>;

    /// Adjustment log, newest first
    async fn list_logs(&self) -> Result<Vec<ThrottleAdjustmentLog>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Redis-backed store
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    timeout: Duration,
    log_retention: usize,
}

impl RedisStore {
    pub fn new(
        client: redis::Client,
        prefix: &str,
        timeout: Duration,
        log_retention: usize,
    ) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            timeout,
            log_retention: log_retention.max(1),
        }
    }

    fn config_key(&self) -> String {
        format_key(&self.prefix, "config")
    }

    fn threshold_key(&self, dimension: Dimension) -> String {
        format_key(&self.prefix, &format!("threshold:{}", dimension))
    }

    fn logs_key(&self) -> String {
        format_key(&self.prefix, "adjustment_logs")
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        self.bounded(self.client.get_async_connection()).await
    }
}

#[async_trait]
impl ThrottleStore for RedisStore {
    async fn load_config(&self) -> Result<Option<ThrottleConfig>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = self.bounded(conn.get(self.config_key())).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_config(&self, config: &ThrottleConfig) -> Result<(), StoreError> {
        let json = serde_json::to_string(config)?;
        let mut conn = self.connection().await?;
        self.bounded(conn.set::<_, _, ()>(self.config_key(), json)).await
    }

    async fn delete_config(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.del::<_, ()>(self.config_key())).await
    }

    async fn load_threshold(&self, dimension: Dimension) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.get(self.threshold_key(dimension))).await
    }

    async fn commit_adjustment(&self, entry: &ThrottleAdjustmentLog) -> Result<(), StoreError> {
        let json = serde_json::to_string(entry)?;
        let logs_key = self.logs_key();
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.threshold_key(entry.dimension), entry.new_threshold)
            .ignore()
            .lpush(&logs_key, json)
            .ignore()
            .ltrim(&logs_key, 0, self.log_retention as isize - 1)
            .ignore();
        self.bounded(pipe.query_async::<_, ()>(&mut conn)).await
    }

    async fn list_logs(&self) -> Result<Vec<ThrottleAdjustmentLog>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Vec<String> = self.bounded(conn.lrange(self.logs_key(), 0, -1)).await?;
        Ok(raw
            .into_iter()
            .filter_map(|json| match serde_json::from_str(&json) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable adjustment log entry: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = self
            .bounded(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    config: Option<ThrottleConfig>,
    thresholds: HashMap<Dimension, u64>,
    logs: VecDeque<ThrottleAdjustmentLog>,
}

/// Process-local store
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    log_retention: usize,
}

impl MemoryStore {
    pub fn new(log_retention: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            log_retention: log_retention.max(1),
        }
    }
}

#[async_trait]
impl ThrottleStore for MemoryStore {
    async fn load_config(&self) -> Result<Option<ThrottleConfig>, StoreError> {
        Ok(self.state.read().await.config.clone())
    }

    async fn save_config(&self, config: &ThrottleConfig) -> Result<(), StoreError> {
        self.state.write().await.config = Some(config.clone());
        Ok(())
    }

    async fn delete_config(&self) -> Result<(), StoreError> {
        self.state.write().await.config = None;
        Ok(())
    }

    async fn load_threshold(&self, dimension: Dimension) -> Result<Option<u64>, StoreError> {
        Ok(self.state.read().await.thresholds.get(&dimension).copied())
    }

    async fn commit_adjustment(&self, entry: &ThrottleAdjustmentLog) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.thresholds.insert(entry.dimension, entry.new_threshold);
        state.logs.push_front(entry.clone());
        state.logs.truncate(self.log_retention);
        Ok(())
    }

    async fn list_logs(&self) -> Result<Vec<ThrottleAdjustmentLog>, StoreError> {
        Ok(self.state.read().await.logs.iter().cloned().collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdjustmentReason, TriggeredBy};
    use chrono::Utc;
    use tokio_test::assert_ok;

    fn entry(dimension: Dimension, new_threshold: u64) -> ThrottleAdjustmentLog {
        ThrottleAdjustmentLog {
            id: uuid::Uuid::new_v4().to_string(),
            dimension,
            old_threshold: 100,
            new_threshold,
            baseline_value: Some(40.0),
            live_value: Some(120),
            magnitude: Some(3.0),
            adjustment_ratio: new_threshold as f64 / 100.0,
            reason: AdjustmentReason::AnomalyDetected,
            triggered_by: TriggeredBy::Auto,
            triggered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_commit_publishes_and_logs() {
        let store = MemoryStore::new(10);
        assert_eq!(store.load_threshold(Dimension::Visit).await.unwrap(), None);

        assert_ok!(store.commit_adjustment(&entry(Dimension::Visit, 105)).await);
        assert_eq!(store.load_threshold(Dimension::Visit).await.unwrap(), Some(105));
        assert_eq!(store.load_threshold(Dimension::Attack).await.unwrap(), None);

        let logs = store.list_logs().await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].new_threshold, 105);
    }

    #[tokio::test]
    async fn test_memory_store_retention_keeps_newest() {
        let store = MemoryStore::new(3);
        for threshold in 101..=105 {
            store.commit_adjustment(&entry(Dimension::Attack, threshold)).await.unwrap();
        }
        let kept: Vec<u64> = store
            .list_logs()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.new_threshold)
            .collect();
        assert_eq!(kept, vec![105, 104, 103]);
    }

    #[tokio::test]
    async fn test_memory_store_config_lifecycle() {
        let store = MemoryStore::new(10);
        assert!(store.load_config().await.unwrap().is_none());

        let config = ThrottleConfig::default();
        store.save_config(&config).await.unwrap();
        assert_eq!(store.load_config().await.unwrap(), Some(config));

        store.delete_config().await.unwrap();
        assert!(store.load_config().await.unwrap().is_none());
    }
}
