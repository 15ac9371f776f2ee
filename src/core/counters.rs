//! Live counter sources.
//!
//! The flow controller owns the per-window visit, attack and error
//! counters. The sampler reads them through [`CounterSource`], either
//! straight from Redis or from the flow controller's HTTP endpoint.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use redis::AsyncCommands;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::models::Dimension;
use crate::utils::format_key;

/// Errors that can occur while reading live counters
#[derive(Error, Debug)]
pub enum CounterError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("API request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Counter read timed out")]
    Timeout,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Source of the current per-window counter for a dimension
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CounterSource: Send + Sync {
    async fn read(&self, dimension: Dimension) -> Result<u64, CounterError>;
}

/// Reads `{prefix}:{dimension}` keys maintained by the flow controller
pub struct RedisCounterSource {
    client: redis::Client,
    prefix: String,
    timeout: Duration,
}

impl RedisCounterSource {
    pub fn new(client: redis::Client, prefix: &str, timeout: Duration) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            timeout,
        }
    }

    async fn fetch(&self, key: String) -> Result<u64, CounterError> {
        let mut conn = self.client.get_async_connection().await?;
        let count: Option<u64> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }
}

#[async_trait]
impl CounterSource for RedisCounterSource {
    async fn read(&self, dimension: Dimension) -> Result<u64, CounterError> {
        let key = format_key(&self.prefix, dimension.as_str());
        match tokio::time::timeout(self.timeout, self.fetch(key)).await {
            Ok(result) => result,
            Err(_) => Err(CounterError::Timeout),
        }
    }
}

/// Counters endpoint response
#[derive(Debug, Deserialize)]
struct CountersResponse {
    visit: Option<u64>,
    attack: Option<u64>,
    error: Option<u64>,
}

/// Polls the flow controller's counters endpoint
pub struct HttpCounterSource {
    client: Client,
    url: String,
}

impl HttpCounterSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, CounterError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl CounterSource for HttpCounterSource {
    async fn read(&self, dimension: Dimension) -> Result<u64, CounterError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?;
        let counters: CountersResponse = response.json().await?;
        let value = match dimension {
            Dimension::Visit => counters.visit,
            Dimension::Attack => counters.attack,
            Dimension::Error => counters.error,
        };
        value.ok_or_else(|| {
            CounterError::InvalidResponse(format!("missing \"{}\" counter", dimension))
        })
    }
}
