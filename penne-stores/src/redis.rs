// Copyright 2025 Penne Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Redis-backed checkpoint store.
//!
//! The token is stored as BSON bytes under one key per slot:
//!
//! ```text
//! penne:checkpoint:{slot}
//! ```
//!
//! Each persist is a single `SET`, so readers see either the old token or
//! the new one. Connections come from a `deadpool-redis` pool and transient
//! errors are retried with exponential backoff.
//!
//! # Example
//!
//! ```rust,no_run
//! use penne_stores::redis::{RedisCheckpointStore, RedisConfig};
//! use penne_core::checkpoint::{CheckpointStore, CheckpointToken};
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::builder()
//!     .url("redis://localhost:6379")
//!     .slot("cloth_store.shirts")
//!     .build()?;
//!
//! let store = RedisCheckpointStore::new(config).await?;
//! store.persist(&CheckpointToken::resume_token(doc! { "_data": "8264A1" })).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use penne_core::checkpoint::{CheckpointError, CheckpointStore, CheckpointToken};
use redis::{AsyncCommands, RedisError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Key prefix for all Penne checkpoints in Redis.
const KEY_PREFIX: &str = "penne:checkpoint";

/// Maximum number of retry attempts for transient Redis errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const BASE_RETRY_DELAY_MS: u64 = 100;

/// Configuration for [`RedisCheckpointStore`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Slot name; one pipeline per slot
    pub slot: String,

    /// Connection pool size (default: 4)
    pub pool_size: usize,

    /// Optional expiry for the stored token
    pub ttl: Option<Duration>,

    /// Connection timeout (default: 5 seconds)
    pub connection_timeout: Duration,

    /// Maximum number of retries for transient errors (default: 3)
    pub max_retries: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            slot: "default".to_string(),
            pool_size: 4,
            ttl: None,
            connection_timeout: Duration::from_secs(5),
            max_retries: MAX_RETRIES,
        }
    }
}

impl RedisConfig {
    /// Creates a new builder for `RedisConfig`.
    #[must_use]
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::default()
    }
}

/// Builder for [`RedisConfig`] with validation.
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    url: Option<String>,
    slot: Option<String>,
    pool_size: Option<usize>,
    ttl: Option<Duration>,
    connection_timeout: Option<Duration>,
    max_retries: Option<u32>,
}

impl RedisConfigBuilder {
    /// Sets the Redis connection URL.
    ///
    /// - Standalone: `redis://localhost:6379`
    /// - With auth: `redis://:password@localhost:6379`
    /// - TLS: `rediss://localhost:6380`
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the slot name. Default: `default`.
    #[must_use]
    pub fn slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    /// Sets the connection pool size.
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Sets an expiry for the stored token.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of retries for transient errors.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Builds the `RedisConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is missing, the slot is empty, or the pool
    /// size is 0.
    pub fn build(self) -> Result<RedisConfig, CheckpointError> {
        let defaults = RedisConfig::default();
        let url = self
            .url
            .ok_or_else(|| CheckpointError::Other("Redis URL is required".to_string()))?;

        let slot = self.slot.unwrap_or(defaults.slot);
        if slot.is_empty() {
            return Err(CheckpointError::Other("Slot name must not be empty".to_string()));
        }

        let pool_size = self.pool_size.unwrap_or(defaults.pool_size);
        if pool_size == 0 {
            return Err(CheckpointError::Other(
                "Pool size must be greater than 0".to_string(),
            ));
        }

        Ok(RedisConfig {
            url,
            slot,
            pool_size,
            ttl: self.ttl,
            connection_timeout: self.connection_timeout.unwrap_or(defaults.connection_timeout),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
        })
    }
}

/// Checkpoint store keeping the token in Redis.
#[derive(Clone)]
pub struct RedisCheckpointStore {
    pool: Pool,
    config: RedisConfig,
    key: String,
}

impl std::fmt::Debug for RedisCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCheckpointStore")
            .field("key", &self.key)
            .field("pool_size", &self.config.pool_size)
            .finish_non_exhaustive()
    }
}

impl RedisCheckpointStore {
    /// Connects to Redis and verifies the connection with `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Connection`] if the pool cannot be created
    /// or Redis does not answer.
    pub async fn new(config: RedisConfig) -> Result<Self, CheckpointError> {
        debug!(slot = %config.slot, "Initializing Redis checkpoint store");

        let mut pool_config = PoolConfig::from_url(&config.url);
        if let Some(pool) = pool_config.pool.as_mut() {
            pool.max_size = config.pool_size;
            pool.timeouts.wait = Some(config.connection_timeout);
            pool.timeouts.create = Some(config.connection_timeout);
            pool.timeouts.recycle = Some(config.connection_timeout);
        }

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CheckpointError::Connection(format!("Failed to create pool: {e}")))?;

        let mut conn = pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            CheckpointError::Connection(format!("Failed to connect to Redis: {e}"))
        })?;

        redis::cmd("PING")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| CheckpointError::Connection(format!("Redis connection test failed: {e}")))?;

        let key = Self::make_key(&config.slot);
        debug!(key = %key, "Redis checkpoint store ready");
        Ok(Self { pool, config, key })
    }

    fn make_key(slot: &str) -> String {
        format!("{KEY_PREFIX}:{slot}")
    }

    /// Runs a Redis operation, retrying transient failures.
    async fn with_retry<F, T, Fut>(&self, operation: F) -> Result<T, CheckpointError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if Self::is_retryable(&e) && retries < self.config.max_retries => {
                    retries += 1;
                    let delay = Duration::from_millis(BASE_RETRY_DELAY_MS * 2_u64.pow(retries - 1));
                    warn!(
                        attempt = retries,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Redis operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(retries, error = %e, "Redis operation failed");
                    return Err(CheckpointError::Connection(format!("Redis operation failed: {e}")));
                }
            }
        }
    }

    fn is_retryable(error: &RedisError) -> bool {
        error.is_io_error()
            || error.is_timeout()
            || error.is_connection_dropped()
            || error.is_connection_refusal()
    }

    fn pool_error(e: impl std::fmt::Display) -> RedisError {
        RedisError::from((
            redis::ErrorKind::IoError,
            "Failed to get connection from pool",
            e.to_string(),
        ))
    }

    fn serialize_token(token: &CheckpointToken) -> Result<Vec<u8>, CheckpointError> {
        bson::to_vec(token.as_document())
            .map_err(|e| CheckpointError::Serialization(format!("Failed to serialize checkpoint: {e}")))
    }

    fn deserialize_token(bytes: &[u8]) -> Result<CheckpointToken, CheckpointError> {
        bson::from_slice(bytes)
            .map(CheckpointToken::new)
            .map_err(|e| CheckpointError::Corrupted(format!("Stored checkpoint is not BSON: {e}")))
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn persist(&self, token: &CheckpointToken) -> Result<(), CheckpointError> {
        let value = Self::serialize_token(token)?;
        let pool = self.pool.clone();
        let key = self.key.as_str();
        let ttl = self.config.ttl;

        self.with_retry::<_, (), _>(|| async {
            let mut conn = pool.get().await.map_err(Self::pool_error)?;
            match ttl {
                Some(ttl) => conn.set_ex(key, &value, ttl.as_secs().max(1)).await,
                None => conn.set(key, &value).await,
            }
        })
        .await?;

        debug!(key = %self.key, "Checkpoint stored in Redis");
        Ok(())
    }

    async fn load(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
        let pool = self.pool.clone();
        let key = self.key.as_str();

        let bytes: Option<Vec<u8>> = self
            .with_retry(|| async {
                let mut conn = pool.get().await.map_err(Self::pool_error)?;
                conn.get(key).await
            })
            .await?;

        match bytes {
            Some(data) if !data.is_empty() => Self::deserialize_token(&data).map(Some),
            _ => {
                debug!(key = %self.key, "No checkpoint in Redis");
                Ok(None)
            }
        }
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        let pool = self.pool.clone();
        let key = self.key.as_str();

        self.with_retry::<_, (), _>(|| async {
            let mut conn = pool.get().await.map_err(Self::pool_error)?;
            conn.del(key).await
        })
        .await
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        self.pool.close();
        debug!("Redis checkpoint store closed");
        Ok(())
    }
}
