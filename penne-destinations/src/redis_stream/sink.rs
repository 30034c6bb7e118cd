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
//! Redis Streams sink implementation.

use super::config::RedisStreamConfig;
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use penne_core::event::ChangeEvent;
use penne_core::sink::{EntryId, SinkError, SinkMetadata, StreamSink};
use redis::{ErrorKind, RedisError};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// Appends change events to a Redis stream.
///
/// Connections are pooled; the sink is safe to share across tasks. Appends
/// issued by one caller are stored in call order.
///
/// # Examples
///
/// ```rust,no_run
/// use penne_destinations::redis_stream::{RedisStreamConfig, RedisStreamSink};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RedisStreamConfig::builder()
///     .url("redis://localhost:6379")
///     .build()?;
///
/// let sink = RedisStreamSink::new(config).await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisStreamSink {
    pool: Pool,
    config: RedisStreamConfig,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisStreamSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamSink")
            .field("stream", &self.config.stream)
            .field("pool_size", &self.config.pool_size)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RedisStreamSink {
    /// Creates the connection pool and checks Redis with `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Connection`] if Redis cannot be reached, or a
    /// configuration error if the URL is rejected.
    pub async fn new(config: RedisStreamConfig) -> Result<Self, SinkError> {
        info!(stream = %config.stream, "Initializing Redis Streams sink");

        let mut pool_config = PoolConfig::from_url(&config.url);
        if let Some(pool) = pool_config.pool.as_mut() {
            pool.max_size = config.pool_size;
            pool.timeouts.wait = Some(config.connection_timeout);
            pool.timeouts.create = Some(config.connection_timeout);
            pool.timeouts.recycle = Some(config.connection_timeout);
        }

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| SinkError::configuration(format!("Failed to create pool: {e}"), Some("url".to_string())))?;

        let mut conn = pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            SinkError::connection_msg(format!("Failed to connect to Redis: {e}"))
        })?;

        redis::cmd("PING")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(classify_redis_error)?;

        info!(stream = %config.stream, "Redis Streams sink ready");
        Ok(Self {
            pool,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the sink configuration.
    #[must_use]
    pub fn config(&self) -> &RedisStreamConfig {
        &self.config
    }
}

/// Builds `XADD <stream> [MAXLEN ~ n] * field value ...`.
fn xadd_command(stream: &str, max_len: Option<usize>, fields: &[(String, String)]) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream);
    if let Some(max_len) = max_len {
        cmd.arg("MAXLEN").arg("~").arg(max_len);
    }
    cmd.arg("*");
    for (field, value) in fields {
        cmd.arg(field).arg(value);
    }
    cmd
}

/// Maps a Redis error onto the sink error taxonomy.
fn classify_redis_error(error: RedisError) -> SinkError {
    if error.kind() == ErrorKind::IoError
        || error.is_timeout()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
    {
        return SinkError::connection(error);
    }

    match error.kind() {
        // Server is loading, failing over or resharding
        ErrorKind::BusyLoadingError
        | ErrorKind::TryAgain
        | ErrorKind::ClusterDown
        | ErrorKind::MasterDown
        | ErrorKind::ReadOnly => SinkError::write(error, true),

        ErrorKind::AuthenticationFailed | ErrorKind::InvalidClientConfig => {
            SinkError::configuration(error.to_string(), Some("url".to_string()))
        }

        _ => SinkError::write(error, false),
    }
}

#[async_trait]
impl StreamSink for RedisStreamSink {
    async fn append(&self, event: &ChangeEvent) -> Result<EntryId, SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::write_msg(
                "Cannot append to closed Redis Streams sink",
                false,
            ));
        }

        let cmd = xadd_command(&self.config.stream, self.config.max_len, &event.to_stream_fields());

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| SinkError::connection_msg(format!("Failed to get connection from pool: {e}")))?;

        let id: String = cmd
            .query_async(&mut *conn)
            .await
            .map_err(classify_redis_error)?;

        let entry_id = id.parse::<EntryId>().map_err(|e| {
            SinkError::write_msg(format!("Redis returned an unexpected entry id: {e}"), false)
        })?;

        debug!(stream = %self.config.stream, entry_id = %entry_id, "Appended change to stream");
        Ok(entry_id)
    }

    async fn close(&self) -> Result<(), SinkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Redis Streams sink already closed");
            return Ok(());
        }

        self.pool.close();
        info!(stream = %self.config.stream, "Redis Streams sink closed");
        Ok(())
    }

    fn metadata(&self) -> SinkMetadata {
        SinkMetadata::new("Redis Streams", "redis-stream", self.config.stream.clone())
    }
}
