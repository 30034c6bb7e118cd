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
//! Redis Streams sink configuration.

use penne_core::sink::SinkError;
use std::time::Duration;

/// Stream the relay appends to unless configured otherwise.
pub const DEFAULT_STREAM: &str = "cloth_store_changes";

/// Configuration for [`RedisStreamSink`](super::RedisStreamSink).
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Stream key (default: `cloth_store_changes`)
    pub stream: String,

    /// Connection pool size (default: 4)
    pub pool_size: usize,

    /// Connection timeout (default: 5 seconds)
    pub connection_timeout: Duration,

    /// Approximate upper bound on stream length (`MAXLEN ~ n`).
    ///
    /// `None` keeps every entry. Trimming discards the oldest entries, so
    /// consumers that fall further behind than this lose changes.
    pub max_len: Option<usize>,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            stream: DEFAULT_STREAM.to_string(),
            pool_size: 4,
            connection_timeout: Duration::from_secs(5),
            max_len: None,
        }
    }
}

impl RedisStreamConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> RedisStreamConfigBuilder {
        RedisStreamConfigBuilder::default()
    }
}

/// Builder for [`RedisStreamConfig`].
///
/// # Examples
///
/// ```
/// use penne_destinations::redis_stream::RedisStreamConfig;
///
/// let config = RedisStreamConfig::builder()
///     .url("redis://localhost:6379")
///     .stream("orders_changes")
///     .max_len(100_000)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.stream, "orders_changes");
/// assert_eq!(config.max_len, Some(100_000));
/// ```
#[derive(Debug, Default)]
pub struct RedisStreamConfigBuilder {
    url: Option<String>,
    stream: Option<String>,
    pool_size: Option<usize>,
    connection_timeout: Option<Duration>,
    max_len: Option<usize>,
}

impl RedisStreamConfigBuilder {
    /// Sets the Redis connection URL (required).
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the stream key.
    #[must_use]
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Sets the connection pool size.
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Caps the stream at roughly `max_len` entries.
    #[must_use]
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Configuration`] if the URL is missing, the stream
    /// name is empty, the pool size is 0 or `max_len` is 0.
    pub fn build(self) -> Result<RedisStreamConfig, SinkError> {
        let defaults = RedisStreamConfig::default();

        let url = self.url.ok_or_else(|| {
            SinkError::configuration("Redis URL is required", Some("url".to_string()))
        })?;

        let stream = self.stream.unwrap_or(defaults.stream);
        if stream.trim().is_empty() {
            return Err(SinkError::configuration(
                "Stream name must not be empty",
                Some("stream".to_string()),
            ));
        }

        let pool_size = self.pool_size.unwrap_or(defaults.pool_size);
        if pool_size == 0 {
            return Err(SinkError::configuration(
                "Pool size must be greater than 0",
                Some("pool_size".to_string()),
            ));
        }

        if self.max_len == Some(0) {
            return Err(SinkError::configuration(
                "max_len must be greater than 0",
                Some("max_len".to_string()),
            ));
        }

        Ok(RedisStreamConfig {
            url,
            stream,
            pool_size,
            connection_timeout: self.connection_timeout.unwrap_or(defaults.connection_timeout),
            max_len: self.max_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RedisStreamConfig::builder()
            .url("redis://localhost:6379")
            .build()
            .unwrap();

        assert_eq!(config.stream, DEFAULT_STREAM);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert!(config.max_len.is_none());
    }

    #[test]
    fn test_missing_url() {
        let err = RedisStreamConfig::builder().build().unwrap_err();
        assert!(matches!(
            err,
            SinkError::Configuration { parameter: Some(ref p), .. } if p == "url"
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rejects_empty_stream() {
        let result = RedisStreamConfig::builder()
            .url("redis://localhost:6379")
            .stream("  ")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_pool_and_zero_max_len() {
        assert!(RedisStreamConfig::builder()
            .url("redis://localhost:6379")
            .pool_size(0)
            .build()
            .is_err());

        assert!(RedisStreamConfig::builder()
            .url("redis://localhost:6379")
            .max_len(0)
            .build()
            .is_err());
    }
}
