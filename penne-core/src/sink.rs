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

//! Append-only stream sinks.
//!
//! A [`StreamSink`] appends canonical events to a durable, ordered log and
//! returns the [`EntryId`] it assigned. Sinks never de-duplicate: consumers
//! identify redelivered events through the embedded logical key, operation and
//! row images, or through the source position.
//!
//! [`MemorySink`] is an in-process implementation with failure injection,
//! used by tests and dry runs.

use crate::event::ChangeEvent;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a stream entry: `<milliseconds>-<sequence>`.
///
/// Identifiers are totally ordered and strictly increase within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    /// Milliseconds component
    pub millis: u64,
    /// Sequence within the millisecond
    pub sequence: u64,
}

impl EntryId {
    /// Creates an identifier from its two components.
    pub const fn new(millis: u64, sequence: u64) -> Self {
        Self { millis, sequence }
    }

    /// Smallest identifier strictly greater than `self` at time `now_millis`.
    #[must_use]
    pub fn next_after(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.sequence.saturating_add(1))
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.sequence)
    }
}

/// Error returned when parsing an [`EntryId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream entry id: {0:?}")]
pub struct ParseEntryIdError(String);

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, sequence) = s
            .split_once('-')
            .ok_or_else(|| ParseEntryIdError(s.to_string()))?;
        let millis = millis.parse().map_err(|_| ParseEntryIdError(s.to_string()))?;
        let sequence = sequence.parse().map_err(|_| ParseEntryIdError(s.to_string()))?;
        Ok(Self::new(millis, sequence))
    }
}

/// Errors raised by stream sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The stream backend is unreachable
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The event could not be encoded
    #[error("Serialization error: {message}")]
    Serialization {
        /// Human-readable error message
        message: String,
    },

    /// The backend rejected or failed the append
    #[error("Write error: {message}")]
    Write {
        /// Human-readable error message
        message: String,
        /// Whether retrying may succeed
        retryable: bool,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The sink is misconfigured
    #[error("Configuration error: {message}")]
    Configuration {
        /// Human-readable error message
        message: String,
        /// Offending parameter, if known
        parameter: Option<String>,
    },
}

impl SinkError {
    /// Creates a connection error from any error type.
    #[must_use]
    pub fn connection(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Connection {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a connection error with a custom message.
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a write error from any error type.
    #[must_use]
    pub fn write(source: impl std::error::Error + Send + Sync + 'static, retryable: bool) -> Self {
        Self::Write {
            message: source.to_string(),
            retryable,
            source: Some(Box::new(source)),
        }
    }

    /// Creates a write error with a custom message.
    #[must_use]
    pub fn write_msg(message: impl Into<String>, retryable: bool) -> Self {
        Self::Write {
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>, parameter: Option<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            parameter,
        }
    }

    /// Returns whether retrying the append may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Serialization { .. } | Self::Configuration { .. } => false,
            Self::Write { retryable, .. } => *retryable,
        }
    }
}

/// Static description of a sink, for logs and metrics labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkMetadata {
    /// Human-readable name, e.g. "Redis Streams"
    pub name: String,

    /// Type identifier, e.g. "redis-stream"
    pub sink_type: String,

    /// Stream the sink appends to
    pub stream: String,
}

impl SinkMetadata {
    /// Creates metadata for a sink.
    pub fn new(
        name: impl Into<String>,
        sink_type: impl Into<String>,
        stream: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            sink_type: sink_type.into(),
            stream: stream.into(),
        }
    }
}

/// A durable, ordered, append-only log of change events.
#[async_trait::async_trait]
pub trait StreamSink: Send + Sync {
    /// Appends one event and returns the identifier the sink assigned.
    ///
    /// A successful append is durable and visible to stream readers. Appends
    /// from one caller are stored in call order.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`]; [`SinkError::is_retryable`] tells whether the
    /// same append may be attempted again.
    async fn append(&self, event: &ChangeEvent) -> Result<EntryId, SinkError>;

    /// Flushes and releases resources. Further appends fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be closed cleanly.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Describes the sink.
    fn metadata(&self) -> SinkMetadata;
}

#[async_trait::async_trait]
impl<T: StreamSink + ?Sized> StreamSink for Arc<T> {
    async fn append(&self, event: &ChangeEvent) -> Result<EntryId, SinkError> {
        (**self).append(event).await
    }

    async fn close(&self) -> Result<(), SinkError> {
        (**self).close().await
    }

    fn metadata(&self) -> SinkMetadata {
        (**self).metadata()
    }
}

/// An entry stored by [`MemorySink`].
#[derive(Debug, Clone)]
pub struct StoredEntry {
    /// Assigned identifier
    pub id: EntryId,
    /// The appended event
    pub event: ChangeEvent,
    /// Field map exactly as a network sink would send it
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    entries: Vec<StoredEntry>,
    last_id: Option<EntryId>,
    fail_next: usize,
    fail_retryable: bool,
    failed_attempts: usize,
    closed: bool,
}

/// In-memory stream sink.
///
/// Clones share the same log, so a test can keep a handle while the pipeline
/// owns another.
#[derive(Debug, Clone)]
pub struct MemorySink {
    stream: String,
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    /// Creates an empty sink for the named stream.
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            state: Arc::default(),
        }
    }

    /// Makes the next `count` appends fail.
    pub fn fail_next(&self, count: usize, retryable: bool) {
        let mut state = self.lock();
        state.fail_next = count;
        state.fail_retryable = retryable;
    }

    /// Snapshot of every stored entry in append order.
    pub fn entries(&self) -> Vec<StoredEntry> {
        self.lock().entries.clone()
    }

    /// Appended events in order.
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.lock().entries.iter().map(|e| e.event.clone()).collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true when nothing was appended.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Number of appends rejected by failure injection.
    pub fn failed_attempts(&self) -> usize {
        self.lock().failed_attempts
    }

    /// Returns true once [`StreamSink::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemorySinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait::async_trait]
impl StreamSink for MemorySink {
    async fn append(&self, event: &ChangeEvent) -> Result<EntryId, SinkError> {
        let mut state = self.lock();

        if state.closed {
            return Err(SinkError::write_msg("sink is closed", false));
        }

        if state.fail_next > 0 {
            state.fail_next -= 1;
            state.failed_attempts += 1;
            return Err(if state.fail_retryable {
                SinkError::connection_msg("injected connection failure")
            } else {
                SinkError::write_msg("injected write failure", false)
            });
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        let id = match state.last_id {
            Some(last) => last.next_after(now),
            None => EntryId::new(now, 0),
        };

        state.last_id = Some(id);
        state.entries.push(StoredEntry {
            id,
            event: event.clone(),
            fields: event.to_stream_fields(),
        });

        Ok(id)
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.lock().closed = true;
        Ok(())
    }

    fn metadata(&self) -> SinkMetadata {
        SinkMetadata::new("Memory", "memory", self.stream.clone())
    }
}
