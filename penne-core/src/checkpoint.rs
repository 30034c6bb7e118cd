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

//! Checkpoint tokens and the storage abstraction that persists them.
//!
//! A [`CheckpointToken`] marks the last position a source handed to the sink
//! successfully. The token is opaque to the pipeline: change streams store the
//! server resume token as-is, log-tail sources store a `{file, position}` pair.
//!
//! The pipeline calls [`CheckpointStore::persist`] only after every canonical
//! event derived from a raw event has been appended. A crash between the
//! append and the persist re-delivers those events on restart; a crash before
//! the append never advances the checkpoint. Delivery is therefore
//! at-least-once.
//!
//! Polling sources never produce a token: they recover by re-reading the whole
//! table into an empty snapshot, which reports every existing row as an insert.

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, source-specific position marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointToken(Document);

impl CheckpointToken {
    /// Wraps a raw token document.
    pub fn new(token: Document) -> Self {
        Self(token)
    }

    /// Token for a change-stream resume point, stored exactly as the server sent it.
    pub fn resume_token(token: Document) -> Self {
        Self(token)
    }

    /// Token for a replication log position.
    pub fn log_position(file: impl Into<String>, position: u64) -> Self {
        // BSON has no unsigned 64-bit type; offsets never exceed i64::MAX.
        let position = i64::try_from(position).unwrap_or(i64::MAX);
        Self(doc! { "file": file.into(), "position": position })
    }

    /// Returns the `{file, position}` pair if this token is a log position.
    pub fn as_log_position(&self) -> Option<(&str, u64)> {
        let file = self.0.get_str("file").ok()?;
        let position = match self.0.get("position")? {
            Bson::Int64(n) => u64::try_from(*n).ok()?,
            Bson::Int32(n) => u64::try_from(*n).ok()?,
            _ => return None,
        };
        Some((file, position))
    }

    /// Borrows the token document.
    pub fn as_document(&self) -> &Document {
        &self.0
    }

    /// Consumes the token and returns the document.
    pub fn into_document(self) -> Document {
        self.0
    }
}

impl From<Document> for CheckpointToken {
    fn from(value: Document) -> Self {
        Self(value)
    }
}

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable storage for the single checkpoint slot of a pipeline.
///
/// Implementations must overwrite the slot atomically: after a crash,
/// [`load`](CheckpointStore::load) returns either the previous token or the
/// new one, never a torn mixture.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durably replaces the stored token.
    ///
    /// # Errors
    ///
    /// Returns an error if the token could not be made durable. The previous
    /// token is still in place in that case.
    async fn persist(&self, token: &CheckpointToken) -> Result<(), CheckpointError>;

    /// Returns the last persisted token, or `None` when nothing was persisted yet.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Corrupted`] when stored data exists but is
    /// not a valid token, and other variants for backend failures.
    async fn load(&self) -> Result<Option<CheckpointToken>, CheckpointError>;

    /// Removes the stored token so the next run starts without prior state.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refused the removal.
    async fn clear(&self) -> Result<(), CheckpointError>;

    /// Releases backend resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be closed cleanly.
    async fn close(&self) -> Result<(), CheckpointError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<T> {
    async fn persist(&self, token: &CheckpointToken) -> Result<(), CheckpointError> {
        (**self).persist(token).await
    }

    async fn load(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
        (**self).load().await
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        (**self).clear().await
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        (**self).close().await
    }
}

/// Errors raised by checkpoint stores.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Token could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Stored data exists but is not a valid checkpoint
    #[error("Corrupted checkpoint: {0}")]
    Corrupted(String),

    /// Other errors
    #[error("Checkpoint store error: {0}")]
    Other(String),
}

impl CheckpointError {
    /// Returns true if retrying the operation may succeed.
    ///
    /// Corrupted data and encoding failures are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Connection(_) | Self::Other(_))
    }
}
