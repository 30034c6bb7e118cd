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

//! In-memory checkpoint store.
//!
//! Suitable for tests and for runs where restarting from scratch is
//! acceptable.
//!
//! # Limitations
//!
//! - **No persistence**: the token is lost when the process exits
//! - **Single process only**: clones share state, other processes do not
//!
//! # Example
//!
//! ```rust
//! use penne_stores::memory::MemoryCheckpointStore;
//! use penne_core::checkpoint::{CheckpointStore, CheckpointToken};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryCheckpointStore::new();
//! let handle = store.clone();
//!
//! store.persist(&CheckpointToken::log_position("binlog.000001", 4)).await?;
//! assert_eq!(handle.persist_count().await, 1);
//! # Ok(())
//! # }
//! ```

use penne_core::checkpoint::{CheckpointError, CheckpointStore, CheckpointToken};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Slot {
    token: Option<CheckpointToken>,
    persists: u64,
}

/// In-memory checkpoint store. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    slot: Arc<RwLock<Slot>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating in-memory checkpoint store");
        Self::default()
    }

    /// Creates a store already holding `token`.
    #[must_use]
    pub fn with_token(token: CheckpointToken) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Slot {
                token: Some(token),
                persists: 0,
            })),
        }
    }

    /// Number of successful persists since creation.
    pub async fn persist_count(&self) -> u64 {
        self.slot.read().await.persists
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn persist(&self, token: &CheckpointToken) -> Result<(), CheckpointError> {
        let mut slot = self.slot.write().await;
        slot.token = Some(token.clone());
        slot.persists += 1;
        trace!(checkpoint = %token, "Checkpoint stored in memory");
        Ok(())
    }

    async fn load(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
        Ok(self.slot.read().await.token.clone())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        self.slot.write().await.token = None;
        Ok(())
    }
}
