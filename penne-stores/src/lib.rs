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

//! Checkpoint store implementations for Penne.
//!
//! This crate provides backends for the
//! [`CheckpointStore`](penne_core::checkpoint::CheckpointStore) trait, which
//! persists the last processed source position.
//!
//! # Available Stores
//!
//! - **File** ([`file::FileCheckpointStore`]): one atomically replaced file,
//!   the default for single-instance deployments
//! - **Memory** ([`memory::MemoryCheckpointStore`]): tests and ephemeral runs
//! - **Redis** (`redis-store` feature): a key in a shared Redis instance
//!
//! # Example: File Store
//!
//! ```rust,no_run
//! use penne_stores::file::FileCheckpointStore;
//! use penne_core::checkpoint::{CheckpointStore, CheckpointToken};
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FileCheckpointStore::new(".mongo_resume_token.ejson");
//!
//! store.persist(&CheckpointToken::resume_token(doc! { "_data": "8264A1" })).await?;
//! assert!(store.load().await?.is_some());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod file;
pub mod memory;

#[cfg(feature = "redis-store")]
pub mod redis;
