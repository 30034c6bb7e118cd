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

//! Penne Core - change capture, normalization and reliable delivery.
//!
//! This crate detects row-level changes in a source store and forwards them,
//! in one canonical shape, to an append-only stream.
//!
//! # Key Components
//!
//! - **Keys**: [`key`] derives logical row keys and canonical serializations
//! - **Snapshot Differ**: [`snapshot`] infers inserts, updates and deletes from
//!   successive full reads
//! - **Normalizer**: [`normalize`] turns log-tail, change-feed and diff events
//!   into [`event::ChangeEvent`]s
//! - **Sources**: [`source`], [`change_stream`], [`poll`] and (with the
//!   `mysql` feature) `mysql`
//! - **Checkpoints**: [`checkpoint`] defines resume positions and their store
//! - **Sinks**: [`sink`] defines the append-only stream interface
//! - **Pipeline**: [`pipeline`] wires it all together with retries and
//!   graceful shutdown
//!
//! # Example
//!
//! ```rust
//! use penne_core::key::KeyStrategy;
//! use penne_core::event::Namespace;
//! use penne_core::snapshot::{Snapshot, SnapshotDiffer};
//! use bson::doc;
//!
//! let differ = SnapshotDiffer::new(
//!     Namespace::new("cloth_store", "shirts"),
//!     KeyStrategy::from_columns(vec!["id".to_string()]),
//! );
//!
//! let first = differ.diff(&Snapshot::empty(), vec![doc! { "id": 1, "name": "A" }]);
//! assert_eq!(first.events.len(), 1);
//!
//! let second = differ.diff(&first.snapshot, vec![doc! { "id": 1, "name": "B" }]);
//! assert_eq!(second.events.len(), 1);
//! ```

pub mod change_stream;
pub mod checkpoint;
pub mod event;
pub mod key;
pub mod metrics;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod normalize;
pub mod pipeline;
pub mod poll;
pub mod retry;
pub mod sink;
pub mod snapshot;
pub mod source;
