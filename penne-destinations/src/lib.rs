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
//! Penne Destinations - Stream Sink Implementations
//!
//! This crate provides stream sinks for the Penne CDC relay. A sink is the
//! final stage of the pipeline: every canonical change event is appended to
//! an ordered, append-only log and the sink returns the identifier it was
//! stored under.
//!
//! # Available Sinks
//!
//! - **Redis Streams**: `XADD <stream> * change <json>`
//!
//! # Features
//!
//! - `redis-stream` - Redis Streams sink (default)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use penne_destinations::redis_stream::{RedisStreamConfig, RedisStreamSink};
//! use penne_core::sink::StreamSink;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisStreamConfig::builder()
//!     .url("redis://localhost:6379")
//!     .stream("cloth_store_changes")
//!     .build()?;
//!
//! let sink = RedisStreamSink::new(config).await?;
//! println!("appending to {}", sink.metadata().stream);
//! sink.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic)]

// Redis Streams sink (enabled with "redis-stream" feature)
#[cfg(feature = "redis-stream")]
pub mod redis_stream;
