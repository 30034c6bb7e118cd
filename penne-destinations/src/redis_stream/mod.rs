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
//! Redis Streams sink.
//!
//! Each canonical event becomes one stream entry with a single field:
//!
//! ```text
//! XADD cloth_store_changes * change {"db": ..., "table": ..., "eventName": ...}
//! ```
//!
//! The value is canonical Extended JSON, so consumers can decode every BSON
//! type exactly. Redis assigns the entry id; ids strictly increase within a
//! stream, which gives readers the pipeline's append order.
//!
//! Appends are not retried here. The pipeline owns the retry policy and
//! decides between blocking and failing when Redis stays unavailable, so this
//! module only classifies errors as retryable or not.

pub mod config;
mod sink;

pub use config::{RedisStreamConfig, RedisStreamConfigBuilder, DEFAULT_STREAM};
pub use sink::RedisStreamSink;
