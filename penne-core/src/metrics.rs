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

//! Metrics instrumentation for Penne pipelines.
//!
//! Uses the `metrics` facade, so any exporter can be installed by the
//! binary (the `penne` CLI installs the Prometheus exporter when asked to).
//! Without an installed recorder every call is a no-op.
//!
//! # Naming
//!
//! All metric names start with `penne_`, counters end with `_total` and
//! durations with `_seconds`.
//!
//! # Labels
//!
//! - **table**: `database.table` of the monitored source (low cardinality)
//! - **operation**: `insert`, `update` or `delete`
//! - **sink_type**: sink identifier such as `redis-stream`
//! - **error_type**: one of the fixed [`ErrorCategory`] values
//! - **stage**: `sink`, `checkpoint` or `source`
//!
//! Logical keys, timestamps and error messages are never used as labels.
//!
//! # Example
//!
//! ```rust
//! use penne_core::metrics::{self, ErrorCategory, RetryStage};
//!
//! metrics::increment_events_appended("cloth_store.shirts", "insert");
//! metrics::increment_events_dropped("cloth_store.shirts", ErrorCategory::Validation);
//! metrics::increment_retries(RetryStage::Sink, ErrorCategory::Connection);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all Penne metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "penne";

/// Events appended to the sink.
///
/// Type: Counter
/// Labels: table, operation
#[doc(hidden)]
pub const EVENTS_APPENDED_TOTAL: &str = "penne_events_appended_total";

/// Raw events dropped because they could not be normalized or delivered.
///
/// Type: Counter
/// Labels: table, error_type
#[doc(hidden)]
pub const EVENTS_DROPPED_TOTAL: &str = "penne_events_dropped_total";

/// Retry attempts.
///
/// Type: Counter
/// Labels: stage, error_type
const RETRIES_TOTAL: &str = "penne_retries_total";

/// Time taken by a single sink append, retries excluded.
///
/// Type: Histogram
/// Labels: sink_type
/// Unit: seconds
#[doc(hidden)]
pub const SINK_APPEND_DURATION_SECONDS: &str = "penne_sink_append_duration_seconds";

/// Sink append errors.
///
/// Type: Counter
/// Labels: sink_type, error_type
const SINK_ERRORS_TOTAL: &str = "penne_sink_errors_total";

/// Checkpoints persisted.
///
/// Type: Counter
const CHECKPOINTS_PERSISTED_TOTAL: &str = "penne_checkpoints_persisted_total";

/// Checkpoint persist errors.
///
/// Type: Counter
/// Labels: error_type
const CHECKPOINT_ERRORS_TOTAL: &str = "penne_checkpoint_errors_total";

/// Source errors.
///
/// Type: Counter
/// Labels: source, error_type
const SOURCE_ERRORS_TOTAL: &str = "penne_source_errors_total";

/// Change-feed reconnections.
///
/// Type: Counter
/// Labels: table
const SOURCE_RECONNECTS_TOTAL: &str = "penne_source_reconnects_total";

/// Distance between source commit time and emission time.
///
/// Type: Histogram
/// Labels: table
/// Unit: seconds
const SOURCE_LAG_SECONDS: &str = "penne_source_lag_seconds";

/// Rows held by the polling snapshot.
///
/// Type: Gauge
/// Labels: table
const SNAPSHOT_ROWS: &str = "penne_snapshot_rows";

/// Current pipeline status (see [`PipelineStatus`]).
///
/// Type: Gauge
const PIPELINE_STATUS: &str = "penne_pipeline_status";

/// Registers descriptions for every Penne metric.
///
/// Call once at startup, after installing an exporter.
pub fn init_metrics() {
    describe_counter!(EVENTS_APPENDED_TOTAL, "Change events appended to the sink");
    describe_counter!(
        EVENTS_DROPPED_TOTAL,
        "Raw events dropped because they could not be normalized or delivered"
    );
    describe_counter!(RETRIES_TOTAL, "Retry attempts by stage");
    describe_counter!(SINK_ERRORS_TOTAL, "Sink append errors");
    describe_counter!(CHECKPOINTS_PERSISTED_TOTAL, "Checkpoints persisted");
    describe_counter!(CHECKPOINT_ERRORS_TOTAL, "Checkpoint persist errors");
    describe_counter!(SOURCE_ERRORS_TOTAL, "Errors reported by the source");
    describe_counter!(SOURCE_RECONNECTS_TOTAL, "Change feed reconnections");

    describe_histogram!(
        SINK_APPEND_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Duration of a single sink append"
    );
    describe_histogram!(
        SOURCE_LAG_SECONDS,
        metrics::Unit::Seconds,
        "Time between source commit and emission"
    );

    describe_gauge!(
        SNAPSHOT_ROWS,
        metrics::Unit::Count,
        "Rows in the polling snapshot"
    );
    describe_gauge!(
        PIPELINE_STATUS,
        "Pipeline status: 0=stopped, 1=running, 2=error, 3=degraded"
    );
}

/// Counts one appended event.
pub fn increment_events_appended(table: &str, operation: &str) {
    counter!(EVENTS_APPENDED_TOTAL, "table" => table.to_string(), "operation" => operation.to_string())
        .increment(1);
}

/// Counts one dropped raw event.
pub fn increment_events_dropped(table: &str, error_category: ErrorCategory) {
    counter!(EVENTS_DROPPED_TOTAL, "table" => table.to_string(), "error_type" => error_category.as_str())
        .increment(1);
}

/// Counts one retry.
pub fn increment_retries(stage: RetryStage, error_category: ErrorCategory) {
    counter!(RETRIES_TOTAL, "stage" => stage.as_str(), "error_type" => error_category.as_str())
        .increment(1);
}

/// Records the duration of one append attempt.
pub fn record_sink_append_duration(duration: Duration, sink_type: &str) {
    histogram!(SINK_APPEND_DURATION_SECONDS, "sink_type" => sink_type.to_string())
        .record(duration.as_secs_f64());
}

/// Counts one failed append attempt.
pub fn increment_sink_errors(sink_type: &str, error_category: ErrorCategory) {
    counter!(
        SINK_ERRORS_TOTAL,
        "sink_type" => sink_type.to_string(),
        "error_type" => error_category.as_str()
    )
    .increment(1);
}

/// Counts one persisted checkpoint.
pub fn increment_checkpoints_persisted() {
    counter!(CHECKPOINTS_PERSISTED_TOTAL).increment(1);
}

/// Counts one failed persist attempt.
pub fn increment_checkpoint_errors(error_category: ErrorCategory) {
    counter!(CHECKPOINT_ERRORS_TOTAL, "error_type" => error_category.as_str()).increment(1);
}

/// Counts one source error.
pub fn increment_source_errors(source: &str, error_category: ErrorCategory) {
    counter!(SOURCE_ERRORS_TOTAL, "source" => source.to_string(), "error_type" => error_category.as_str())
        .increment(1);
}

/// Counts one change-feed reconnection.
pub fn increment_source_reconnects(table: &str) {
    counter!(SOURCE_RECONNECTS_TOTAL, "table" => table.to_string()).increment(1);
}

/// Records how far behind the source the pipeline is.
pub fn record_source_lag(lag_seconds: f64, table: &str) {
    histogram!(SOURCE_LAG_SECONDS, "table" => table.to_string()).record(lag_seconds);
}

/// Sets the number of rows held by a polling snapshot.
pub fn set_snapshot_rows(rows: usize, table: &str) {
    gauge!(SNAPSHOT_ROWS, "table" => table.to_string()).set(rows as f64);
}

/// Sets the pipeline status gauge.
pub fn set_pipeline_status(status: PipelineStatus) {
    gauge!(PIPELINE_STATUS).set(f64::from(status as u8));
}

/// Pipeline status for the `penne_pipeline_status` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineStatus {
    /// Pipeline is stopped.
    Stopped = 0,
    /// Pipeline is running normally.
    Running = 1,
    /// Pipeline stopped on a fatal error.
    Error = 2,
    /// Pipeline is running but a sink or checkpoint retry budget was exhausted.
    Degraded = 3,
}

/// Pipeline stage that retried an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryStage {
    /// Sink append
    Sink,
    /// Checkpoint persist
    Checkpoint,
    /// Source read or reconnect
    Source,
}

impl RetryStage {
    /// Returns the stage as a static string for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sink => "sink",
            Self::Checkpoint => "checkpoint",
            Self::Source => "source",
        }
    }
}

/// Error categories for consistent metric labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection error (network, TCP, DNS failures)
    Connection,
    /// Serialization error (JSON, BSON, encoding failures)
    Serialization,
    /// Permission error (authentication, authorization failures)
    Permission,
    /// Validation error (malformed raw event)
    Validation,
    /// I/O error (local disk)
    Io,
    /// Unknown error (unclassified)
    Unknown,
}

impl ErrorCategory {
    /// Returns the error category as a static string for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection_error",
            Self::Serialization => "serialization_error",
            Self::Permission => "permission_error",
            Self::Validation => "validation_error",
            Self::Io => "io_error",
            Self::Unknown => "unknown_error",
        }
    }
}

impl From<&crate::sink::SinkError> for ErrorCategory {
    fn from(err: &crate::sink::SinkError) -> Self {
        use crate::sink::SinkError;
        match err {
            SinkError::Connection { .. } => Self::Connection,
            SinkError::Serialization { .. } => Self::Serialization,
            SinkError::Configuration { .. } => Self::Validation,
            SinkError::Write { .. } => Self::Unknown,
        }
    }
}

impl From<&crate::checkpoint::CheckpointError> for ErrorCategory {
    fn from(err: &crate::checkpoint::CheckpointError) -> Self {
        use crate::checkpoint::CheckpointError;
        match err {
            CheckpointError::Io(_) => Self::Io,
            CheckpointError::Serialization(_) | CheckpointError::Corrupted(_) => Self::Serialization,
            CheckpointError::Connection(_) => Self::Connection,
            CheckpointError::Other(_) => Self::Unknown,
        }
    }
}

impl From<&crate::source::SourceError> for ErrorCategory {
    fn from(err: &crate::source::SourceError) -> Self {
        use crate::source::SourceError;
        match err {
            SourceError::Transient { .. } => Self::Connection,
            SourceError::Permanent { .. } => Self::Permission,
        }
    }
}

/// Records the elapsed time when dropped.
///
/// ```rust
/// use penne_core::metrics::Timer;
///
/// {
///     let _timer = Timer::new("redis-stream", |duration, sink_type| {
///         penne_core::metrics::record_sink_append_duration(duration, sink_type);
///     });
///     // ... append ...
/// }
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    /// Starts a timer that calls `record_fn` with the elapsed time on drop.
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}
