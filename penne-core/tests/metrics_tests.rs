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

//! Tests for the metrics module.

use penne_core::checkpoint::CheckpointError;
use penne_core::metrics::{
    ErrorCategory, PipelineStatus, RetryStage, Timer, EVENTS_APPENDED_TOTAL,
    EVENTS_DROPPED_TOTAL, METRIC_PREFIX, SINK_APPEND_DURATION_SECONDS,
};
use penne_core::sink::SinkError;
use penne_core::source::SourceError;

#[test]
fn test_metric_names() {
    for name in [EVENTS_APPENDED_TOTAL, EVENTS_DROPPED_TOTAL] {
        assert!(name.starts_with(METRIC_PREFIX));
        assert!(name.ends_with("_total"));
    }
    assert!(SINK_APPEND_DURATION_SECONDS.ends_with("_seconds"));
}

#[test]
fn test_pipeline_status_values() {
    assert_eq!(PipelineStatus::Stopped as u8, 0);
    assert_eq!(PipelineStatus::Running as u8, 1);
    assert_eq!(PipelineStatus::Error as u8, 2);
    assert_eq!(PipelineStatus::Degraded as u8, 3);
}

#[test]
fn test_error_categories() {
    assert_eq!(
        ErrorCategory::from(&SinkError::connection_msg("refused")),
        ErrorCategory::Connection
    );
    assert_eq!(
        ErrorCategory::from(&SinkError::serialization("bad json")),
        ErrorCategory::Serialization
    );
    assert_eq!(
        ErrorCategory::from(&CheckpointError::Corrupted("garbage".into())),
        ErrorCategory::Serialization
    );
    assert_eq!(
        ErrorCategory::from(&SourceError::permanent_msg("denied")),
        ErrorCategory::Permission
    );
    assert_eq!(ErrorCategory::Io.as_str(), "io_error");
    assert_eq!(RetryStage::Checkpoint.as_str(), "checkpoint");
}

#[test]
fn test_timer() {
    use std::thread;
    use std::time::Duration;

    let recorded = std::sync::Arc::new(std::sync::Mutex::new(None));
    let recorded_clone = recorded.clone();

    {
        let _timer = Timer::new("redis-stream", move |duration, label: &str| {
            *recorded_clone.lock().unwrap() = Some((duration, label.to_string()));
        });
        thread::sleep(Duration::from_millis(10));
    }

    let (duration, label) = recorded.lock().unwrap().clone().unwrap();
    assert!(duration.as_millis() >= 10);
    assert_eq!(label, "redis-stream");
}

#[test]
fn test_recording_without_recorder_is_a_no_op() {
    penne_core::metrics::increment_events_appended("cloth_store.shirts", "insert");
    penne_core::metrics::set_pipeline_status(PipelineStatus::Degraded);
    penne_core::metrics::set_snapshot_rows(3, "cloth_store.shirts");
}
