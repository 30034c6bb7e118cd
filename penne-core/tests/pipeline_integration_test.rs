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

//! Integration tests for pipeline orchestration.
//!
//! These tests drive a [`Pipeline`] end to end with in-process sources, the
//! in-memory sink and a scripted checkpoint store, covering:
//! - the polling scenario from first read to deletes
//! - at-least-once redelivery after a lost checkpoint
//! - sink and checkpoint retry, degradation and recovery
//! - graceful and idempotent shutdown

use bson::{doc, Document};
use penne_core::checkpoint::{CheckpointError, CheckpointStore, CheckpointToken};
use penne_core::event::{Namespace, OperationType, Row};
use penne_core::key::KeyStrategy;
use penne_core::normalize::Normalizer;
use penne_core::pipeline::{
    Pipeline, PipelineConfig, PipelineError, PipelineState, SinkFailurePolicy,
};
use penne_core::poll::{PollingConfig, PollingSource, TableReader};
use penne_core::retry::RetryPolicy;
use penne_core::sink::MemorySink;
use penne_core::source::{
    ChangeFeedEvent, ChangeFeedOperation, QueuedSource, RawEvent, ReplayProducer, RowImage,
    RowsEvent, RowsEventKind, SourceError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Checkpoint store with failure injection.
#[derive(Debug, Clone, Default)]
struct ScriptedCheckpoints {
    token: Arc<Mutex<Option<CheckpointToken>>>,
    persists: Arc<AtomicUsize>,
    fail_next: Arc<AtomicUsize>,
    fail_after: Arc<Mutex<Option<usize>>>,
}

impl ScriptedCheckpoints {
    fn with_token(token: CheckpointToken) -> Self {
        let store = Self::default();
        *store.token.lock().unwrap() = Some(token);
        store
    }

    /// Next `count` persists fail with a retryable I/O error.
    fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Every persist after the first `count` fails permanently.
    fn fail_after(&self, count: usize) {
        *self.fail_after.lock().unwrap() = Some(count);
    }

    fn current(&self) -> Option<CheckpointToken> {
        self.token.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for ScriptedCheckpoints {
    async fn persist(&self, token: &CheckpointToken) -> Result<(), CheckpointError> {
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(CheckpointError::Io(std::io::Error::other("disk unavailable")));
        }
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if self.persists.load(Ordering::SeqCst) >= limit {
                return Err(CheckpointError::Serialization("process crashed".to_string()));
            }
        }
        self.persists.fetch_add(1, Ordering::SeqCst);
        *self.token.lock().unwrap() = Some(token.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
        Ok(self.current())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        *self.token.lock().unwrap() = None;
        Ok(())
    }
}

/// Serves scripted reads in order, then repeats the last successful one.
struct ScriptedReader {
    reads: Mutex<VecDeque<Result<Vec<Row>, SourceError>>>,
    last: Mutex<Vec<Row>>,
    always_fail: bool,
}

impl ScriptedReader {
    fn new(reads: Vec<Result<Vec<Row>, SourceError>>) -> Self {
        Self {
            reads: Mutex::new(reads.into()),
            last: Mutex::new(Vec::new()),
            always_fail: false,
        }
    }

    fn unreachable() -> Self {
        Self {
            always_fail: true,
            ..Self::new(vec![])
        }
    }
}

#[async_trait::async_trait]
impl TableReader for ScriptedReader {
    async fn primary_key_columns(&self, _: &Namespace) -> Result<Vec<String>, SourceError> {
        Ok(vec!["id".to_string()])
    }

    async fn read_all(&self, _: &Namespace) -> Result<Vec<Row>, SourceError> {
        if self.always_fail {
            return Err(SourceError::transient_msg("connection refused"));
        }
        match self.reads.lock().unwrap().pop_front() {
            Some(Ok(rows)) => {
                *self.last.lock().unwrap() = rows.clone();
                Ok(rows)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }
}

fn shirts() -> Namespace {
    Namespace::new("cloth_store", "shirts")
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::fixed(max_retries, Duration::from_millis(1), Duration::from_millis(2))
}

fn config(policy: SinkFailurePolicy) -> PipelineConfig {
    PipelineConfig::builder()
        .retry(fast_retry(2))
        .source_retry(fast_retry(2))
        .sink_failure_policy(policy)
        .build()
        .unwrap()
}

fn polling(reader: ScriptedReader) -> PollingSource<ScriptedReader> {
    let config = PollingConfig::builder()
        .database("cloth_store")
        .table("shirts")
        .interval(Duration::from_millis(5))
        .build()
        .unwrap();
    PollingSource::new(reader, config)
}

fn rows_event(position: u64, ids: &[i64]) -> RawEvent {
    RawEvent::LogTail(RowsEvent {
        namespace: shirts(),
        kind: RowsEventKind::Write,
        rows: ids
            .iter()
            .map(|id| RowImage::inserted(doc! { "id": *id, "name": format!("shirt-{id}") }))
            .collect(),
        position: Some(CheckpointToken::log_position("binlog.000001", position)),
        source_time: None,
    })
}

fn log_tail(events: Vec<RawEvent>) -> QueuedSource {
    QueuedSource::log_tail(ReplayProducer::new(events))
}

fn keyed_normalizer() -> Normalizer {
    Normalizer::default().with_key_strategy(shirts(), KeyStrategy::from_columns(vec!["id".to_string()]))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn name_of(row: Option<&Document>) -> &str {
    row.unwrap().get_str("name").unwrap()
}

#[tokio::test]
async fn test_polling_scenario_end_to_end() {
    let reader = ScriptedReader::new(vec![
        Ok(vec![doc! { "id": 1, "name": "A" }]),
        Ok(vec![doc! { "id": 1, "name": "B" }, doc! { "id": 2, "name": "C" }]),
        Ok(vec![]),
    ]);
    let sink = MemorySink::new("cloth_store_changes");
    let pipeline = Pipeline::new(
        config(SinkFailurePolicy::Block),
        polling(reader),
        Normalizer::default(),
        sink.clone(),
        ScriptedCheckpoints::default(),
    );
    let shutdown = pipeline.shutdown_handle();
    let handle = tokio::spawn(pipeline.run());

    wait_until(|| sink.len() >= 5).await;
    assert!(shutdown.shutdown());
    let report = handle.await.unwrap().unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 5);
    let summary: Vec<(OperationType, &str)> = events
        .iter()
        .map(|e| (e.operation(), e.key.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (OperationType::Insert, "1"),
            (OperationType::Update, "1"),
            (OperationType::Insert, "2"),
            (OperationType::Delete, "1"),
            (OperationType::Delete, "2"),
        ]
    );

    assert_eq!(name_of(events[1].before()), "A");
    assert_eq!(name_of(events[1].after()), "B");
    assert_eq!(name_of(events[2].after()), "C");
    assert_eq!(name_of(events[3].before()), "B");
    assert_eq!(name_of(events[4].before()), "C");

    // Polling has no resumable position.
    assert_eq!(report.checkpoints_persisted, 0);
    assert_eq!(report.events_appended, 5);
    assert!(sink.is_closed());
}

#[tokio::test]
async fn test_unchanged_rows_emit_nothing() {
    let rows = vec![doc! { "id": 1, "name": "A" }, doc! { "id": 2, "name": "B" }];
    let reordered = vec![doc! { "name": "B", "id": 2 }, doc! { "name": "A", "id": 1 }];
    let reader = ScriptedReader::new(vec![Ok(rows), Ok(reordered)]);
    let source = polling(reader);
    let sink = MemorySink::default();

    let pipeline = Pipeline::new(
        config(SinkFailurePolicy::Block),
        source,
        Normalizer::default(),
        sink.clone(),
        ScriptedCheckpoints::default(),
    );
    let shutdown = pipeline.shutdown_handle();
    let handle = tokio::spawn(pipeline.run());

    wait_until(|| sink.len() >= 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.len(), 2);
}

#[tokio::test]
async fn test_checkpoint_persisted_once_per_raw_event() {
    let sink = MemorySink::default();
    let checkpoints = ScriptedCheckpoints::default();
    let pipeline = Pipeline::new(
        config(SinkFailurePolicy::Block),
        log_tail(vec![rows_event(10, &[1, 2, 3]), rows_event(20, &[4])]),
        keyed_normalizer(),
        sink.clone(),
        checkpoints.clone(),
    );

    let report = pipeline.run().await.unwrap();

    assert_eq!(report.raw_events, 2);
    assert_eq!(report.events_appended, 4);
    assert_eq!(report.checkpoints_persisted, 2);
    assert_eq!(
        checkpoints.current().unwrap().as_log_position(),
        Some(("binlog.000001", 20))
    );

    let keys: Vec<String> = sink.events().into_iter().map(|e| e.key.into_string()).collect();
    assert_eq!(keys, vec!["1", "2", "3", "4"]);

    // Events of one raw event share its position.
    let events = sink.events();
    assert_eq!(events[0].position, events[2].position);
}

#[tokio::test]
async fn test_restart_redelivers_after_lost_checkpoint() {
    let history = vec![rows_event(1, &[1]), rows_event(2, &[2]), rows_event(3, &[3])];

    // First run: the third persist never happens.
    let checkpoints = ScriptedCheckpoints::default();
    checkpoints.fail_after(2);
    let first_sink = MemorySink::default();
    let report = Pipeline::new(
        config(SinkFailurePolicy::Block),
        log_tail(history.clone()),
        keyed_normalizer(),
        first_sink.clone(),
        checkpoints.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(first_sink.len(), 3);
    assert!(report.degraded);
    assert_eq!(
        checkpoints.current().unwrap().as_log_position(),
        Some(("binlog.000001", 2))
    );

    // Second run resumes after position 2 and appends row 3 again.
    let restarted = ScriptedCheckpoints::with_token(checkpoints.current().unwrap());
    let second_sink = MemorySink::default();
    let report = Pipeline::new(
        config(SinkFailurePolicy::Block),
        log_tail(history),
        keyed_normalizer(),
        second_sink.clone(),
        restarted.clone(),
    )
    .run()
    .await
    .unwrap();

    assert!(!report.degraded);
    let redelivered = second_sink.events();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].key.as_str(), "3");
    assert_eq!(redelivered[0].after(), first_sink.events()[2].after());
    assert_eq!(
        restarted.current().unwrap().as_log_position(),
        Some(("binlog.000001", 3))
    );
}

#[tokio::test]
async fn test_sink_transient_errors_are_retried() {
    let sink = MemorySink::default();
    sink.fail_next(2, true);

    let report = Pipeline::new(
        config(SinkFailurePolicy::Block),
        log_tail(vec![rows_event(1, &[1])]),
        keyed_normalizer(),
        sink.clone(),
        ScriptedCheckpoints::default(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(sink.failed_attempts(), 2);
    assert_eq!(sink.len(), 1);
    assert_eq!(report.retries, 2);
    assert!(!report.degraded);
}

#[tokio::test]
async fn test_sink_exhaustion_blocks_until_recovery() {
    let sink = MemorySink::default();
    sink.fail_next(6, true);
    let checkpoints = ScriptedCheckpoints::default();

    let report = Pipeline::new(
        config(SinkFailurePolicy::Block),
        log_tail(vec![rows_event(1, &[1]), rows_event(2, &[2])]),
        keyed_normalizer(),
        sink.clone(),
        checkpoints.clone(),
    )
    .run()
    .await
    .unwrap();

    // Nothing skipped, order kept, degraded state cleared by the recovery.
    let keys: Vec<String> = sink.events().into_iter().map(|e| e.key.into_string()).collect();
    assert_eq!(keys, vec!["1", "2"]);
    assert_eq!(report.retries, 6);
    assert!(!report.degraded);
    assert_eq!(
        checkpoints.current().unwrap().as_log_position(),
        Some(("binlog.000001", 2))
    );
}

#[tokio::test]
async fn test_sink_exhaustion_fails_under_fail_policy() {
    let sink = MemorySink::default();
    sink.fail_next(100, true);
    let checkpoints = ScriptedCheckpoints::default();

    let result = Pipeline::new(
        config(SinkFailurePolicy::Fail),
        log_tail(vec![rows_event(1, &[1])]),
        keyed_normalizer(),
        sink.clone(),
        checkpoints.clone(),
    )
    .run()
    .await;

    assert!(matches!(result, Err(PipelineError::Sink(_))));
    assert_eq!(sink.failed_attempts(), 3);
    assert!(checkpoints.current().is_none());
    assert!(sink.is_closed());
}

#[tokio::test]
async fn test_non_retryable_sink_error_is_fatal() {
    let sink = MemorySink::default();
    sink.fail_next(1, false);

    let result = Pipeline::new(
        config(SinkFailurePolicy::Block),
        log_tail(vec![rows_event(1, &[1])]),
        keyed_normalizer(),
        sink.clone(),
        ScriptedCheckpoints::default(),
    )
    .run()
    .await;

    assert!(matches!(result, Err(PipelineError::Sink(ref e)) if !e.is_retryable()));
    assert_eq!(sink.failed_attempts(), 1);
}

#[tokio::test]
async fn test_shutdown_interrupts_blocked_sink_without_checkpoint() {
    let sink = MemorySink::default();
    sink.fail_next(usize::MAX, true);
    let checkpoints = ScriptedCheckpoints::default();

    let pipeline = Pipeline::new(
        config(SinkFailurePolicy::Block),
        log_tail(vec![rows_event(1, &[1])]),
        keyed_normalizer(),
        sink.clone(),
        checkpoints.clone(),
    );
    let shutdown = pipeline.shutdown_handle();
    let handle = tokio::spawn(pipeline.run());

    wait_until(|| sink.failed_attempts() >= 5).await;
    assert!(shutdown.shutdown());
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.events_appended, 0);
    assert!(report.degraded);
    assert!(checkpoints.current().is_none());
}

#[tokio::test]
async fn test_checkpoint_degraded_then_recovers() {
    let checkpoints = ScriptedCheckpoints::default();
    checkpoints.fail_next(3);
    let sink = MemorySink::default();

    let report = Pipeline::new(
        config(SinkFailurePolicy::Block),
        log_tail(vec![rows_event(1, &[1]), rows_event(2, &[2])]),
        keyed_normalizer(),
        sink.clone(),
        checkpoints.clone(),
    )
    .run()
    .await
    .unwrap();

    // First event: one attempt plus two retries, all failing.
    assert_eq!(sink.len(), 2);
    assert_eq!(report.checkpoints_persisted, 1);
    assert!(!report.degraded);
    assert_eq!(
        checkpoints.current().unwrap().as_log_position(),
        Some(("binlog.000001", 2))
    );
}

#[tokio::test]
async fn test_normalization_errors_drop_event_and_continue() {
    let broken_update = RawEvent::ChangeFeed(ChangeFeedEvent {
        operation: ChangeFeedOperation::Update,
        namespace: Some(shirts()),
        document_key: Some(doc! { "_id": 1 }),
        full_document: Some(doc! { "_id": 1, "name": "B" }),
        full_document_before_change: None,
        update_description: None,
        cluster_time: None,
        resume_token: doc! { "_data": "01" },
    });
    let insert = RawEvent::ChangeFeed(ChangeFeedEvent {
        operation: ChangeFeedOperation::Insert,
        namespace: Some(shirts()),
        document_key: Some(doc! { "_id": 2 }),
        full_document: Some(doc! { "_id": 2, "name": "C" }),
        full_document_before_change: None,
        update_description: None,
        cluster_time: None,
        resume_token: doc! { "_data": "02" },
    });

    let sink = MemorySink::default();
    let checkpoints = ScriptedCheckpoints::default();
    let report = Pipeline::new(
        config(SinkFailurePolicy::Block),
        QueuedSource::change_feed(ReplayProducer::new(vec![broken_update, insert])),
        Normalizer::default(),
        sink.clone(),
        checkpoints.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.events_dropped, 1);
    assert_eq!(report.events_appended, 1);
    assert_eq!(sink.events()[0].key.as_str(), "2");
    assert_eq!(
        checkpoints.current().unwrap().as_document(),
        &doc! { "_data": "02" }
    );
}

#[tokio::test]
async fn test_malformed_row_in_batch_keeps_its_siblings() {
    let RawEvent::LogTail(mut batch) = rows_event(7, &[1, 2, 3]) else {
        unreachable!()
    };
    batch.rows[1] = RowImage::default();

    let sink = MemorySink::default();
    let checkpoints = ScriptedCheckpoints::default();
    let report = Pipeline::new(
        config(SinkFailurePolicy::Block),
        log_tail(vec![RawEvent::LogTail(batch), rows_event(8, &[4])]),
        keyed_normalizer(),
        sink.clone(),
        checkpoints.clone(),
    )
    .run()
    .await
    .unwrap();

    let keys: Vec<String> = sink.events().into_iter().map(|e| e.key.into_string()).collect();
    assert_eq!(keys, vec!["1", "3", "4"]);
    assert_eq!(report.events_appended, 3);
    assert_eq!(report.events_dropped, 1);
    assert_eq!(report.checkpoints_persisted, 2);
    assert_eq!(
        checkpoints.current().unwrap().as_log_position(),
        Some(("binlog.000001", 8))
    );
}

#[tokio::test]
async fn test_unsupported_rows_kind_is_dropped_and_checkpointed() {
    let table_map = RawEvent::LogTail(RowsEvent {
        namespace: shirts(),
        kind: RowsEventKind::Other("tablemap".to_string()),
        rows: vec![],
        position: Some(CheckpointToken::log_position("binlog.000001", 5)),
        source_time: None,
    });

    let sink = MemorySink::default();
    let checkpoints = ScriptedCheckpoints::default();
    let report = Pipeline::new(
        config(SinkFailurePolicy::Block),
        log_tail(vec![table_map, rows_event(6, &[1])]),
        keyed_normalizer(),
        sink.clone(),
        checkpoints.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.raw_events, 2);
    assert_eq!(report.events_dropped, 1);
    assert_eq!(report.events_appended, 1);
    assert_eq!(sink.events()[0].key.as_str(), "1");
    assert_eq!(report.checkpoints_persisted, 2);
    assert_eq!(
        checkpoints.current().unwrap().as_log_position(),
        Some(("binlog.000001", 6))
    );
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_reaches_stopped() {
    let reader = ScriptedReader::new(vec![Ok(vec![doc! { "id": 1, "name": "A" }])]);
    let sink = MemorySink::default();
    let pipeline = Pipeline::new(
        config(SinkFailurePolicy::Block),
        polling(reader),
        Normalizer::default(),
        sink.clone(),
        ScriptedCheckpoints::default(),
    );
    let shutdown = pipeline.shutdown_handle();
    let mut state = pipeline.state();
    let handle = tokio::spawn(pipeline.run());

    wait_until(|| sink.len() == 1).await;
    assert!(shutdown.shutdown());
    assert!(!shutdown.shutdown());

    let report = handle.await.unwrap().unwrap();
    assert!(!shutdown.shutdown());
    assert_eq!(report.events_appended, 1);
    assert_eq!(*state.borrow_and_update(), PipelineState::Stopped);
    assert!(sink.is_closed());
}

#[tokio::test]
async fn test_permanent_source_error_is_fatal_after_drain() {
    let producer = ReplayProducer::new(vec![rows_event(1, &[1])])
        .then_error(SourceError::permanent_msg("access denied for replication user"));
    let sink = MemorySink::default();
    let checkpoints = ScriptedCheckpoints::default();

    let result = Pipeline::new(
        config(SinkFailurePolicy::Block),
        QueuedSource::log_tail(producer),
        keyed_normalizer(),
        sink.clone(),
        checkpoints.clone(),
    )
    .run()
    .await;

    assert!(matches!(result, Err(PipelineError::Source(_))));
    // Work done before the failure is kept and checkpointed.
    assert_eq!(sink.len(), 1);
    assert!(checkpoints.current().is_some());
    assert!(sink.is_closed());
}

#[tokio::test]
async fn test_unrecoverable_source_is_fatal() {
    let result = Pipeline::new(
        config(SinkFailurePolicy::Block),
        polling(ScriptedReader::unreachable()),
        Normalizer::default(),
        MemorySink::default(),
        ScriptedCheckpoints::default(),
    )
    .run()
    .await;

    match result {
        Err(PipelineError::SourceUnavailable { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert!(source.is_retryable());
        }
        other => panic!("expected SourceUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_transient_read_error_recovers() {
    let reader = ScriptedReader::new(vec![
        Ok(vec![doc! { "id": 1, "name": "A" }]),
        Err(SourceError::transient_msg("lock wait timeout")),
        Ok(vec![]),
    ]);
    let sink = MemorySink::default();
    let pipeline = Pipeline::new(
        config(SinkFailurePolicy::Block),
        polling(reader),
        Normalizer::default(),
        sink.clone(),
        ScriptedCheckpoints::default(),
    );
    let shutdown = pipeline.shutdown_handle();
    let handle = tokio::spawn(pipeline.run());

    wait_until(|| sink.len() >= 2).await;
    shutdown.shutdown();
    let report = handle.await.unwrap().unwrap();

    let ops: Vec<OperationType> = sink.events().iter().map(|e| e.operation()).collect();
    assert_eq!(ops, vec![OperationType::Insert, OperationType::Delete]);
    assert_eq!(report.retries, 1);
}
