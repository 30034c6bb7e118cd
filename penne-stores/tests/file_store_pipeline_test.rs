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

//! Restart behavior of a pipeline checkpointing to a file.

use bson::doc;
use penne_core::checkpoint::{CheckpointStore, CheckpointToken};
use penne_core::event::Namespace;
use penne_core::key::KeyStrategy;
use penne_core::normalize::Normalizer;
use penne_core::pipeline::{Pipeline, PipelineConfig};
use penne_core::sink::MemorySink;
use penne_core::source::{QueuedSource, RawEvent, ReplayProducer, RowImage, RowsEvent, RowsEventKind};
use penne_stores::file::FileCheckpointStore;
use tempfile::TempDir;

fn binlog(position: u64) -> RawEvent {
    RawEvent::LogTail(RowsEvent {
        namespace: Namespace::new("cloth_store", "shirts"),
        kind: RowsEventKind::Write,
        rows: vec![RowImage::inserted(doc! { "id": i64::try_from(position).unwrap() })],
        position: Some(CheckpointToken::log_position("binlog.000001", position)),
        source_time: None,
    })
}

fn normalizer() -> Normalizer {
    Normalizer::default().with_key_strategy(
        Namespace::new("cloth_store", "shirts"),
        KeyStrategy::from_columns(vec!["id".to_string()]),
    )
}

async fn run_once(path: &std::path::Path, history: Vec<RawEvent>) -> Vec<String> {
    let sink = MemorySink::default();
    Pipeline::new(
        PipelineConfig::default(),
        QueuedSource::log_tail(ReplayProducer::new(history)),
        normalizer(),
        sink.clone(),
        FileCheckpointStore::new(path),
    )
    .run()
    .await
    .unwrap();

    sink.events().into_iter().map(|e| e.key.into_string()).collect()
}

#[tokio::test]
async fn test_restart_resumes_after_file_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.ejson");

    let first = run_once(&path, (1..=3).map(binlog).collect()).await;
    assert_eq!(first, vec!["1", "2", "3"]);

    // The log grew while the relay was down.
    let second = run_once(&path, (1..=5).map(binlog).collect()).await;
    assert_eq!(second, vec!["4", "5"]);

    let token = FileCheckpointStore::new(&path).load().await.unwrap().unwrap();
    assert_eq!(token.as_log_position(), Some(("binlog.000001", 5)));
}

#[tokio::test]
async fn test_rewound_checkpoint_redelivers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.ejson");

    run_once(&path, (1..=3).map(binlog).collect()).await;

    // Simulate a crash that lost the last persist.
    FileCheckpointStore::new(&path)
        .persist(&CheckpointToken::log_position("binlog.000001", 2))
        .await
        .unwrap();

    let replayed = run_once(&path, (1..=3).map(binlog).collect()).await;
    assert_eq!(replayed, vec!["3"]);
}
