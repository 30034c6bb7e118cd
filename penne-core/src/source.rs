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

//! Source adapters and the raw events they produce.
//!
//! Three mechanisms feed the pipeline, each producing a different raw shape:
//!
//! | Mechanism | Raw event | Adapter |
//! |-----------|-----------|---------|
//! | Replication log tail | [`RowsEvent`] | [`QueuedSource`] over an external decoder |
//! | Native change feed | [`ChangeFeedEvent`] | [`QueuedSource`] over [`ChangeFeedProducer`](crate::change_stream::ChangeFeedProducer) |
//! | Poll and diff | [`DiffEvent`] | [`PollingSource`](crate::poll::PollingSource) |
//!
//! All of them implement [`Source`]: produce the next raw event, signal end of
//! stream, or signal an error. The orchestrator and the normalizer never look
//! at the mechanism.
//!
//! # Bounded queue
//!
//! Event-driven mechanisms push from their own task. [`bounded`] creates the
//! explicit queue between that task and the orchestrator: the producer awaits
//! free capacity (backpressure) and the orchestrator pulls one raw event at a
//! time, so arrival order is preserved end to end.

use crate::checkpoint::CheckpointToken;
use crate::event::{Namespace, Row};
use bson::Document;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use crate::snapshot::DiffEvent;

/// Default capacity of the queue between an event-driven producer and the pipeline.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// How long [`QueuedSource::close`] waits for the producer task before aborting it.
const PRODUCER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A raw event from any source mechanism.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// Row-level batch from a replication log
    LogTail(RowsEvent),

    /// Document from a native change feed
    ChangeFeed(ChangeFeedEvent),

    /// Change inferred by the snapshot differ
    Diff(DiffEvent),
}

impl RawEvent {
    /// Namespace the event belongs to, if it carries one.
    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            Self::LogTail(rows) => Some(&rows.namespace),
            Self::ChangeFeed(change) => change.namespace.as_ref(),
            Self::Diff(diff) => Some(&diff.namespace),
        }
    }

    /// Source position after this event, if the mechanism has one.
    pub fn position(&self) -> Option<CheckpointToken> {
        match self {
            Self::LogTail(rows) => rows.position.clone(),
            Self::ChangeFeed(change) => Some(CheckpointToken::resume_token(change.resume_token.clone())),
            Self::Diff(_) => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::LogTail(_) => SourceKind::LogTail,
            Self::ChangeFeed(_) => SourceKind::ChangeFeed,
            Self::Diff(_) => SourceKind::Poll,
        }
    }
}

/// Operation classification of a log-tail rows event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowsEventKind {
    /// Rows written
    Write,
    /// Rows updated, each with before and after images
    Update,
    /// Rows deleted
    Delete,
    /// Any other event the decoder passed through
    Other(String),
}

impl fmt::Display for RowsEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => f.write_str("writerows"),
            Self::Update => f.write_str("updaterows"),
            Self::Delete => f.write_str("deleterows"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// One row inside a rows event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowImage {
    /// Row before the change (updates and deletes)
    pub before: Option<Row>,
    /// Row after the change (writes and updates)
    pub after: Option<Row>,
}

impl RowImage {
    /// Image of a written row.
    pub fn inserted(after: Row) -> Self {
        Self { before: None, after: Some(after) }
    }

    /// Image of an updated row.
    pub fn updated(before: Row, after: Row) -> Self {
        Self { before: Some(before), after: Some(after) }
    }

    /// Image of a deleted row.
    pub fn deleted(before: Row) -> Self {
        Self { before: Some(before), after: None }
    }
}

/// A log-tail event: one operation applied to one or more rows of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    /// Schema and table the rows belong to
    pub namespace: Namespace,
    /// Operation applied to every row
    pub kind: RowsEventKind,
    /// Affected rows, in log order
    pub rows: Vec<RowImage>,
    /// Log position after this event
    pub position: Option<CheckpointToken>,
    /// Commit time from the log header
    pub source_time: Option<DateTime<Utc>>,
}

/// Operation type of a change-feed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFeedOperation {
    /// Document inserted
    Insert,
    /// Document updated in place
    Update,
    /// Document replaced entirely
    Replace,
    /// Document deleted
    Delete,
    /// Collection-level or unknown operation (drop, rename, invalidate, ...)
    Other(String),
}

/// Field-level description of an update, as reported by the change feed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateDescription {
    /// Fields added or modified
    pub updated_fields: Document,
    /// Fields removed
    pub removed_fields: Vec<String>,
}

/// A change-feed document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFeedEvent {
    /// Operation type
    pub operation: ChangeFeedOperation,
    /// Database and collection, absent for some collection-level events
    pub namespace: Option<Namespace>,
    /// Identifying key of the document
    pub document_key: Option<Document>,
    /// Document after the change
    pub full_document: Option<Document>,
    /// Document before the change (pre-image)
    pub full_document_before_change: Option<Document>,
    /// Field-level delta for updates
    pub update_description: Option<UpdateDescription>,
    /// Commit time of the operation
    pub cluster_time: Option<DateTime<Utc>>,
    /// Token that resumes the feed right after this event
    pub resume_token: Document,
}

/// Mechanism behind a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Replication log tail
    LogTail,
    /// Native change feed
    ChangeFeed,
    /// Periodic full read and diff
    Poll,
}

impl SourceKind {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogTail => "log_tail",
            Self::ChangeFeed => "change_feed",
            Self::Poll => "poll",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Connectivity blip, lock wait or timeout; retry later without advancing
    #[error("Transient source error: {message}")]
    Transient {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authorization failure, missing table, lost resume point; stop the pipeline
    #[error("Permanent source error: {message}")]
    Permanent {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SourceError {
    /// Creates a transient error from any error type.
    #[must_use]
    pub fn transient(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transient {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a transient error with a custom message.
    #[must_use]
    pub fn transient_msg(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a permanent error from any error type.
    #[must_use]
    pub fn permanent(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Permanent {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a permanent error with a custom message.
    #[must_use]
    pub fn permanent_msg(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    /// Returns true if the source may recover on its own.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Uniform interface over all source mechanisms.
///
/// Call [`start`](Source::start) once, then [`next_raw`](Source::next_raw)
/// until it returns `None`, then [`close`](Source::close).
#[async_trait::async_trait]
pub trait Source: Send {
    /// Connects and positions the source.
    ///
    /// `resume_from` is the last persisted checkpoint. Sources without
    /// resumable positions ignore it and take a fresh baseline.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be reached or positioned.
    async fn start(&mut self, resume_from: Option<CheckpointToken>) -> Result<(), SourceError>;

    /// Waits for the next raw event.
    ///
    /// Returns `None` at end of stream. A transient error does not end the
    /// stream: the caller may keep pulling.
    async fn next_raw(&mut self) -> Option<Result<RawEvent, SourceError>>;

    /// Stops producing events and releases the connection.
    ///
    /// After `close` returns no further raw events are produced.
    async fn close(&mut self) -> Result<(), SourceError>;

    /// Re-establishes the source after a transient error.
    ///
    /// Event-driven sources reconnect and resume after `resume_from`.
    /// The default does nothing, which suits sources that recover on the
    /// next [`next_raw`](Source::next_raw) call.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be re-established.
    async fn restart(&mut self, resume_from: Option<CheckpointToken>) -> Result<(), SourceError> {
        let _ = resume_from;
        Ok(())
    }

    /// Mechanism behind this source.
    fn kind(&self) -> SourceKind;
}

#[async_trait::async_trait]
impl<S: Source + ?Sized> Source for Box<S> {
    async fn start(&mut self, resume_from: Option<CheckpointToken>) -> Result<(), SourceError> {
        (**self).start(resume_from).await
    }

    async fn next_raw(&mut self) -> Option<Result<RawEvent, SourceError>> {
        (**self).next_raw().await
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        (**self).close().await
    }

    async fn restart(&mut self, resume_from: Option<CheckpointToken>) -> Result<(), SourceError> {
        (**self).restart(resume_from).await
    }

    fn kind(&self) -> SourceKind {
        (**self).kind()
    }
}

type QueueItem = Result<RawEvent, SourceError>;

/// Producer half of the raw-event queue.
#[derive(Debug, Clone)]
pub struct RawEventSender {
    tx: mpsc::Sender<QueueItem>,
}

/// The consumer has gone away; the producer should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("raw event queue is closed")]
pub struct QueueClosed;

impl RawEventSender {
    /// Pushes a raw event, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] once the consumer closed the queue.
    pub async fn send(&self, event: RawEvent) -> Result<(), QueueClosed> {
        self.tx.send(Ok(event)).await.map_err(|_| QueueClosed)
    }

    /// Reports an error to the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] once the consumer closed the queue.
    pub async fn fail(&self, error: SourceError) -> Result<(), QueueClosed> {
        self.tx.send(Err(error)).await.map_err(|_| QueueClosed)
    }

    /// Resolves when the consumer closes the queue.
    ///
    /// Producers blocked on their own upstream should select on this to stop promptly.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    /// Returns true once the consumer closed the queue.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of the raw-event queue.
#[derive(Debug)]
pub struct RawEventReceiver {
    rx: mpsc::Receiver<QueueItem>,
}

impl RawEventReceiver {
    /// Pulls the next item; `None` when every sender is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<QueueItem> {
        self.rx.recv().await
    }

    /// Stops accepting new items. Already queued items can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Creates a bounded raw-event queue.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn bounded(capacity: usize) -> (RawEventSender, RawEventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (RawEventSender { tx }, RawEventReceiver { rx })
}

/// Pushes raw events from an external mechanism into the queue.
///
/// Implemented by the MongoDB change-stream pump and by log-tail decoders.
#[async_trait::async_trait]
pub trait RawEventProducer: Send + 'static {
    /// Produces events until the upstream ends or the queue is closed.
    ///
    /// Returning `Ok(())` ends the stream normally. Returning an error
    /// delivers it to the consumer as the last item.
    async fn produce(
        &mut self,
        resume_from: Option<CheckpointToken>,
        tx: RawEventSender,
    ) -> Result<(), SourceError>;
}

/// Event-driven [`Source`] backed by a producer task and a bounded queue.
pub struct QueuedSource {
    kind: SourceKind,
    capacity: usize,
    producer: Option<Box<dyn RawEventProducer>>,
    rx: Option<RawEventReceiver>,
    task: Option<JoinHandle<Box<dyn RawEventProducer>>>,
}

impl QueuedSource {
    /// Creates a queued source with an explicit mechanism label and queue capacity.
    ///
    /// A zero capacity is raised to one.
    pub fn new(kind: SourceKind, producer: Box<dyn RawEventProducer>, capacity: usize) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            producer: Some(producer),
            rx: None,
            task: None,
        }
    }

    /// Source fed by a replication log decoder.
    pub fn log_tail(producer: impl RawEventProducer) -> Self {
        Self::new(SourceKind::LogTail, Box::new(producer), DEFAULT_QUEUE_CAPACITY)
    }

    /// Source fed by a native change feed.
    pub fn change_feed(producer: impl RawEventProducer) -> Self {
        Self::new(SourceKind::ChangeFeed, Box::new(producer), DEFAULT_QUEUE_CAPACITY)
    }

    /// Overrides the queue capacity. Takes effect on the next `start`.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

impl fmt::Debug for QueuedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedSource")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("started", &self.task.is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl Source for QueuedSource {
    async fn start(&mut self, resume_from: Option<CheckpointToken>) -> Result<(), SourceError> {
        let mut producer = self
            .producer
            .take()
            .ok_or_else(|| SourceError::permanent_msg("source already started"))?;

        let (tx, rx) = bounded(self.capacity);
        let kind = self.kind;

        let task = tokio::spawn(async move {
            if let Err(e) = producer.produce(resume_from, tx.clone()).await {
                warn!(source = %kind, error = %e, "Producer stopped with error");
                let _ = tx.fail(e).await;
            } else {
                debug!(source = %kind, "Producer finished");
            }
            producer
        });

        self.rx = Some(rx);
        self.task = Some(task);
        Ok(())
    }

    async fn next_raw(&mut self) -> Option<Result<RawEvent, SourceError>> {
        self.rx.as_mut()?.recv().await
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if let Some(rx) = self.rx.as_mut() {
            rx.close();
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(PRODUCER_SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(producer)) => self.producer = Some(producer),
                Ok(Err(e)) if e.is_panic() => {
                    return Err(SourceError::permanent_msg(format!("producer task panicked: {e}")));
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(source = %self.kind, "Producer did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        self.rx = None;
        Ok(())
    }

    async fn restart(&mut self, resume_from: Option<CheckpointToken>) -> Result<(), SourceError> {
        self.close().await?;
        if self.producer.is_none() {
            return Err(SourceError::permanent_msg("producer was lost and cannot be restarted"));
        }
        info!(source = %self.kind, resuming = resume_from.is_some(), "Restarting producer");
        self.start(resume_from).await
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }
}

/// Replays a fixed sequence of raw events, then ends the stream.
///
/// Useful for captured log-tail batches and for exercising a pipeline
/// without a live database.
#[derive(Debug, Default)]
pub struct ReplayProducer {
    items: Vec<Result<RawEvent, SourceError>>,
}

impl ReplayProducer {
    /// Creates a producer replaying `events` in order.
    pub fn new(events: Vec<RawEvent>) -> Self {
        Self {
            items: events.into_iter().map(Ok).collect(),
        }
    }

    /// Appends an error to the replay sequence.
    #[must_use]
    pub fn then_error(mut self, error: SourceError) -> Self {
        self.items.push(Err(error));
        self
    }

    /// Appends an event to the replay sequence.
    #[must_use]
    pub fn then_event(mut self, event: RawEvent) -> Self {
        self.items.push(Ok(event));
        self
    }
}

#[async_trait::async_trait]
impl RawEventProducer for ReplayProducer {
    async fn produce(
        &mut self,
        resume_from: Option<CheckpointToken>,
        tx: RawEventSender,
    ) -> Result<(), SourceError> {
        let mut items = std::mem::take(&mut self.items).into_iter();

        // Log positions are monotonic, so skip everything up to the checkpoint.
        if let Some((file, offset)) = resume_from.as_ref().and_then(CheckpointToken::as_log_position) {
            let mut remaining: Vec<_> = items.collect();
            let resume_index = remaining.iter().position(|item| {
                matches!(item, Ok(RawEvent::LogTail(rows))
                    if rows.position.as_ref().and_then(CheckpointToken::as_log_position) == Some((file, offset)))
            });
            if let Some(index) = resume_index {
                remaining.drain(..=index);
            }
            items = remaining.into_iter();
        }

        for item in items {
            let sent = match item {
                Ok(event) => tx.send(event).await,
                Err(error) => tx.fail(error).await,
            };
            if sent.is_err() {
                break;
            }
        }
        Ok(())
    }
}
