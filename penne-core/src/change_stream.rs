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

//! `MongoDB` change-stream source.
//!
//! [`ChangeStreamListener`] wraps the driver's change stream and yields
//! [`ChangeFeedEvent`]s. It adds:
//!
//! - whole pre-images and post-images (`fullDocumentBeforeChange: required`
//!   and `fullDocument: updateLookup`), so updates and deletes carry full rows
//! - resumption after a stored resume token
//! - reconnection with exponential backoff and jitter on transient errors
//!
//! [`ChangeFeedProducer`] runs a listener inside a [`QueuedSource`] task and
//! pushes its events into the bounded raw-event queue.
//!
//! # Reconnection
//!
//! When the driver reports a retryable error (network labels or transient
//! server codes), the listener reopens the stream after the last event it
//! yielded, waiting 100ms, 200ms, 400ms, ... capped at `max_backoff_ms`.
//! After `max_reconnect_attempts` failed attempts the error is final.
//! Invalidation (collection dropped or renamed) and a lost resume point
//! (code 286) are final immediately.
//!
//! # Example
//!
//! ```rust,no_run
//! use penne_core::change_stream::{ChangeFeedProducer, ChangeStreamConfig};
//! use penne_core::source::QueuedSource;
//! use mongodb::Client;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::with_uri_str("mongodb://localhost:27017").await?;
//! let collection = client.database("shop").collection("orders");
//!
//! let config = ChangeStreamConfig::builder().max_reconnect_attempts(10).build()?;
//! let source = QueuedSource::change_feed(ChangeFeedProducer::new(collection, config));
//! # Ok(())
//! # }
//! ```
//!
//! [`QueuedSource`]: crate::source::QueuedSource

use crate::checkpoint::CheckpointToken;
use crate::event::Namespace;
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::source::{
    ChangeFeedEvent, ChangeFeedOperation, RawEvent, RawEventProducer, RawEventSender, SourceError,
    UpdateDescription,
};
use bson::Document;
use chrono::DateTime;
use futures::{Stream, StreamExt};
use mongodb::{
    change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken},
    change_stream::ChangeStream,
    error::{Error as MongoError, ErrorKind as MongoErrorKind},
    options::{ChangeStreamOptions, FullDocumentBeforeChangeType, FullDocumentType},
    Collection,
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Server code for a resume point that is no longer in the oplog.
const CHANGE_STREAM_HISTORY_LOST: i32 = 286;

/// Errors raised by the change-stream listener.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Driver or server error
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// Server error code
        code: Option<i32>,
        /// Server error labels
        labels: Vec<String>,
    },

    /// Event could not be converted
    #[error("Event conversion failed: {0}")]
    Conversion(String),

    /// The watched collection was dropped or renamed
    #[error("Stream invalidated: {reason}")]
    Invalidated {
        /// What happened to the collection
        reason: String,
    },

    /// Reconnection gave up
    #[error("Max reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),

    /// The resume point is no longer available
    #[error("Invalid resume token (code {code}): oplog may be truncated")]
    InvalidResumeToken {
        /// Server error code
        code: i32,
    },

    /// Invalid listener configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<MongoError> for StreamError {
    fn from(err: MongoError) -> Self {
        Self::from_mongo_error(err)
    }
}

impl StreamError {
    /// Classifies a driver error by server code and labels.
    pub fn from_mongo_error(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };

        if code == Some(CHANGE_STREAM_HISTORY_LOST) {
            return Self::InvalidResumeToken {
                code: CHANGE_STREAM_HISTORY_LOST,
            };
        }

        let labels: Vec<String> = err.labels().iter().cloned().collect();
        let network = matches!(err.kind.as_ref(), MongoErrorKind::Io(_));

        Self::Connection {
            message: err.to_string(),
            source: Some(Box::new(err)),
            code,
            labels: if network && labels.is_empty() {
                vec!["NetworkError".to_string()]
            } else {
                labels
            },
        }
    }

    /// Returns true if reopening the stream may succeed.
    ///
    /// Retryable: labels `RetryableWriteError`, `TransientTransactionError`,
    /// `NetworkError`, and the transient codes 6, 7, 43, 89, 91, 10107, 11600,
    /// 11602, 13435, 13436.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { code, labels, .. } => {
                if labels.iter().any(|l| {
                    l == "RetryableWriteError" || l == "TransientTransactionError" || l == "NetworkError"
                }) {
                    return true;
                }

                code.is_some_and(|c| {
                    matches!(
                        c,
                        6 |     // HostUnreachable
                        7 |     // HostNotFound
                        43 |    // CursorNotFound
                        89 |    // NetworkTimeout
                        91 |    // ShutdownInProgress
                        10107 | // NotWritablePrimary
                        11600 | // InterruptedAtShutdown
                        11602 | // InterruptedDueToReplStateChange
                        13435 | // NotPrimaryNoSecondaryOk
                        13436 // NotPrimaryOrSecondary
                    )
                })
            }
            Self::Conversion(_)
            | Self::Invalidated { .. }
            | Self::MaxReconnectAttemptsExceeded(_)
            | Self::InvalidResumeToken { .. }
            | Self::Configuration(_) => false,
        }
    }

    /// Short category for logs.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Conversion(_) => "conversion",
            Self::Invalidated { .. } => "invalidated",
            Self::MaxReconnectAttemptsExceeded(_) => "max_retries",
            Self::InvalidResumeToken { .. } => "invalid_token",
            Self::Configuration(_) => "configuration",
        }
    }
}

impl From<StreamError> for SourceError {
    fn from(err: StreamError) -> Self {
        // The listener already retried transient failures; what reaches the
        // pipeline is only retryable if it never got the chance to.
        if err.is_retryable() {
            SourceError::transient(err)
        } else {
            SourceError::permanent(err)
        }
    }
}

/// Pre-image policy for updates and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreImages {
    /// Do not request pre-images
    Off,
    /// Include pre-images when the server has them
    WhenAvailable,
    /// Fail the stream when a pre-image is missing
    Required,
}

/// Configuration for [`ChangeStreamListener`].
#[derive(Debug, Clone)]
pub struct ChangeStreamConfig {
    /// Aggregation stages appended to the change stream
    pub pipeline: Vec<Document>,

    /// Request the current document on updates
    pub full_document_on_update: bool,

    /// Pre-image policy (requires pre-images enabled on the collection)
    pub pre_images: PreImages,

    /// Initial backoff in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    pub max_backoff_ms: u64,

    /// Reconnection attempts before giving up (0 = unlimited)
    pub max_reconnect_attempts: u32,

    /// Cursor batch size
    pub batch_size: Option<u32>,

    /// Backoff jitter factor (0.0 to 1.0)
    pub backoff_jitter: f64,
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self {
            pipeline: Vec::new(),
            full_document_on_update: true,
            pre_images: PreImages::Required,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            max_reconnect_attempts: 5,
            batch_size: None,
            backoff_jitter: 0.1,
        }
    }
}

impl ChangeStreamConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> ChangeStreamConfigBuilder {
        ChangeStreamConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] for a zero initial backoff, an
    /// initial backoff above the maximum, or a jitter outside `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.initial_backoff_ms == 0 {
            return Err(StreamError::Configuration(
                "initial_backoff_ms must be greater than 0".to_string(),
            ));
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(StreamError::Configuration(format!(
                "initial_backoff_ms ({}) must be <= max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }

        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(StreamError::Configuration(format!(
                "backoff_jitter ({}) must be between 0.0 and 1.0",
                self.backoff_jitter
            )));
        }

        Ok(())
    }

    /// Backoff schedule for reconnections.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_reconnect_attempts,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            jitter: self.backoff_jitter,
        }
    }

    fn to_mongo_options(&self, resume_after: Option<&Document>) -> ChangeStreamOptions {
        let mut options = ChangeStreamOptions::default();

        if self.full_document_on_update {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }

        options.full_document_before_change = match self.pre_images {
            PreImages::Off => None,
            PreImages::WhenAvailable => Some(FullDocumentBeforeChangeType::WhenAvailable),
            PreImages::Required => Some(FullDocumentBeforeChangeType::Required),
        };

        options.batch_size = self.batch_size;

        // Tokens are stored as documents; the driver wants its own type.
        if let Some(token_doc) = resume_after {
            let token = bson::to_vec(token_doc)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    bson::from_slice::<ResumeToken>(&bytes).map_err(|e| e.to_string())
                });
            match token {
                Ok(token) => options.resume_after = Some(token),
                Err(e) => warn!(error = %e, "Stored resume token is unusable, starting from now"),
            }
        }

        options
    }
}

/// Builder for [`ChangeStreamConfig`].
#[derive(Debug, Default)]
pub struct ChangeStreamConfigBuilder {
    pipeline: Vec<Document>,
    full_document_on_update: Option<bool>,
    pre_images: Option<PreImages>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    batch_size: Option<u32>,
    backoff_jitter: Option<f64>,
}

impl ChangeStreamConfigBuilder {
    /// Sets extra aggregation stages.
    #[must_use]
    pub fn pipeline(mut self, pipeline: Vec<Document>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Enables or disables the update lookup. Default: enabled.
    #[must_use]
    pub fn full_document_on_update(mut self, enabled: bool) -> Self {
        self.full_document_on_update = Some(enabled);
        self
    }

    /// Sets the pre-image policy. Default: [`PreImages::Required`].
    #[must_use]
    pub fn pre_images(mut self, pre_images: PreImages) -> Self {
        self.pre_images = Some(pre_images);
        self
    }

    /// Sets the initial backoff in milliseconds. Default: 100ms.
    #[must_use]
    pub fn initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = Some(ms);
        self
    }

    /// Sets the maximum backoff in milliseconds. Default: 30,000ms.
    #[must_use]
    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = Some(ms);
        self
    }

    /// Sets the reconnection budget. Default: 5, 0 means unlimited.
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    /// Sets the cursor batch size.
    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Sets the backoff jitter factor. Default: 0.1.
    #[must_use]
    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = Some(jitter);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if validation fails.
    pub fn build(self) -> Result<ChangeStreamConfig, StreamError> {
        let defaults = ChangeStreamConfig::default();
        let config = ChangeStreamConfig {
            pipeline: self.pipeline,
            full_document_on_update: self
                .full_document_on_update
                .unwrap_or(defaults.full_document_on_update),
            pre_images: self.pre_images.unwrap_or(defaults.pre_images),
            initial_backoff_ms: self.initial_backoff_ms.unwrap_or(defaults.initial_backoff_ms),
            max_backoff_ms: self.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
            max_reconnect_attempts: self
                .max_reconnect_attempts
                .unwrap_or(defaults.max_reconnect_attempts),
            batch_size: self.batch_size,
            backoff_jitter: self.backoff_jitter.unwrap_or(defaults.backoff_jitter),
        };

        config.validate()?;
        Ok(config)
    }
}

impl TryFrom<ChangeStreamEvent<Document>> for ChangeFeedEvent {
    type Error = StreamError;

    fn try_from(event: ChangeStreamEvent<Document>) -> Result<Self, Self::Error> {
        let operation = match event.operation_type {
            OperationType::Insert => ChangeFeedOperation::Insert,
            OperationType::Update => ChangeFeedOperation::Update,
            OperationType::Replace => ChangeFeedOperation::Replace,
            OperationType::Delete => ChangeFeedOperation::Delete,
            other => ChangeFeedOperation::Other(format!("{other:?}").to_lowercase()),
        };

        let namespace = event
            .ns
            .and_then(|ns| ns.coll.map(|coll| Namespace::new(ns.db, coll)));

        let update_description = event.update_description.map(|ud| UpdateDescription {
            updated_fields: ud.updated_fields,
            removed_fields: ud.removed_fields,
        });

        let cluster_time = event
            .cluster_time
            .and_then(|ts| DateTime::from_timestamp(i64::from(ts.time), 0));

        let resume_token = bson::to_document(&event.id)
            .map_err(|e| StreamError::Conversion(format!("resume token is not a document: {e}")))?;

        Ok(Self {
            operation,
            namespace,
            document_key: event.document_key,
            full_document: event.full_document,
            full_document_before_change: event.full_document_before_change,
            update_description,
            cluster_time,
            resume_token,
        })
    }
}

type DriverStream = ChangeStream<ChangeStreamEvent<Document>>;

type ReconnectFuture = Pin<Box<dyn Future<Output = Result<DriverStream, StreamError>> + Send>>;

enum StreamState {
    Active,
    Reconnecting(ReconnectFuture),
    Closed,
}

/// A `MongoDB` change stream with resume and reconnection.
///
/// Implements [`Stream`], yielding `Result<ChangeFeedEvent, StreamError>`.
/// After an error that is not retried the stream ends.
pub struct ChangeStreamListener {
    collection: Collection<Document>,
    config: ChangeStreamConfig,
    stream: Option<DriverStream>,
    state: StreamState,
    last_resume_token: Option<Document>,
}

impl ChangeStreamListener {
    /// Opens a change stream, resuming after `resume_after` when given.
    ///
    /// A retryable failure while opening is retried like a reconnection.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the stream cannot
    /// be opened within the reconnection budget.
    pub async fn new(
        collection: Collection<Document>,
        config: ChangeStreamConfig,
        resume_after: Option<Document>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        info!(
            database = %collection.namespace().db,
            collection = %collection.namespace().coll,
            resuming = resume_after.is_some(),
            "Opening change stream"
        );

        let stream = match Self::open(&collection, &config, resume_after.as_ref()).await {
            Ok(stream) => stream,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Failed to open change stream, retrying");
                Self::reconnect_async(collection.clone(), config.clone(), resume_after.clone()).await?
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            collection,
            config,
            stream: Some(stream),
            state: StreamState::Active,
            last_resume_token: resume_after,
        })
    }

    /// Resume token of the last event yielded.
    pub fn last_resume_token(&self) -> Option<&Document> {
        self.last_resume_token.as_ref()
    }

    async fn open(
        collection: &Collection<Document>,
        config: &ChangeStreamConfig,
        resume_after: Option<&Document>,
    ) -> Result<DriverStream, StreamError> {
        let options = config.to_mongo_options(resume_after);
        let stream = if config.pipeline.is_empty() {
            collection.watch().with_options(options).await?
        } else {
            collection
                .watch()
                .pipeline(config.pipeline.clone())
                .with_options(options)
                .await?
        };
        Ok(stream)
    }

    /// Reopens the stream with backoff until it succeeds or the budget runs out.
    async fn reconnect_async(
        collection: Collection<Document>,
        config: ChangeStreamConfig,
        resume_after: Option<Document>,
    ) -> Result<DriverStream, StreamError> {
        let policy = config.reconnect_policy();
        let table = format!("{}.{}", collection.namespace().db, collection.namespace().coll);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if config.max_reconnect_attempts > 0 && attempt > config.max_reconnect_attempts {
                error!(attempts = attempt - 1, "Max reconnection attempts exceeded");
                return Err(StreamError::MaxReconnectAttemptsExceeded(
                    config.max_reconnect_attempts,
                ));
            }

            let backoff = policy.delay_for(attempt);
            warn!(
                attempt,
                backoff_ms = backoff.as_millis(),
                "Reconnecting to change stream"
            );
            tokio::time::sleep(backoff).await;
            metrics::increment_source_reconnects(&table);

            match Self::open(&collection, &config, resume_after.as_ref()).await {
                Ok(stream) => {
                    info!(attempt, "Reconnected to change stream");
                    return Ok(stream);
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "Reconnection attempt failed");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Closes the stream. Subsequent polls return `None`.
    pub async fn close(&mut self) {
        debug!("Closing change stream");
        self.state = StreamState::Closed;
        self.stream = None;
    }
}

impl Stream for ChangeStreamListener {
    type Item = Result<ChangeFeedEvent, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                StreamState::Closed => return Poll::Ready(None),
                StreamState::Reconnecting(reconnect) => match reconnect.as_mut().poll(cx) {
                    Poll::Ready(Ok(stream)) => {
                        this.stream = Some(stream);
                        this.state = StreamState::Active;
                    }
                    Poll::Ready(Err(e)) => {
                        error!(error = %e, "Change stream reconnection failed");
                        this.state = StreamState::Closed;
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                StreamState::Active => {
                    let Some(stream) = this.stream.as_mut() else {
                        this.state = StreamState::Closed;
                        return Poll::Ready(None);
                    };

                    match stream.poll_next_unpin(cx) {
                        Poll::Ready(Some(Ok(event))) => {
                            if event.operation_type == OperationType::Invalidate {
                                let namespace = this.collection.namespace();
                                let reason = format!(
                                    "collection {}.{} was dropped or renamed",
                                    namespace.db, namespace.coll
                                );
                                error!(reason = %reason, "Change stream invalidated");
                                this.state = StreamState::Closed;
                                return Poll::Ready(Some(Err(StreamError::Invalidated { reason })));
                            }

                            let event = match ChangeFeedEvent::try_from(event) {
                                Ok(event) => event,
                                Err(e) => return Poll::Ready(Some(Err(e))),
                            };
                            this.last_resume_token = Some(event.resume_token.clone());
                            return Poll::Ready(Some(Ok(event)));
                        }
                        Poll::Ready(Some(Err(e))) => {
                            let err = StreamError::from_mongo_error(e);
                            if err.is_retryable() {
                                warn!(error = %err, "Retryable change stream error");
                                this.stream = None;
                                this.state = StreamState::Reconnecting(Box::pin(Self::reconnect_async(
                                    this.collection.clone(),
                                    this.config.clone(),
                                    this.last_resume_token.clone(),
                                )));
                            } else {
                                error!(error = %err, "Fatal change stream error");
                                this.state = StreamState::Closed;
                                return Poll::Ready(Some(Err(err)));
                            }
                        }
                        Poll::Ready(None) => {
                            warn!("Change stream ended");
                            this.state = StreamState::Closed;
                            return Poll::Ready(None);
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

/// Pumps a change stream into the raw-event queue of a
/// [`QueuedSource`](crate::source::QueuedSource).
pub struct ChangeFeedProducer {
    collection: Collection<Document>,
    config: ChangeStreamConfig,
}

impl ChangeFeedProducer {
    /// Creates a producer for one collection.
    pub fn new(collection: Collection<Document>, config: ChangeStreamConfig) -> Self {
        Self { collection, config }
    }
}

#[async_trait::async_trait]
impl RawEventProducer for ChangeFeedProducer {
    async fn produce(
        &mut self,
        resume_from: Option<CheckpointToken>,
        tx: RawEventSender,
    ) -> Result<(), SourceError> {
        let mut listener = ChangeStreamListener::new(
            self.collection.clone(),
            self.config.clone(),
            resume_from.map(CheckpointToken::into_document),
        )
        .await?;

        loop {
            tokio::select! {
                () = tx.closed() => {
                    listener.close().await;
                    return Ok(());
                }
                next = listener.next() => match next {
                    Some(Ok(event)) => {
                        if tx.send(RawEvent::ChangeFeed(event)).await.is_err() {
                            listener.close().await;
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
            }
        }
    }
}
