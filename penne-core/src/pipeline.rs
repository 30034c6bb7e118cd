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

//! Pipeline orchestration from a source to a stream sink.
//!
//! The [`Pipeline`] pulls raw events from a [`Source`] one at a time and, for
//! each of them:
//!
//! 1. normalizes it into zero or more [`ChangeEvent`]s
//! 2. appends every event to the [`StreamSink`], in order
//! 3. persists the raw event's position to the [`CheckpointStore`]
//!
//! Step 3 only happens after every append of step 2 succeeded, so a crash
//! between the two re-delivers the raw event on restart (at-least-once).
//!
//! # Lifecycle
//!
//! `Starting -> Running -> Draining -> Stopped`, observable through
//! [`Pipeline::state`]. A [`ShutdownHandle`] requests draining; the source is
//! closed before the sink and the checkpoint store.
//!
//! # Failure policy
//!
//! - Normalization errors drop the raw event and processing continues.
//! - Sink and checkpoint errors are retried with exponential backoff. When
//!   the budget runs out the pipeline is marked degraded. For the sink,
//!   [`SinkFailurePolicy`] decides between blocking on the event and failing.
//! - Transient source errors restart the source from the last checkpoint.
//!   Permanent errors, or too many consecutive transient ones, are fatal.
//!
//! # Example
//!
//! ```rust,no_run
//! use penne_core::pipeline::{Pipeline, PipelineConfig};
//! use penne_core::normalize::Normalizer;
//! use penne_core::sink::MemorySink;
//! use penne_core::source::{QueuedSource, ReplayProducer};
//! # use std::sync::Arc;
//! # #[derive(Default)] struct Checkpoints;
//! # #[async_trait::async_trait]
//! # impl penne_core::checkpoint::CheckpointStore for Checkpoints {
//! #     async fn persist(&self, _: &penne_core::checkpoint::CheckpointToken) -> Result<(), penne_core::checkpoint::CheckpointError> { Ok(()) }
//! #     async fn load(&self) -> Result<Option<penne_core::checkpoint::CheckpointToken>, penne_core::checkpoint::CheckpointError> { Ok(None) }
//! #     async fn clear(&self) -> Result<(), penne_core::checkpoint::CheckpointError> { Ok(()) }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = QueuedSource::log_tail(ReplayProducer::new(vec![]));
//! let sink = MemorySink::new("cloth_store_changes");
//!
//! let pipeline = Pipeline::new(
//!     PipelineConfig::default(),
//!     source,
//!     Normalizer::default(),
//!     sink.clone(),
//!     Checkpoints,
//! );
//!
//! let shutdown = pipeline.shutdown_handle();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     shutdown.shutdown();
//! });
//!
//! let report = pipeline.run().await?;
//! println!("appended {} events", report.events_appended);
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::{CheckpointError, CheckpointStore, CheckpointToken};
use crate::event::ChangeEvent;
use crate::metrics::{self, ErrorCategory, PipelineStatus, RetryStage, Timer};
use crate::normalize::Normalizer;
use crate::retry::RetryPolicy;
use crate::sink::{EntryId, SinkError, StreamSink};
use crate::source::{RawEvent, Source, SourceError};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// What to do when sink retries are exhausted for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkFailurePolicy {
    /// Mark the pipeline degraded and keep retrying the same event at the
    /// maximum delay until it succeeds or shutdown is requested.
    #[default]
    Block,
    /// Drain and stop with an error.
    Fail,
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name used in logs
    pub name: String,

    /// Retry schedule for sink appends
    pub sink_retry: RetryPolicy,

    /// Retry schedule for checkpoint loads and persists
    pub checkpoint_retry: RetryPolicy,

    /// Retry schedule for re-establishing the source
    pub source_retry: RetryPolicy,

    /// Behavior once sink retries are exhausted
    pub sink_failure_policy: SinkFailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "penne".to_string(),
            sink_retry: RetryPolicy::default(),
            checkpoint_retry: RetryPolicy::default(),
            source_retry: RetryPolicy {
                max_retries: 10,
                ..RetryPolicy::default()
            },
            sink_failure_policy: SinkFailurePolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    name: Option<String>,
    sink_retry: Option<RetryPolicy>,
    checkpoint_retry: Option<RetryPolicy>,
    source_retry: Option<RetryPolicy>,
    sink_failure_policy: Option<SinkFailurePolicy>,
}

impl PipelineConfigBuilder {
    /// Sets the pipeline name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Uses one retry schedule for both sink and checkpoint operations.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.sink_retry = Some(policy.clone());
        self.checkpoint_retry = Some(policy);
        self
    }

    /// Sets the sink retry schedule.
    #[must_use]
    pub fn sink_retry(mut self, policy: RetryPolicy) -> Self {
        self.sink_retry = Some(policy);
        self
    }

    /// Sets the checkpoint retry schedule.
    #[must_use]
    pub fn checkpoint_retry(mut self, policy: RetryPolicy) -> Self {
        self.checkpoint_retry = Some(policy);
        self
    }

    /// Sets the source retry schedule.
    #[must_use]
    pub fn source_retry(mut self, policy: RetryPolicy) -> Self {
        self.source_retry = Some(policy);
        self
    }

    /// Sets the behavior once sink retries are exhausted.
    #[must_use]
    pub fn sink_failure_policy(mut self, policy: SinkFailurePolicy) -> Self {
        self.sink_failure_policy = Some(policy);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any retry schedule is invalid.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let defaults = PipelineConfig::default();
        let config = PipelineConfig {
            name: self.name.unwrap_or(defaults.name),
            sink_retry: self.sink_retry.unwrap_or(defaults.sink_retry),
            checkpoint_retry: self.checkpoint_retry.unwrap_or(defaults.checkpoint_retry),
            source_retry: self.source_retry.unwrap_or(defaults.source_retry),
            sink_failure_policy: self
                .sink_failure_policy
                .unwrap_or(defaults.sink_failure_policy),
        };

        for (label, policy) in [
            ("sink_retry", &config.sink_retry),
            ("checkpoint_retry", &config.checkpoint_retry),
            ("source_retry", &config.source_retry),
        ] {
            policy
                .validate()
                .map_err(|e| PipelineError::Configuration(format!("{label}: {e}")))?;
        }

        Ok(config)
    }
}

/// Lifecycle state of a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Loading the checkpoint and starting the source
    Starting,
    /// Processing raw events
    Running,
    /// Closing the source, then the sink and checkpoint store
    Draining,
    /// Finished
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// Requests a graceful shutdown of a running [`Pipeline`].
///
/// Cheap to clone; every clone controls the same pipeline.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests draining.
    ///
    /// Returns `true` for the call that initiated shutdown and `false` for
    /// every later call, which has no effect.
    pub fn shutdown(&self) -> bool {
        self.tx.send_if_modified(|requested| {
            if *requested {
                false
            } else {
                *requested = true;
                true
            }
        })
    }

    /// Returns true once shutdown was requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Summary of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    /// Raw events received from the source
    pub raw_events: u64,
    /// Change events appended to the sink
    pub events_appended: u64,
    /// Raw events, or single rows of a batch, dropped by normalization
    pub events_dropped: u64,
    /// Checkpoints persisted
    pub checkpoints_persisted: u64,
    /// Retry attempts across all stages
    pub retries: u64,
    /// Whether the pipeline ended in a degraded state
    pub degraded: bool,
    /// Last checkpoint successfully persisted, or loaded at startup
    pub last_checkpoint: Option<CheckpointToken>,
}

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The source failed permanently
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// The source could not be re-established
    #[error("Source unavailable after {attempts} attempts: {source}")]
    SourceUnavailable {
        /// Consecutive failed attempts
        attempts: u32,
        /// The last error
        #[source]
        source: SourceError,
    },

    /// An append failed and the sink failure policy is `Fail`, or the error
    /// cannot be retried
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// The checkpoint could not be loaded at startup
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Invalid pipeline configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

enum Processed {
    Done,
    Interrupted,
}

enum Appended {
    Entry(EntryId),
    Interrupted,
}

/// Drives one source into one sink with checkpointing.
pub struct Pipeline<S, K, C>
where
    S: Source,
    K: StreamSink,
    C: CheckpointStore,
{
    config: PipelineConfig,
    source: S,
    normalizer: Normalizer,
    sink: K,
    checkpoints: C,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<PipelineState>,
    report: PipelineReport,
    sink_degraded: bool,
    checkpoint_degraded: bool,
}

impl<S, K, C> Pipeline<S, K, C>
where
    S: Source,
    K: StreamSink,
    C: CheckpointStore,
{
    /// Assembles a pipeline. Nothing runs until [`run`](Self::run).
    pub fn new(config: PipelineConfig, source: S, normalizer: Normalizer, sink: K, checkpoints: C) -> Self {
        let shutdown = ShutdownHandle::new();
        let shutdown_rx = shutdown.subscribe();
        let (state_tx, _) = watch::channel(PipelineState::Starting);

        Self {
            config,
            source,
            normalizer,
            sink,
            checkpoints,
            shutdown,
            shutdown_rx,
            state_tx,
            report: PipelineReport::default(),
            sink_degraded: false,
            checkpoint_degraded: false,
        }
    }

    /// Handle for requesting a graceful shutdown.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Receiver tracking the lifecycle state.
    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    /// Runs until the source ends, shutdown is requested, or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns an error for a checkpoint that cannot be loaded, a source that
    /// fails permanently or cannot be re-established, and a sink failure under
    /// [`SinkFailurePolicy::Fail`]. Draining has completed when it returns.
    #[instrument(skip(self), fields(pipeline = %self.config.name, source = %self.source.kind()))]
    pub async fn run(mut self) -> Result<PipelineReport, PipelineError> {
        self.set_state(PipelineState::Starting);

        let fatal = match self.start_up().await {
            Ok(()) => {
                self.set_state(PipelineState::Running);
                metrics::set_pipeline_status(PipelineStatus::Running);
                info!("Pipeline running");
                self.event_loop().await.err()
            }
            Err(e) => Some(e),
        };

        self.drain().await;

        if let Some(e) = fatal {
            error!(error = %e, "Pipeline stopped on fatal error");
            metrics::set_pipeline_status(PipelineStatus::Error);
            return Err(e);
        }

        metrics::set_pipeline_status(PipelineStatus::Stopped);
        Ok(self.report)
    }

    async fn start_up(&mut self) -> Result<(), PipelineError> {
        let resume_from = self.load_checkpoint().await?;
        match &resume_from {
            Some(token) => info!(checkpoint = %token, "Resuming from checkpoint"),
            None => info!("No checkpoint found, starting fresh"),
        }
        self.report.last_checkpoint = resume_from.clone();

        let mut failures: u32 = 0;
        loop {
            match self.source.start(resume_from.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures > self.config.source_retry.max_retries {
                        return Err(PipelineError::SourceUnavailable {
                            attempts: failures,
                            source: e,
                        });
                    }
                    let delay = self.config.source_retry.delay_for(failures);
                    warn!(attempt = failures, delay_ms = delay.as_millis(), error = %e, "Source failed to start, retrying");
                    self.count_retry(RetryStage::Source, ErrorCategory::from(&e));
                    if self.sleep_or_shutdown(delay).await {
                        // Nothing was started; draining closes whatever is half-open.
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn load_checkpoint(&mut self) -> Result<Option<CheckpointToken>, PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            match self.checkpoints.load().await {
                Ok(token) => return Ok(token),
                Err(e) if e.is_retryable() && self.config.checkpoint_retry.allows(attempt) => {
                    attempt += 1;
                    let delay = self.config.checkpoint_retry.delay_for(attempt);
                    warn!(attempt, delay_ms = delay.as_millis(), error = %e, "Checkpoint load failed, retrying");
                    self.count_retry(RetryStage::Checkpoint, ErrorCategory::from(&e));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::increment_checkpoint_errors(ErrorCategory::from(&e));
                    return Err(e.into());
                }
            }
        }
    }

    async fn event_loop(&mut self) -> Result<(), PipelineError> {
        let mut source_failures: u32 = 0;

        loop {
            let next = tokio::select! {
                biased;
                () = wait_for_shutdown(&mut self.shutdown_rx) => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                next = self.source.next_raw() => next,
            };

            match next {
                None => {
                    info!("Source reached end of stream");
                    return Ok(());
                }
                Some(Ok(raw)) => {
                    source_failures = 0;
                    self.report.raw_events += 1;
                    if let Processed::Interrupted = self.process(raw).await? {
                        return Ok(());
                    }
                }
                Some(Err(e)) => {
                    metrics::increment_source_errors(self.source.kind().as_str(), ErrorCategory::from(&e));
                    if !e.is_retryable() {
                        error!(error = %e, "Permanent source error");
                        return Err(PipelineError::Source(e));
                    }
                    if !self.recover_source(e, &mut source_failures).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Restarts the source from the last checkpoint after transient errors.
    ///
    /// Returns `Ok(false)` if shutdown was requested while waiting.
    async fn recover_source(&mut self, mut error: SourceError, failures: &mut u32) -> Result<bool, PipelineError> {
        loop {
            *failures += 1;
            if *failures > self.config.source_retry.max_retries {
                error!(attempts = *failures, error = %error, "Source could not be re-established");
                return Err(PipelineError::SourceUnavailable {
                    attempts: *failures,
                    source: error,
                });
            }

            let delay = self.config.source_retry.delay_for(*failures);
            warn!(
                attempt = *failures,
                delay_ms = delay.as_millis(),
                error = %error,
                "Transient source error, restarting source"
            );
            self.count_retry(RetryStage::Source, ErrorCategory::from(&error));

            if self.sleep_or_shutdown(delay).await {
                return Ok(false);
            }

            match self.source.restart(self.report.last_checkpoint.clone()).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_retryable() => error = e,
                Err(e) => return Err(PipelineError::Source(e)),
            }
        }
    }

    /// Normalizes, appends and checkpoints one raw event.
    async fn process(&mut self, raw: RawEvent) -> Result<Processed, PipelineError> {
        let position = raw.position();
        let table = raw.namespace().map(ToString::to_string).unwrap_or_default();

        let events = match self.normalizer.normalize(raw) {
            Ok(normalized) => {
                for e in &normalized.rejected {
                    warn!(table = %table, error = %e, "Dropping row that could not be normalized");
                    metrics::increment_events_dropped(&table, ErrorCategory::Validation);
                    self.report.events_dropped += 1;
                }
                normalized.events
            }
            Err(e) => {
                warn!(table = %table, error = %e, "Dropping raw event that could not be normalized");
                metrics::increment_events_dropped(&table, ErrorCategory::Validation);
                self.report.events_dropped += 1;
                Vec::new()
            }
        };

        for event in &events {
            match self.append(event).await? {
                Appended::Entry(entry_id) => {
                    info!(
                        table = %event.namespace,
                        key = %event.key,
                        operation = %event.operation(),
                        entry_id = %entry_id,
                        "Change appended"
                    );
                    metrics::increment_events_appended(&event.namespace.full_name(), event.operation().as_str());
                    if let Some(source_time) = event.source_time {
                        let lag = (Utc::now() - source_time).num_milliseconds().max(0) as f64 / 1000.0;
                        metrics::record_source_lag(lag, &event.namespace.full_name());
                    }
                    self.report.events_appended += 1;
                }
                Appended::Interrupted => {
                    warn!(
                        table = %event.namespace,
                        key = %event.key,
                        "Shutdown while the sink was failing; event will be re-delivered after restart"
                    );
                    return Ok(Processed::Interrupted);
                }
            }
        }

        if let Some(token) = position {
            self.persist(token).await;
        }

        Ok(Processed::Done)
    }

    async fn append(&mut self, event: &ChangeEvent) -> Result<Appended, PipelineError> {
        let sink_type = self.sink.metadata().sink_type;
        let mut attempt: u32 = 0;

        loop {
            let result = {
                let _timer = Timer::new(sink_type.clone(), |duration, label| {
                    metrics::record_sink_append_duration(duration, label);
                });
                self.sink.append(event).await
            };

            let error = match result {
                Ok(entry_id) => {
                    if self.sink_degraded {
                        info!(table = %event.namespace, key = %event.key, "Sink recovered");
                        self.sink_degraded = false;
                        self.refresh_status();
                    }
                    return Ok(Appended::Entry(entry_id));
                }
                Err(e) => e,
            };

            let category = ErrorCategory::from(&error);
            metrics::increment_sink_errors(&sink_type, category);

            if !error.is_retryable() {
                error!(table = %event.namespace, key = %event.key, error = %error, "Non-retryable sink error");
                return Err(PipelineError::Sink(error));
            }

            attempt += 1;
            let exhausted = !self.config.sink_retry.allows(attempt - 1);

            if exhausted {
                if !self.sink_degraded {
                    error!(
                        table = %event.namespace,
                        key = %event.key,
                        attempts = attempt,
                        error = %error,
                        "Sink retries exhausted, pipeline degraded"
                    );
                    self.sink_degraded = true;
                    self.refresh_status();
                }

                if self.config.sink_failure_policy == SinkFailurePolicy::Fail {
                    return Err(PipelineError::Sink(error));
                }

                self.count_retry(RetryStage::Sink, category);
                if self.sleep_or_shutdown(self.config.sink_retry.max_delay).await {
                    return Ok(Appended::Interrupted);
                }
                continue;
            }

            let delay = self.config.sink_retry.delay_for(attempt);
            warn!(
                table = %event.namespace,
                key = %event.key,
                attempt,
                max_retries = self.config.sink_retry.max_retries,
                delay_ms = delay.as_millis(),
                error = %error,
                "Append failed, retrying"
            );
            self.count_retry(RetryStage::Sink, category);
            tokio::time::sleep(delay).await;
        }
    }

    async fn persist(&mut self, token: CheckpointToken) {
        let mut attempt: u32 = 0;

        loop {
            match self.checkpoints.persist(&token).await {
                Ok(()) => {
                    debug!(checkpoint = %token, "Checkpoint persisted");
                    metrics::increment_checkpoints_persisted();
                    self.report.checkpoints_persisted += 1;
                    self.report.last_checkpoint = Some(token);
                    if self.checkpoint_degraded {
                        info!("Checkpoint store recovered");
                        self.checkpoint_degraded = false;
                        self.refresh_status();
                    }
                    return;
                }
                Err(e) => {
                    let category = ErrorCategory::from(&e);
                    metrics::increment_checkpoint_errors(category);

                    if e.is_retryable() && self.config.checkpoint_retry.allows(attempt) {
                        attempt += 1;
                        let delay = self.config.checkpoint_retry.delay_for(attempt);
                        warn!(attempt, delay_ms = delay.as_millis(), error = %e, "Checkpoint persist failed, retrying");
                        self.count_retry(RetryStage::Checkpoint, category);
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    error!(
                        checkpoint = %token,
                        attempts = attempt + 1,
                        error = %e,
                        "Checkpoint not persisted, pipeline degraded; a restart may re-deliver events"
                    );
                    self.checkpoint_degraded = true;
                    self.refresh_status();
                    return;
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn drain(&mut self) {
        self.set_state(PipelineState::Draining);
        info!("Draining pipeline");

        // The source goes first so nothing is produced once checkpointing stops.
        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Error closing source");
        }
        if let Err(e) = self.sink.close().await {
            warn!(error = %e, "Error closing sink");
        }
        if let Err(e) = self.checkpoints.close().await {
            warn!(error = %e, "Error closing checkpoint store");
        }

        self.report.degraded = self.sink_degraded || self.checkpoint_degraded;
        self.set_state(PipelineState::Stopped);

        info!(
            raw_events = self.report.raw_events,
            events_appended = self.report.events_appended,
            events_dropped = self.report.events_dropped,
            checkpoints_persisted = self.report.checkpoints_persisted,
            retries = self.report.retries,
            degraded = self.report.degraded,
            "Pipeline stopped"
        );
    }

    /// Sleeps for `delay`. Returns true if shutdown was requested first.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            () = wait_for_shutdown(&mut self.shutdown_rx) => true,
            () = tokio::time::sleep(delay) => false,
        }
    }

    fn count_retry(&mut self, stage: RetryStage, category: ErrorCategory) {
        self.report.retries += 1;
        metrics::increment_retries(stage, category);
    }

    fn refresh_status(&self) {
        let status = if self.sink_degraded || self.checkpoint_degraded {
            PipelineStatus::Degraded
        } else {
            PipelineStatus::Running
        };
        metrics::set_pipeline_status(status);
    }

    fn set_state(&self, state: PipelineState) {
        debug!(state = %state, "Pipeline state changed");
        self.state_tx.send_replace(state);
    }
}

impl<S, K, C> fmt::Debug for Pipeline<S, K, C>
where
    S: Source,
    K: StreamSink,
    C: CheckpointStore,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("state", &*self.state_tx.borrow())
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
