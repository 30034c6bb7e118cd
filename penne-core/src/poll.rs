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

//! Polling source: periodic full reads diffed against the last snapshot.
//!
//! Used for tables without a reachable change feed. Each cycle reads the
//! whole table, diffs it against the current [`Snapshot`] and queues the
//! resulting events in order. The next read happens `interval` after the
//! previous cycle's events were handed out.
//!
//! # Failure handling
//!
//! A failed read is returned as a [`SourceError`] and the snapshot is kept as
//! it was. The next cycle diffs against the same snapshot, so a transient read
//! failure never turns into spurious deletes.
//!
//! # Restarts
//!
//! Polling has no resumable position. A restarted source begins with an empty
//! snapshot and reports every row currently in the table as an insert. This
//! full resync is the recovery strategy; downstream consumers de-duplicate by
//! logical key.

use crate::checkpoint::CheckpointToken;
use crate::event::{Namespace, Row};
use crate::key::KeyStrategy;
use crate::metrics;
use crate::snapshot::{DiffEvent, Snapshot, SnapshotDiffer};
use crate::source::{RawEvent, Source, SourceError, SourceKind};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default delay between polling cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Full-read access to a table.
#[async_trait::async_trait]
pub trait TableReader: Send + Sync {
    /// Primary-key columns in ordinal order; empty when the table has none.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] if the catalog cannot be queried.
    async fn primary_key_columns(&self, namespace: &Namespace) -> Result<Vec<String>, SourceError>;

    /// Reads every row of the table, ordered by primary key when there is one.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`]; transient errors are retried next cycle.
    async fn read_all(&self, namespace: &Namespace) -> Result<Vec<Row>, SourceError>;

    /// Releases connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader cannot be closed cleanly.
    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Configuration for [`PollingSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct PollingConfig {
    /// Table to poll
    pub namespace: Namespace,

    /// Delay between cycles
    pub interval: Duration,

    /// Report rows present at startup as inserts (`true`) or take them as a
    /// silent baseline (`false`)
    pub emit_initial_snapshot: bool,

    /// Key strategy override; discovered from the catalog when `None`
    pub key_strategy: Option<KeyStrategy>,
}

impl PollingConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> PollingConfigBuilder {
        PollingConfigBuilder::default()
    }
}

/// Builder for [`PollingConfig`].
#[derive(Debug, Default)]
pub struct PollingConfigBuilder {
    database: Option<String>,
    table: Option<String>,
    interval: Option<Duration>,
    emit_initial_snapshot: Option<bool>,
    key_strategy: Option<KeyStrategy>,
}

impl PollingConfigBuilder {
    /// Sets the schema.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Sets the table.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Sets the delay between cycles.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Chooses whether rows present at startup are reported.
    #[must_use]
    pub fn emit_initial_snapshot(mut self, emit: bool) -> Self {
        self.emit_initial_snapshot = Some(emit);
        self
    }

    /// Overrides primary-key discovery.
    #[must_use]
    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = Some(strategy);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is missing or the interval is zero.
    pub fn build(self) -> Result<PollingConfig, String> {
        let database = self.database.ok_or("database is required")?;
        let table = self.table.ok_or("table is required")?;
        let interval = self.interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        if interval.is_zero() {
            return Err("interval must be greater than 0".to_string());
        }

        Ok(PollingConfig {
            namespace: Namespace::new(database, table),
            interval,
            emit_initial_snapshot: self.emit_initial_snapshot.unwrap_or(true),
            key_strategy: self.key_strategy,
        })
    }
}

/// [`Source`] that diffs successive full reads of one table.
///
/// The source owns its snapshot exclusively and swaps it as a whole after
/// each successful read.
pub struct PollingSource<R: TableReader> {
    reader: R,
    config: PollingConfig,
    differ: Option<SnapshotDiffer>,
    snapshot: Snapshot,
    pending: VecDeque<DiffEvent>,
    cycles: u64,
    closed: bool,
}

impl<R: TableReader> PollingSource<R> {
    /// Creates a polling source. Nothing is read until [`Source::start`].
    pub fn new(reader: R, config: PollingConfig) -> Self {
        Self {
            reader,
            config,
            differ: None,
            snapshot: Snapshot::empty(),
            pending: VecDeque::new(),
            cycles: 0,
            closed: false,
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Completed read attempts, successful or not.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Reads the table once and queues the resulting events.
    async fn poll_once(&mut self) -> Result<(), SourceError> {
        let Some(differ) = self.differ.as_ref() else {
            return Err(SourceError::permanent_msg("polling source not started"));
        };
        let table = self.config.namespace.full_name();

        self.cycles += 1;
        let rows = self.reader.read_all(&self.config.namespace).await?;

        let diff = differ.diff(&self.snapshot, rows);
        debug!(
            table = %table,
            cycle = self.cycles,
            rows = diff.snapshot.len(),
            changes = diff.events.len(),
            "Polled table"
        );

        self.pending.extend(diff.events);
        self.snapshot = diff.snapshot;
        metrics::set_snapshot_rows(self.snapshot.len(), &table);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<R: TableReader + 'static> Source for PollingSource<R> {
    async fn start(&mut self, resume_from: Option<CheckpointToken>) -> Result<(), SourceError> {
        if resume_from.is_some() {
            info!("Polling source has no resumable position, ignoring checkpoint and resyncing");
        }

        let strategy = match &self.config.key_strategy {
            Some(strategy) => strategy.clone(),
            None => KeyStrategy::from_columns(
                self.reader.primary_key_columns(&self.config.namespace).await?,
            ),
        };

        if strategy.is_whole_row() {
            warn!(
                table = %self.config.namespace,
                "Table has no primary key, rows are keyed by their whole content"
            );
        }
        info!(table = %self.config.namespace, key = %strategy, "Polling source starting");

        self.differ = Some(SnapshotDiffer::new(self.config.namespace.clone(), strategy));
        self.snapshot = Snapshot::empty();
        self.pending.clear();
        self.cycles = 0;
        self.closed = false;

        if !self.config.emit_initial_snapshot {
            self.poll_once().await?;
            let baseline = self.pending.len();
            self.pending.clear();
            info!(rows = baseline, "Initial table read taken as baseline");
        }

        Ok(())
    }

    async fn next_raw(&mut self) -> Option<Result<RawEvent, SourceError>> {
        loop {
            if self.closed {
                return None;
            }

            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(RawEvent::Diff(event)));
            }

            if self.cycles > 0 {
                tokio::time::sleep(self.config.interval).await;
            }

            if let Err(e) = self.poll_once().await {
                warn!(
                    table = %self.config.namespace,
                    error = %e,
                    "Table read failed, keeping previous snapshot"
                );
                return Some(Err(e));
            }
        }
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();
        self.reader.close().await
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Poll
    }
}
