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

//! Event normalizer: raw source events to canonical [`ChangeEvent`]s.
//!
//! - A log-tail rows event becomes one event per row, all sharing the rows
//!   event's position and commit time. A row missing its image is rejected on
//!   its own; the other rows of the batch are kept.
//! - A change-feed document becomes exactly one event carrying its resume token.
//! - A differ event only gains its emission timestamp.
//!
//! The normalizer also enforces the table allow-list. Events for other tables
//! are dropped silently (an empty result), whatever the adapter delivered.

use crate::checkpoint::CheckpointToken;
use crate::event::{ChangeEvent, Namespace, Row, RowChange};
use crate::key::{KeyStrategy, LogicalKey};
use crate::source::{
    ChangeFeedEvent, ChangeFeedOperation, DiffEvent, RawEvent, RowImage, RowsEvent, RowsEventKind,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Allow-list of `(database, table)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TableFilter {
    /// Accept every namespace
    #[default]
    AllowAll,
    /// Accept only the listed namespaces
    Only(HashSet<Namespace>),
}

impl TableFilter {
    /// Filter accepting exactly the given namespaces.
    pub fn only(namespaces: impl IntoIterator<Item = Namespace>) -> Self {
        Self::Only(namespaces.into_iter().collect())
    }

    /// Filter accepting a single table.
    pub fn single(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self::only([Namespace::new(database, table)])
    }

    /// Returns true if events for `namespace` pass.
    pub fn allows(&self, namespace: &Namespace) -> bool {
        match self {
            Self::AllowAll => true,
            Self::Only(allowed) => allowed.contains(namespace),
        }
    }
}

/// A raw event that cannot be turned into canonical events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// Change-feed document without a namespace
    #[error("change event has no namespace")]
    MissingNamespace,

    /// Operation requires a row image the event does not carry
    #[error("{operation} event on {namespace} is missing its {image} image")]
    MissingImage {
        /// Table of the event
        namespace: Namespace,
        /// Operation name as delivered
        operation: String,
        /// `before` or `after`
        image: &'static str,
    },

    /// No way to identify the changed row
    #[error("event on {namespace} has no document key")]
    MissingKey {
        /// Table of the event
        namespace: Namespace,
    },

    /// Operation that is not a row-level insert, update or delete
    #[error("unsupported operation {operation:?} on {namespace}")]
    UnsupportedOperation {
        /// Table of the event
        namespace: Namespace,
        /// Operation name as delivered
        operation: String,
    },
}

/// Outcome of normalizing one raw event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    /// Canonical events in source order
    pub events: Vec<ChangeEvent>,

    /// Rows of a log-tail batch that were dropped
    pub rejected: Vec<NormalizeError>,
}

impl From<Vec<ChangeEvent>> for Normalized {
    fn from(events: Vec<ChangeEvent>) -> Self {
        Self {
            events,
            rejected: Vec::new(),
        }
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Converts raw events into canonical change events.
#[derive(Clone)]
pub struct Normalizer {
    filter: TableFilter,
    strategies: HashMap<Namespace, KeyStrategy>,
    default_strategy: KeyStrategy,
    clock: Clock,
}

impl fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Normalizer")
            .field("filter", &self.filter)
            .field("strategies", &self.strategies)
            .field("default_strategy", &self.default_strategy)
            .finish_non_exhaustive()
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(TableFilter::AllowAll)
    }
}

impl Normalizer {
    /// Creates a normalizer with the given allow-list and the system clock.
    pub fn new(filter: TableFilter) -> Self {
        Self {
            filter,
            strategies: HashMap::new(),
            default_strategy: KeyStrategy::WholeRow,
            clock: Arc::new(Utc::now),
        }
    }

    /// Registers the key strategy of a log-tail table.
    ///
    /// Tables without a registered strategy are keyed by whole row.
    #[must_use]
    pub fn with_key_strategy(mut self, namespace: Namespace, strategy: KeyStrategy) -> Self {
        self.strategies.insert(namespace, strategy);
        self
    }

    /// Replaces the emission clock.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The allow-list in effect.
    pub fn filter(&self) -> &TableFilter {
        &self.filter
    }

    /// Normalizes one raw event.
    ///
    /// Returns an empty result for filtered-out tables. Rows of a log-tail
    /// batch are normalized independently: a malformed row is reported in
    /// [`Normalized::rejected`] and its siblings are still returned.
    ///
    /// # Errors
    ///
    /// Returns a [`NormalizeError`] when the raw event as a whole is malformed.
    /// The caller drops the raw event and continues.
    pub fn normalize(&self, raw: RawEvent) -> Result<Normalized, NormalizeError> {
        match raw {
            RawEvent::LogTail(rows) => self.normalize_rows(rows),
            RawEvent::ChangeFeed(change) => self.normalize_change_feed(change).map(Normalized::from),
            RawEvent::Diff(diff) => Ok(self.normalize_diff(diff).into()),
        }
    }

    fn normalize_rows(&self, mut event: RowsEvent) -> Result<Normalized, NormalizeError> {
        if !self.filter.allows(&event.namespace) {
            return Ok(Normalized::default());
        }

        if let RowsEventKind::Other(name) = &event.kind {
            return Err(NormalizeError::UnsupportedOperation {
                namespace: event.namespace.clone(),
                operation: name.clone(),
            });
        }

        let strategy = self
            .strategies
            .get(&event.namespace)
            .unwrap_or(&self.default_strategy);
        let timestamp = (self.clock)();

        let rows = std::mem::take(&mut event.rows);
        let mut normalized = Normalized {
            events: Vec::with_capacity(rows.len()),
            rejected: Vec::new(),
        };
        for image in rows {
            let change = match row_change(&event, image) {
                Ok(change) => change,
                Err(e) => {
                    normalized.rejected.push(e);
                    continue;
                }
            };

            let key = strategy.derive(identity_row(&change));
            normalized.events.push(
                ChangeEvent::new(event.namespace.clone(), key, change, timestamp)
                    .with_source_time(event.source_time)
                    .with_position(event.position.clone()),
            );
        }

        Ok(normalized)
    }

    fn normalize_change_feed(&self, event: ChangeFeedEvent) -> Result<Vec<ChangeEvent>, NormalizeError> {
        let namespace = event.namespace.ok_or(NormalizeError::MissingNamespace)?;
        if !self.filter.allows(&namespace) {
            return Ok(Vec::new());
        }

        let missing = |operation: &str, side: &'static str| NormalizeError::MissingImage {
            namespace: namespace.clone(),
            operation: operation.to_string(),
            image: side,
        };

        let change = match event.operation {
            ChangeFeedOperation::Insert => RowChange::Insert {
                after: event.full_document.ok_or_else(|| missing("insert", "after"))?,
            },
            ChangeFeedOperation::Update => RowChange::Update {
                before: event
                    .full_document_before_change
                    .ok_or_else(|| missing("update", "before"))?,
                after: event.full_document.ok_or_else(|| missing("update", "after"))?,
            },
            ChangeFeedOperation::Replace => RowChange::Update {
                before: event
                    .full_document_before_change
                    .ok_or_else(|| missing("replace", "before"))?,
                after: event.full_document.ok_or_else(|| missing("replace", "after"))?,
            },
            ChangeFeedOperation::Delete => RowChange::Delete {
                before: event
                    .full_document_before_change
                    .ok_or_else(|| missing("delete", "before"))?,
            },
            ChangeFeedOperation::Other(name) => {
                return Err(NormalizeError::UnsupportedOperation {
                    namespace: namespace.clone(),
                    operation: name,
                })
            }
        };

        let key = match &event.document_key {
            Some(document_key) if !document_key.is_empty() => LogicalKey::from_key_document(document_key),
            _ => match identity_row(&change).get("_id") {
                Some(id) => LogicalKey::from_key_document(&bson::doc! { "_id": id.clone() }),
                None => return Err(NormalizeError::MissingKey { namespace }),
            },
        };

        Ok(vec![ChangeEvent::new(namespace, key, change, (self.clock)())
            .with_source_time(event.cluster_time)
            .with_position(Some(CheckpointToken::resume_token(event.resume_token)))])
    }

    fn normalize_diff(&self, event: DiffEvent) -> Vec<ChangeEvent> {
        if !self.filter.allows(&event.namespace) {
            return Vec::new();
        }
        vec![ChangeEvent::new(event.namespace, event.key, event.change, (self.clock)())]
    }
}

/// Builds the change for one row image of a rows event.
fn row_change(event: &RowsEvent, image: RowImage) -> Result<RowChange, NormalizeError> {
    let missing = |side: &'static str| NormalizeError::MissingImage {
        namespace: event.namespace.clone(),
        operation: event.kind.to_string(),
        image: side,
    };

    match &event.kind {
        RowsEventKind::Write => Ok(RowChange::Insert {
            after: image.after.ok_or_else(|| missing("after"))?,
        }),
        RowsEventKind::Update => Ok(RowChange::Update {
            before: image.before.ok_or_else(|| missing("before"))?,
            after: image.after.ok_or_else(|| missing("after"))?,
        }),
        RowsEventKind::Delete => Ok(RowChange::Delete {
            before: image.before.ok_or_else(|| missing("before"))?,
        }),
        RowsEventKind::Other(name) => Err(NormalizeError::UnsupportedOperation {
            namespace: event.namespace.clone(),
            operation: name.clone(),
        }),
    }
}

/// Row that identifies the change: the new row, or the old one for deletes.
fn identity_row(change: &RowChange) -> &Row {
    match change {
        RowChange::Insert { after } | RowChange::Update { after, .. } => after,
        RowChange::Delete { before } => before,
    }
}
