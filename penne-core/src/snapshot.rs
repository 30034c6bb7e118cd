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

//! Snapshot differ for sources without a native change feed.
//!
//! Each polling cycle reads the full table and compares it with the previous
//! [`Snapshot`]:
//!
//! 1. Keys only in the new read become inserts.
//! 2. Keys in both reads become updates when their canonical serializations
//!    differ, and produce nothing otherwise.
//! 3. Keys only in the previous snapshot become deletes carrying the last
//!    known row.
//!
//! Inserts and updates are emitted in the order of the new read, deletes
//! afterwards in the order of the previous snapshot. Renames are not
//! detected: rewriting a table with new identifiers yields a delete for every
//! old key and an insert for every new one.
//!
//! The previous snapshot is never modified. [`SnapshotDiffer::diff`] returns a
//! fresh snapshot that the caller swaps in as a whole once the cycle's events
//! have been handed off.

use crate::event::{Namespace, Row, RowChange};
use crate::key::{canonical_string, KeyStrategy, LogicalKey};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone)]
struct SnapshotEntry {
    row: Row,
    canonical: String,
}

/// Last known state of a table: logical key to row, in read order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    order: Vec<LogicalKey>,
    entries: HashMap<LogicalKey, SnapshotEntry>,
}

impl Snapshot {
    /// An empty snapshot, the starting point before the first read.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a snapshot from a full read.
    ///
    /// When two rows share a logical key the first position is kept and the
    /// later row wins, matching map-insertion semantics.
    pub fn from_rows(strategy: &KeyStrategy, rows: Vec<Row>) -> Self {
        let mut snapshot = Self {
            order: Vec::with_capacity(rows.len()),
            entries: HashMap::with_capacity(rows.len()),
        };

        for row in rows {
            let key = strategy.derive(&row);
            let entry = SnapshotEntry {
                canonical: canonical_string(&row),
                row,
            };
            if snapshot.entries.insert(key.clone(), entry).is_some() {
                warn!(key = %key, "Duplicate logical key in table read, keeping last row");
            } else {
                snapshot.order.push(key);
            }
        }

        snapshot
    }

    /// Number of rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true when the snapshot holds no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Looks up a row by logical key.
    pub fn get(&self, key: &LogicalKey) -> Option<&Row> {
        self.entries.get(key).map(|entry| &entry.row)
    }

    /// Returns true if the key is present.
    pub fn contains(&self, key: &LogicalKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterates rows in read order.
    pub fn iter(&self) -> impl Iterator<Item = (&LogicalKey, &Row)> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key).map(|entry| (key, &entry.row)))
    }

    fn canonical(&self, key: &LogicalKey) -> Option<&str> {
        self.entries.get(key).map(|entry| entry.canonical.as_str())
    }
}

/// A change inferred by the differ.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEvent {
    /// Table the change belongs to
    pub namespace: Namespace,

    /// Logical key of the row
    pub key: LogicalKey,

    /// Inferred before/after images
    pub change: RowChange,
}

/// Output of one diff cycle.
#[derive(Debug, Clone)]
pub struct SnapshotDiff {
    /// Events in emission order
    pub events: Vec<DiffEvent>,

    /// Snapshot built from the current read, replaces the previous one
    pub snapshot: Snapshot,
}

impl SnapshotDiff {
    /// Returns true when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Computes changes between successive full reads of one table.
#[derive(Debug, Clone)]
pub struct SnapshotDiffer {
    namespace: Namespace,
    strategy: KeyStrategy,
}

impl SnapshotDiffer {
    /// Creates a differ for a table with a fixed key strategy.
    pub fn new(namespace: Namespace, strategy: KeyStrategy) -> Self {
        Self { namespace, strategy }
    }

    /// The table this differ watches.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Key strategy chosen for the table.
    pub fn strategy(&self) -> &KeyStrategy {
        &self.strategy
    }

    /// Builds a snapshot without comparing it against anything.
    pub fn baseline(&self, rows: Vec<Row>) -> Snapshot {
        Snapshot::from_rows(&self.strategy, rows)
    }

    /// Diffs the current read against the previous snapshot.
    pub fn diff(&self, previous: &Snapshot, rows: Vec<Row>) -> SnapshotDiff {
        let current = Snapshot::from_rows(&self.strategy, rows);
        let mut events = Vec::new();

        for (key, row) in current.iter() {
            match previous.canonical(key) {
                None => events.push(self.event(key, RowChange::Insert { after: row.clone() })),
                Some(old) if current.canonical(key) != Some(old) => {
                    if let Some(before) = previous.get(key) {
                        events.push(self.event(
                            key,
                            RowChange::Update {
                                before: before.clone(),
                                after: row.clone(),
                            },
                        ));
                    }
                }
                Some(_) => {}
            }
        }

        for (key, row) in previous.iter() {
            if !current.contains(key) {
                events.push(self.event(key, RowChange::Delete { before: row.clone() }));
            }
        }

        SnapshotDiff {
            events,
            snapshot: current,
        }
    }

    fn event(&self, key: &LogicalKey, change: RowChange) -> DiffEvent {
        DiffEvent {
            namespace: self.namespace.clone(),
            key: key.clone(),
            change,
        }
    }
}
