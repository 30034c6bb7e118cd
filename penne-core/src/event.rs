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

//! Canonical change events.
//!
//! Every source, whether it tails a replication log, follows a native change
//! feed or diffs successive table reads, is normalized into [`ChangeEvent`].
//! This is the only type the sink ever sees.
//!
//! The before/after images are carried by [`RowChange`], so an insert can only
//! hold an `after` row, a delete only a `before` row, and an update always
//! holds both whole rows.
//!
//! # Example
//!
//! ```rust
//! use penne_core::event::{ChangeEvent, Namespace, OperationType, RowChange};
//! use penne_core::key::LogicalKey;
//! use bson::doc;
//! use chrono::Utc;
//!
//! let event = ChangeEvent::new(
//!     Namespace::new("cloth_store", "shirts"),
//!     LogicalKey::new("1"),
//!     RowChange::Update {
//!         before: doc! { "id": 1, "name": "A" },
//!         after: doc! { "id": 1, "name": "B" },
//!     },
//!     Utc::now(),
//! );
//!
//! assert_eq!(event.operation(), OperationType::Update);
//! assert_eq!(event.before().unwrap().get_str("name").unwrap(), "A");
//! assert_eq!(event.after().unwrap().get_str("name").unwrap(), "B");
//! ```

use crate::checkpoint::CheckpointToken;
use crate::key::{canonicalize_document, LogicalKey};
use bson::{doc, Bson, Document};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A row image. Field order is preserved as read from the source.
pub type Row = Document;

/// Name of the single field that carries an encoded event in a stream entry.
pub const CHANGE_FIELD: &str = "change";

/// Row-level operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A row was inserted
    Insert,

    /// A row was modified; both images are whole rows
    Update,

    /// A row was removed
    Delete,
}

impl OperationType {
    /// Returns the lowercase wire name (`insert`, `update`, `delete`).
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source namespace: schema and table for relational sources, database and
/// collection for document stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    /// Database or schema name
    pub database: String,

    /// Table or collection name
    pub table: String,
}

impl Namespace {
    /// Creates a namespace from database and table names.
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }

    /// Returns the fully qualified name as "database.table".
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Before/after images of a single row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum RowChange {
    /// New row
    Insert {
        /// Row after the insert
        after: Row,
    },

    /// Modified row
    Update {
        /// Whole row before the change
        before: Row,
        /// Whole row after the change
        after: Row,
    },

    /// Removed row
    Delete {
        /// Last known row
        before: Row,
    },
}

impl RowChange {
    /// Operation kind of this change.
    #[inline]
    pub fn operation(&self) -> OperationType {
        match self {
            Self::Insert { .. } => OperationType::Insert,
            Self::Update { .. } => OperationType::Update,
            Self::Delete { .. } => OperationType::Delete,
        }
    }

    /// Row image before the change, absent for inserts.
    pub fn before(&self) -> Option<&Row> {
        match self {
            Self::Insert { .. } => None,
            Self::Update { before, .. } | Self::Delete { before } => Some(before),
        }
    }

    /// Row image after the change, absent for deletes.
    pub fn after(&self) -> Option<&Row> {
        match self {
            Self::Insert { after } | Self::Update { after, .. } => Some(after),
            Self::Delete { .. } => None,
        }
    }
}

/// A canonical, source-independent change event.
///
/// Transient: produced and consumed within one pipeline iteration and never
/// persisted anywhere except the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Where the change happened
    pub namespace: Namespace,

    /// Logical key of the changed row
    pub key: LogicalKey,

    /// Row images
    pub change: RowChange,

    /// Emission time, authoritative for ordering within the pipeline
    pub timestamp: DateTime<Utc>,

    /// Commit time reported by the source, advisory only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_time: Option<DateTime<Utc>>,

    /// Source position this event was read at, if the source has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<CheckpointToken>,
}

impl ChangeEvent {
    /// Creates an event without source time or position.
    pub fn new(
        namespace: Namespace,
        key: LogicalKey,
        change: RowChange,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            namespace,
            key,
            change,
            timestamp,
            source_time: None,
            position: None,
        }
    }

    /// Sets the source commit time.
    #[must_use]
    pub fn with_source_time(mut self, source_time: Option<DateTime<Utc>>) -> Self {
        self.source_time = source_time;
        self
    }

    /// Sets the source position.
    #[must_use]
    pub fn with_position(mut self, position: Option<CheckpointToken>) -> Self {
        self.position = position;
        self
    }

    /// Operation kind.
    #[inline]
    pub fn operation(&self) -> OperationType {
        self.change.operation()
    }

    /// Row image before the change.
    #[inline]
    pub fn before(&self) -> Option<&Row> {
        self.change.before()
    }

    /// Row image after the change.
    #[inline]
    pub fn after(&self) -> Option<&Row> {
        self.change.after()
    }

    /// Builds the document delivered to the stream.
    ///
    /// ```text
    /// { db, table, eventName, key, row, timestamp, sourceTimestamp?, position? }
    /// ```
    ///
    /// `row` is the single row for inserts and deletes and `{before, after}`
    /// for updates. Timestamps are ISO-8601 UTC with millisecond precision.
    pub fn to_wire_document(&self) -> Document {
        let row = match &self.change {
            RowChange::Insert { after } => Bson::Document(after.clone()),
            RowChange::Delete { before } => Bson::Document(before.clone()),
            RowChange::Update { before, after } => Bson::Document(doc! {
                "before": before.clone(),
                "after": after.clone(),
            }),
        };

        let mut wire = doc! {
            "db": self.namespace.database.as_str(),
            "table": self.namespace.table.as_str(),
            "eventName": self.operation().as_str(),
            "key": self.key.as_str(),
            "row": row,
            "timestamp": format_timestamp(&self.timestamp),
        };

        if let Some(source_time) = &self.source_time {
            wire.insert("sourceTimestamp", format_timestamp(source_time));
        }
        if let Some(position) = &self.position {
            wire.insert("position", position.as_document().clone());
        }

        wire
    }

    /// Encodes the wire document as canonical Extended JSON.
    ///
    /// Every BSON type round-trips exactly through this encoding, including
    /// 64-bit integers, decimals, ObjectIds and date-times.
    pub fn to_extended_json(&self) -> String {
        Bson::Document(self.to_wire_document())
            .into_canonical_extjson()
            .to_string()
    }

    /// Field map handed to a stream sink: a single [`CHANGE_FIELD`] entry.
    pub fn to_stream_fields(&self) -> Vec<(String, String)> {
        vec![(CHANGE_FIELD.to_string(), self.to_extended_json())]
    }

    /// Canonical, field-order independent form of the row images.
    ///
    /// Consumers de-duplicating redelivered events can compare these.
    pub fn canonical_images(&self) -> (Option<Document>, Option<Document>) {
        (
            self.before().map(canonicalize_document),
            self.after().map(canonicalize_document),
        )
    }
}

/// Formats a timestamp as ISO-8601 UTC with millisecond precision.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
