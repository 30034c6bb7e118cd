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

//! Logical row keys and canonical row serialization.
//!
//! A [`LogicalKey`] identifies a row across successive reads of the same table.
//! It is derived once per table through a [`KeyStrategy`]:
//!
//! - **Primary key**: the primary-key column values in ordinal order, rendered
//!   as text and joined with [`KEY_DELIMITER`].
//! - **Whole row**: when the table has no primary key, the canonical
//!   serialization of the entire row.
//!
//! Canonical serialization sorts document keys recursively and renders the
//! result as canonical Extended JSON, so two rows with identical contents but
//! different field ordering produce identical output.
//!
//! # Example
//!
//! ```rust
//! use penne_core::key::{canonical_string, KeyStrategy};
//! use bson::doc;
//!
//! let strategy = KeyStrategy::from_columns(vec!["a".to_string(), "b".to_string()]);
//! let key = strategy.derive(&doc! { "a": 1, "b": 2, "c": "x" });
//! assert_eq!(key.as_str(), "1::2");
//!
//! assert_eq!(
//!     canonical_string(&doc! { "a": 2, "z": 1 }),
//!     canonical_string(&doc! { "z": 1, "a": 2 }),
//! );
//! ```

use bson::{Bson, Document};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator placed between primary-key components.
pub const KEY_DELIMITER: &str = "::";

/// Stable identifier of a row, used to correlate it across reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalKey(String);

impl LogicalKey {
    /// Wraps an already-rendered key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Builds a key from every field of a key document, in document order.
    ///
    /// Change feeds identify documents by a key document such as
    /// `{ "_id": ObjectId(..) }`; this renders it the same way a primary key
    /// would be rendered.
    #[must_use]
    pub fn from_key_document(key: &Document) -> Self {
        let parts: Vec<String> = key.values().map(render_component).collect();
        Self(parts.join(KEY_DELIMITER))
    }

    /// Returns the key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the key and returns the inner string.
    #[inline]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LogicalKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for LogicalKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How logical keys are derived for a table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyStrategy {
    /// Primary-key columns in ordinal order.
    PrimaryKey(Vec<String>),

    /// Canonical serialization of the whole row (table without primary key).
    #[default]
    WholeRow,
}

impl KeyStrategy {
    /// Chooses a strategy from discovered primary-key columns.
    ///
    /// An empty column list means the table has no primary key.
    #[must_use]
    pub fn from_columns(columns: Vec<String>) -> Self {
        if columns.is_empty() {
            Self::WholeRow
        } else {
            Self::PrimaryKey(columns)
        }
    }

    /// Returns true when keys are derived from the whole row.
    #[inline]
    pub fn is_whole_row(&self) -> bool {
        matches!(self, Self::WholeRow)
    }

    /// Derives the logical key of a row.
    ///
    /// A primary-key column missing from the row renders as `null`.
    #[must_use]
    pub fn derive(&self, row: &Document) -> LogicalKey {
        match self {
            Self::PrimaryKey(columns) => {
                let parts: Vec<String> = columns
                    .iter()
                    .map(|column| row.get(column).map_or_else(|| "null".to_string(), render_component))
                    .collect();
                LogicalKey(parts.join(KEY_DELIMITER))
            }
            Self::WholeRow => LogicalKey(canonical_string(row)),
        }
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrimaryKey(columns) => write!(f, "primary key ({})", columns.join(", ")),
            Self::WholeRow => f.write_str("whole row"),
        }
    }
}

/// Renders a single key component as text.
fn render_component(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(n) => n.to_string(),
        Bson::Boolean(b) => b.to_string(),
        Bson::Null | Bson::Undefined => "null".to_string(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::DateTime(dt) => DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
            .map_or_else(
                || dt.timestamp_millis().to_string(),
                |t| t.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        other => canonical_json(other),
    }
}

/// Returns a copy of `value` with every nested document's keys sorted.
///
/// Array element order is significant and preserved.
#[must_use]
pub fn canonicalize(value: &Bson) -> Bson {
    match value {
        Bson::Document(doc) => Bson::Document(canonicalize_document(doc)),
        Bson::Array(items) => Bson::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Returns a copy of `doc` with keys sorted recursively.
#[must_use]
pub fn canonicalize_document(doc: &Document) -> Document {
    let mut entries: Vec<(&String, &Bson)> = doc.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    entries
        .into_iter()
        .map(|(k, v)| (k.clone(), canonicalize(v)))
        .collect()
}

/// Canonical, field-order independent serialization of a row.
///
/// Used for whole-row keys and for the differ's equality comparison.
#[must_use]
pub fn canonical_string(row: &Document) -> String {
    Bson::Document(canonicalize_document(row))
        .into_canonical_extjson()
        .to_string()
}

fn canonical_json(value: &Bson) -> String {
    canonicalize(value).into_canonical_extjson().to_string()
}
