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

//! Property tests for keys, canonical serialization and the snapshot differ.

use bson::{doc, Bson, Document};
use penne_core::event::{Namespace, OperationType};
use penne_core::key::{canonical_string, KeyStrategy};
use penne_core::snapshot::{Snapshot, SnapshotDiffer};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

fn value() -> impl Strategy<Value = Bson> {
    prop_oneof![
        any::<i64>().prop_map(Bson::Int64),
        any::<i32>().prop_map(Bson::Int32),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Bson::String),
        any::<bool>().prop_map(Bson::Boolean),
        Just(Bson::Null),
        (-1.0e6..1.0e6f64).prop_map(Bson::Double),
    ]
}

fn fields() -> impl Strategy<Value = Vec<(String, Bson)>> {
    prop::collection::btree_map("[a-z]{1,6}", value(), 0..8)
        .prop_map(|m| m.into_iter().collect::<Vec<_>>())
}

fn document(fields: &[(String, Bson)]) -> Document {
    fields.iter().cloned().collect()
}

fn table(ids: &BTreeSet<u16>, version: &str) -> Vec<Document> {
    ids.iter()
        .map(|id| doc! { "id": i64::from(*id), "name": format!("{version}-{id}") })
        .collect()
}

fn differ() -> SnapshotDiffer {
    SnapshotDiffer::new(
        Namespace::new("cloth_store", "shirts"),
        KeyStrategy::from_columns(vec!["id".to_string()]),
    )
}

proptest! {
    #[test]
    fn canonical_string_ignores_field_order(
        (original, shuffled) in fields().prop_flat_map(|f| (Just(f.clone()), Just(f).prop_shuffle()))
    ) {
        prop_assert_eq!(canonical_string(&document(&original)), canonical_string(&document(&shuffled)));
    }

    #[test]
    fn whole_row_key_ignores_field_order(fields in fields()) {
        let mut reversed = fields.clone();
        reversed.reverse();
        let strategy = KeyStrategy::WholeRow;
        prop_assert_eq!(strategy.derive(&document(&fields)), strategy.derive(&document(&reversed)));
    }

    #[test]
    fn nested_documents_ignore_field_order(inner in fields(), outer in fields()) {
        let mut a = document(&outer);
        a.insert("_nested", document(&inner));

        let mut b = Document::new();
        b.insert("_nested", inner.iter().rev().cloned().collect::<Document>());
        for (k, v) in outer.iter().rev() {
            b.insert(k.clone(), v.clone());
        }

        prop_assert_eq!(canonical_string(&a), canonical_string(&b));
    }

    #[test]
    fn unchanged_rows_emit_nothing(ids in prop::collection::btree_set(any::<u16>(), 0..40)) {
        let differ = differ();
        let previous = differ.baseline(table(&ids, "v1"));

        let mut reread = table(&ids, "v1");
        reread.reverse();
        let diff = differ.diff(&previous, reread);

        prop_assert!(diff.events.is_empty());
        prop_assert_eq!(diff.snapshot.len(), ids.len());
    }

    #[test]
    fn removed_keys_emit_one_delete_with_last_row(
        before in prop::collection::btree_set(any::<u16>(), 0..40),
        after in prop::collection::btree_set(any::<u16>(), 0..40),
    ) {
        let differ = differ();
        let previous = differ.baseline(table(&before, "v1"));
        let diff = differ.diff(&previous, table(&after, "v1"));

        let mut deletes: BTreeMap<String, Document> = BTreeMap::new();
        for event in &diff.events {
            if event.change.operation() == OperationType::Delete {
                let replaced = deletes.insert(
                    event.key.as_str().to_string(),
                    event.change.before().cloned().unwrap(),
                );
                prop_assert!(replaced.is_none());
            }
        }

        let removed: BTreeSet<String> = before.difference(&after).map(ToString::to_string).collect();
        prop_assert_eq!(deletes.keys().cloned().collect::<BTreeSet<_>>(), removed);
        for (key, row) in &deletes {
            prop_assert_eq!(row.get_i64("id").unwrap().to_string(), key.clone());
        }

        // Deletes come after every insert and update of the cycle.
        let first_delete = diff.events.iter().position(|e| e.change.operation() == OperationType::Delete);
        if let Some(index) = first_delete {
            prop_assert!(diff.events[index..]
                .iter()
                .all(|e| e.change.operation() == OperationType::Delete));
        }
    }

    #[test]
    fn every_change_is_reported_exactly_once(
        before in prop::collection::btree_set(0u16..64, 0..32),
        after in prop::collection::btree_set(0u16..64, 0..32),
        changed in prop::collection::btree_set(0u16..64, 0..32),
    ) {
        let differ = differ();
        let previous = differ.baseline(table(&before, "v1"));

        let current: Vec<Document> = after
            .iter()
            .map(|id| {
                let version = if changed.contains(id) { "v2" } else { "v1" };
                doc! { "id": i64::from(*id), "name": format!("{version}-{id}") }
            })
            .collect();
        let diff = differ.diff(&previous, current);

        let expected_inserts = after.difference(&before).count();
        let expected_updates = after.intersection(&before).filter(|id| changed.contains(id)).count();
        let expected_deletes = before.difference(&after).count();

        let count = |op: OperationType| diff.events.iter().filter(|e| e.change.operation() == op).count();
        prop_assert_eq!(count(OperationType::Insert), expected_inserts);
        prop_assert_eq!(count(OperationType::Update), expected_updates);
        prop_assert_eq!(count(OperationType::Delete), expected_deletes);
        prop_assert_eq!(diff.snapshot.len(), after.len());
    }
}

#[test]
fn composite_primary_key_is_deterministic() {
    let strategy = KeyStrategy::from_columns(vec!["a".to_string(), "b".to_string()]);
    let key = strategy.derive(&doc! { "a": 1, "b": 2, "c": "x" });
    assert_eq!(key.as_str(), "1::2");
    assert_eq!(strategy.derive(&doc! { "c": "y", "b": 2, "a": 1 }), key);
}

#[test]
fn rows_without_primary_key_share_key_regardless_of_order() {
    let strategy = KeyStrategy::from_columns(vec![]);
    assert!(strategy.is_whole_row());
    assert_eq!(
        strategy.derive(&doc! { "a": 2, "z": 1 }),
        strategy.derive(&doc! { "z": 1, "a": 2 })
    );
}

#[test]
fn empty_previous_snapshot_reports_every_row_as_insert() {
    let diff = differ().diff(&Snapshot::empty(), vec![doc! { "id": 1 }, doc! { "id": 2 }]);
    assert!(diff
        .events
        .iter()
        .all(|e| e.change.operation() == OperationType::Insert));
    assert_eq!(diff.events.len(), 2);
}
