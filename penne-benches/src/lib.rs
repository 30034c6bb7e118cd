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
//! Fixture tables shared by the Penne benchmarks.

use bson::{doc, Document};

/// One row of the benchmark `shirts` table.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn shirt(id: usize, price: f64) -> Document {
    let colors = ["red", "blue", "green", "black"];
    doc! {
        "id": id as i64,
        "color": colors[id % colors.len()],
        "size": if id % 2 == 0 { "M" } else { "L" },
        "price": price,
        "stock": { "warehouse": "north", "count": (id % 50) as i32 },
    }
}

/// A table of `rows` shirts with ids `0..rows`.
#[must_use]
pub fn table(rows: usize) -> Vec<Document> {
    (0..rows).map(|i| shirt(i, 19.5)).collect()
}

/// [`table`] with every tenth price changed, row 0 deleted and row `rows` added.
#[must_use]
pub fn mutated_table(rows: usize) -> Vec<Document> {
    let mut out: Vec<Document> = (1..rows)
        .map(|i| shirt(i, if i % 10 == 0 { 24.0 } else { 19.5 }))
        .collect();
    out.push(shirt(rows, 9.0));
    out
}
