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

//! MySQL table reader for the polling source.
//!
//! Reads whole tables through a `mysql_async` connection pool using the
//! binary protocol, so values arrive typed and are converted to BSON once:
//!
//! | MySQL value | BSON |
//! |-------------|------|
//! | signed integer | Int64 |
//! | unsigned integer | Int64, or decimal string above `i64::MAX` |
//! | FLOAT / DOUBLE | Double |
//! | DECIMAL | exact decimal string |
//! | DATE / DATETIME / TIMESTAMP | UTC DateTime (zero dates become null) |
//! | DATETIME / TIMESTAMP with sub-millisecond digits | `YYYY-MM-DDTHH:MM:SS.ffffffZ` string |
//! | TIME | `[-]HH:MM:SS.ffffff` string |
//! | binary-charset bytes | generic Binary |
//! | other bytes | UTF-8 string, or Binary when not valid UTF-8 |
//!
//! BSON date-times hold milliseconds, so a value with a non-zero microsecond
//! remainder is kept as a string instead of being truncated.
//!
//! Primary keys are discovered through `information_schema` in ordinal order,
//! once per table; later reads reuse the cached columns.

use crate::event::{Namespace, Row};
use crate::poll::TableReader;
use crate::source::SourceError;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson};
use chrono::NaiveDate;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Opts, Pool, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Character set id MySQL reports for binary columns.
const BINARY_CHARSET: u16 = 63;

/// Server error codes that no retry can fix.
const PERMANENT_SERVER_CODES: &[u16] = &[
    1044, // database access denied
    1045, // access denied for user
    1049, // unknown database
    1142, // table command denied
    1146, // table does not exist
];

const PRIMARY_KEY_QUERY: &str = r"
    SELECT COLUMN_NAME
    FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
    WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
    ORDER BY ORDINAL_POSITION
";

/// [`TableReader`] backed by a MySQL connection pool.
#[derive(Debug, Clone)]
pub struct MySqlTableReader {
    pool: Pool,
    order_by: Option<Vec<String>>,
    primary_keys: Arc<Mutex<HashMap<Namespace, Vec<String>>>>,
}

impl MySqlTableReader {
    /// Connects to `url` and verifies the connection.
    ///
    /// # Errors
    ///
    /// Returns a permanent error for an invalid URL and a classified error if
    /// the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, SourceError> {
        let opts = Opts::from_url(url).map_err(SourceError::permanent)?;
        let pool = Pool::new(opts);

        let mut conn = pool.get_conn().await.map_err(classify)?;
        let _: Option<i64> = conn.query_first("SELECT 1").await.map_err(classify)?;
        drop(conn);

        info!("Connected to MySQL");
        Ok(Self::from_pool(pool))
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            order_by: None,
            primary_keys: Arc::default(),
        }
    }

    /// Orders full reads by these columns instead of the discovered primary key.
    #[must_use]
    pub fn with_order_by(mut self, columns: Vec<String>) -> Self {
        self.order_by = Some(columns);
        self
    }

    fn cached_primary_key(&self, namespace: &Namespace) -> Option<Vec<String>> {
        self.primary_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
    }

    async fn order_by_columns(&self, namespace: &Namespace) -> Result<Vec<String>, SourceError> {
        match &self.order_by {
            Some(columns) => Ok(columns.clone()),
            None => self.primary_key_columns(namespace).await,
        }
    }

    fn select_all(namespace: &Namespace, order_by: &[String]) -> String {
        let mut sql = format!(
            "SELECT * FROM {}.{}",
            quote_identifier(&namespace.database),
            quote_identifier(&namespace.table)
        );
        if !order_by.is_empty() {
            let columns: Vec<String> = order_by.iter().map(|c| quote_identifier(c)).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&columns.join(", "));
        }
        sql
    }
}

#[async_trait::async_trait]
impl TableReader for MySqlTableReader {
    async fn primary_key_columns(&self, namespace: &Namespace) -> Result<Vec<String>, SourceError> {
        if let Some(columns) = self.cached_primary_key(namespace) {
            return Ok(columns);
        }

        let mut conn = self.pool.get_conn().await.map_err(classify)?;
        let columns: Vec<String> = conn
            .exec(
                PRIMARY_KEY_QUERY,
                (namespace.database.as_str(), namespace.table.as_str()),
            )
            .await
            .map_err(classify)?;

        debug!(table = %namespace, columns = ?columns, "Discovered primary key");
        self.primary_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.clone(), columns.clone());
        Ok(columns)
    }

    async fn read_all(&self, namespace: &Namespace) -> Result<Vec<Row>, SourceError> {
        let sql = Self::select_all(namespace, &self.order_by_columns(namespace).await?);

        let mut conn = self.pool.get_conn().await.map_err(classify)?;
        let rows: Vec<mysql_async::Row> = conn.exec(sql, ()).await.map_err(classify)?;

        Ok(rows.iter().map(row_to_document).collect())
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.pool.clone().disconnect().await.map_err(classify)
    }
}

/// How a byte-valued column should be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BytesKind {
    Decimal,
    Binary,
    Text,
}

impl BytesKind {
    fn of(column: &mysql_async::Column) -> Self {
        match column.column_type() {
            ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => Self::Decimal,
            _ if column.character_set() == BINARY_CHARSET => Self::Binary,
            _ => Self::Text,
        }
    }
}

fn row_to_document(row: &mysql_async::Row) -> Row {
    row.columns_ref()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let value = row
                .as_ref(i)
                .map_or(Bson::Null, |value| value_to_bson(value, BytesKind::of(column)));
            (column.name_str().into_owned(), value)
        })
        .collect()
}

fn value_to_bson(value: &Value, bytes_kind: BytesKind) -> Bson {
    match value {
        Value::NULL => Bson::Null,
        Value::Int(n) => Bson::Int64(*n),
        Value::UInt(n) => i64::try_from(*n).map_or_else(|_| Bson::String(n.to_string()), Bson::Int64),
        Value::Float(n) => Bson::Double(f64::from(*n)),
        Value::Double(n) => Bson::Double(*n),
        Value::Bytes(bytes) => match bytes_kind {
            BytesKind::Binary => binary(bytes),
            BytesKind::Decimal | BytesKind::Text => match std::str::from_utf8(bytes) {
                Ok(text) => Bson::String(text.to_string()),
                Err(_) => binary(bytes),
            },
        },
        Value::Date(year, month, day, hour, minute, second, micros) => {
            NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day))
                .and_then(|date| {
                    date.and_hms_micro_opt(
                        u32::from(*hour),
                        u32::from(*minute),
                        u32::from(*second),
                        *micros,
                    )
                })
                .map_or(Bson::Null, |at| {
                    let at = at.and_utc();
                    if micros % 1000 == 0 {
                        Bson::DateTime(bson::DateTime::from_millis(at.timestamp_millis()))
                    } else {
                        Bson::String(at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
                    }
                })
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = u64::from(*days) * 24 + u64::from(*hours);
            Bson::String(format!(
                "{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
            ))
        }
    }
}

fn binary(bytes: &[u8]) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

fn quote_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

fn classify(err: mysql_async::Error) -> SourceError {
    match &err {
        mysql_async::Error::Server(server) if PERMANENT_SERVER_CODES.contains(&server.code) => {
            SourceError::permanent(err)
        }
        mysql_async::Error::Url(_) => SourceError::permanent(err),
        _ => SourceError::transient(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers() {
        assert_eq!(value_to_bson(&Value::Int(-5), BytesKind::Text), Bson::Int64(-5));
        assert_eq!(value_to_bson(&Value::UInt(7), BytesKind::Text), Bson::Int64(7));
        assert_eq!(
            value_to_bson(&Value::UInt(u64::MAX), BytesKind::Text),
            Bson::String(u64::MAX.to_string())
        );
    }

    #[test]
    fn test_floats() {
        assert_eq!(value_to_bson(&Value::Float(1.5), BytesKind::Text), Bson::Double(1.5));
        assert_eq!(value_to_bson(&Value::Double(2.25), BytesKind::Text), Bson::Double(2.25));
    }

    #[test]
    fn test_bytes_by_kind() {
        let text = Value::Bytes(b"12.50".to_vec());
        assert_eq!(value_to_bson(&text, BytesKind::Decimal), Bson::String("12.50".into()));
        assert_eq!(value_to_bson(&text, BytesKind::Text), Bson::String("12.50".into()));
        assert!(matches!(value_to_bson(&text, BytesKind::Binary), Bson::Binary(_)));

        let invalid = Value::Bytes(vec![0xff, 0xfe]);
        assert!(matches!(value_to_bson(&invalid, BytesKind::Text), Bson::Binary(_)));
    }

    #[test]
    fn test_dates() {
        let value = Value::Date(2024, 2, 29, 13, 45, 30, 250_000);
        let Bson::DateTime(at) = value_to_bson(&value, BytesKind::Text) else {
            panic!("expected a date-time");
        };
        assert_eq!(at.timestamp_millis(), 1_709_214_330_250);

        let zero = Value::Date(0, 0, 0, 0, 0, 0, 0);
        assert_eq!(value_to_bson(&zero, BytesKind::Text), Bson::Null);
    }

    #[test]
    fn test_sub_millisecond_datetimes_keep_full_precision() {
        let first = value_to_bson(&Value::Date(2024, 1, 1, 12, 0, 0, 123_456), BytesKind::Text);
        let second = value_to_bson(&Value::Date(2024, 1, 1, 12, 0, 0, 123_789), BytesKind::Text);

        assert_eq!(first, Bson::String("2024-01-01T12:00:00.123456Z".into()));
        assert_eq!(second, Bson::String("2024-01-01T12:00:00.123789Z".into()));
        assert_ne!(
            crate::key::canonical_string(&bson::doc! { "at": first }),
            crate::key::canonical_string(&bson::doc! { "at": second })
        );
    }

    #[tokio::test]
    async fn test_primary_key_is_cached_per_table() {
        // Nothing listens on port 1; any catalog query would fail.
        let pool = Pool::new(Opts::from_url("mysql://root@127.0.0.1:1/cloth_store").unwrap());
        let reader = MySqlTableReader::from_pool(pool);
        let shirts = Namespace::new("cloth_store", "shirts");
        reader
            .primary_keys
            .lock()
            .unwrap()
            .insert(shirts.clone(), vec!["id".to_string()]);

        assert_eq!(reader.order_by_columns(&shirts).await.unwrap(), vec!["id".to_string()]);
        assert_eq!(
            reader.clone().primary_key_columns(&shirts).await.unwrap(),
            vec!["id".to_string()]
        );
        assert!(reader
            .order_by_columns(&Namespace::new("cloth_store", "pants"))
            .await
            .is_err());
    }

    #[test]
    fn test_time() {
        let value = Value::Time(true, 1, 2, 3, 4, 5);
        assert_eq!(
            value_to_bson(&value, BytesKind::Text),
            Bson::String("-26:03:04.000005".into())
        );
    }

    #[test]
    fn test_select_all_quotes_identifiers() {
        let sql = MySqlTableReader::select_all(
            &Namespace::new("cloth_store", "odd`name"),
            &["id".to_string(), "sku".to_string()],
        );
        assert_eq!(sql, "SELECT * FROM `cloth_store`.`odd``name` ORDER BY `id`, `sku`");

        let unordered = MySqlTableReader::select_all(&Namespace::new("db", "t"), &[]);
        assert_eq!(unordered, "SELECT * FROM `db`.`t`");
    }
}
