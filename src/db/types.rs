//! Result types for the queried store.
//!
//! Rows are converted to JSON objects as they are scanned, so everything
//! downstream of a client deals only in `serde_json` values.

use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Number, Value};
use std::time::Duration;
use thiserror::Error;

/// One scanned row: column name to JSON-safe value, in column order.
pub type JsonRow = serde_json::Map<String, Value>;

/// Rows read from a statement, capped at the caller's limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowSet {
    /// Column names of the result, empty when no row was read.
    pub columns: Vec<String>,
    /// Converted rows, in the order the store returned them.
    pub rows: Vec<JsonRow>,
    /// True when reading stopped because the cap was reached.
    pub capped: bool,
}

impl RowSet {
    /// Creates an empty row set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows read.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns in the result.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if no rows were read.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Why a statement could not be run to completion.
///
/// These are recorded on the message, never raised past the pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// No connection could be obtained from the pool.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The deadline passed before the statement finished.
    #[error("query timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The store refused or failed the statement.
    #[error("query failed: {0}")]
    Execution(String),

    /// A column value could not be converted.
    #[error("failed to read column value: {0}")]
    Scan(String),

    /// The row stream broke after rows had started arriving.
    #[error("failed while reading rows: {0}")]
    RowIteration(String),

    /// Rows could not be serialized to JSON.
    #[error("failed to serialize results: {0}")]
    Serialization(String),
}

impl ExecutionError {
    /// Creates a scan error for the named column.
    pub fn scan(column: &str, cause: impl std::fmt::Display) -> Self {
        Self::Scan(format!("column '{column}': {cause}"))
    }
}

/// Converts a float, mapping NaN and infinities to null.
pub fn float_value(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Converts a decimal to a JSON number when it fits an `f64`, else a string.
pub fn decimal_value(value: Decimal) -> Value {
    if value.fract().is_zero() {
        if let Some(i) = value.to_i64() {
            return Value::from(i);
        }
    }
    value
        .to_f64()
        .and_then(Number::from_f64)
        .map_or_else(|| Value::String(value.to_string()), Value::Number)
}

/// Converts raw bytes: valid UTF-8 becomes a string, anything else base64.
pub fn bytes_value(bytes: Vec<u8>) -> Value {
    match String::from_utf8(bytes) {
        Ok(text) => Value::String(text),
        Err(e) => Value::String(base64::engine::general_purpose::STANDARD.encode(e.into_bytes())),
    }
}

/// Formats a zoned timestamp as RFC 3339.
pub fn timestamp_value(value: DateTime<Utc>) -> Value {
    Value::String(value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Formats a zoneless timestamp as RFC 3339, taking it as UTC.
pub fn naive_timestamp_value(value: NaiveDateTime) -> Value {
    timestamp_value(value.and_utc())
}

/// Formats a date as midnight UTC.
pub fn date_value(value: NaiveDate) -> Value {
    naive_timestamp_value(value.and_time(chrono::NaiveTime::MIN))
}
