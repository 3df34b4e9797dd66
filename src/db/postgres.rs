//! PostgreSQL database client implementation.
//!
//! Provides the `PostgresClient` struct that implements the `DatabaseClient` trait
//! for PostgreSQL databases using sqlx.

use crate::db::{
    bytes_value, date_value, decimal_value, float_value, naive_timestamp_value, timestamp_value,
    DatabaseBackend, DatabaseClient, ExecutionError, JsonRow, RowSet,
};
use crate::error::{ParleyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::types::{Oid, PgInterval, PgMoney, PgTimeTz};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Maximum pooled connections to the queried store.
const MAX_CONNECTIONS: u32 = 5;

/// How long to wait for a pooled connection.
const ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// PostgreSQL database client.
#[derive(Debug, Clone)]
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Creates a new PostgresClient from an existing connection pool.
    ///
    /// This is primarily useful for testing.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the database at `url`, retrying transient failures.
    pub async fn connect(url: &str) -> Result<Self> {
        let mut last_error = None;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            debug!("Connection attempt {} of {}", attempt, MAX_RETRY_ATTEMPTS);

            let result = PgPoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
                .connect(url)
                .await;

            match result {
                Ok(pool) => {
                    debug!("Successfully connected to database");
                    return Ok(Self { pool });
                }
                Err(e) => {
                    let is_transient = is_transient_error(&e);
                    last_error = Some(e);

                    if attempt < MAX_RETRY_ATTEMPTS && is_transient {
                        warn!(
                            "Connection attempt {} failed (transient error), retrying in {:?}",
                            attempt, delay
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(match last_error {
            Some(e) => map_connection_error(e, url),
            None => ParleyError::connection("No connection attempt was made"),
        })
    }
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Postgres
    }

    async fn fetch_rows(
        &self,
        sql: &str,
        max_rows: usize,
    ) -> std::result::Result<RowSet, ExecutionError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| ExecutionError::Connection(e.to_string()))?;
        read_rows(&mut *conn, sql, max_rows, None).await
    }

    /// Runs the statement inside a transaction with `statement_timeout` set,
    /// so the server cancels it when the budget runs out even if the caller
    /// has already stopped waiting.
    async fn fetch_rows_within(
        &self,
        sql: &str,
        max_rows: usize,
        budget: Duration,
    ) -> std::result::Result<RowSet, ExecutionError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ExecutionError::Connection(e.to_string()))?;

        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            statement_timeout_ms(budget)
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| ExecutionError::Connection(e.to_string()))?;

        let result = read_rows(&mut *tx, sql, max_rows, Some(budget)).await;

        // Nothing was written; ending the transaction also drops the setting.
        if let Err(e) = tx.rollback().await {
            debug!("Rollback after read failed: {e}");
        }
        result
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// `statement_timeout` takes whole milliseconds, where 0 disables it.
fn statement_timeout_ms(budget: Duration) -> u128 {
    budget.as_millis().clamp(1, i32::MAX as u128)
}

/// Streams at most `max_rows` rows of `sql`, converting each as it arrives.
async fn read_rows(
    conn: &mut PgConnection,
    sql: &str,
    max_rows: usize,
    budget: Option<Duration>,
) -> std::result::Result<RowSet, ExecutionError> {
    let mut stream = sqlx::query(sql).fetch(conn);
    let mut result = RowSet::new();

    while result.rows.len() < max_rows {
        match stream.try_next().await {
            Ok(Some(row)) => {
                if result.columns.is_empty() {
                    result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                result.rows.push(convert_row(&row)?);
            }
            Ok(None) => break,
            Err(e) => return Err(read_error(e, budget, result.rows.is_empty())),
        }
    }

    result.capped = result.rows.len() >= max_rows;
    if result.capped {
        debug!(max_rows, "Row cap reached, discarding remaining rows");
    }
    Ok(result)
}

/// SQLSTATE raised when `statement_timeout` cancels a statement.
const QUERY_CANCELED: &str = "57014";

fn read_error(
    error: sqlx::Error,
    budget: Option<Duration>,
    before_first_row: bool,
) -> ExecutionError {
    let canceled = error
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == QUERY_CANCELED);

    match budget {
        Some(budget) if canceled => ExecutionError::Timeout(budget),
        _ if before_first_row => ExecutionError::Execution(format_query_error(error)),
        _ => ExecutionError::RowIteration(error.to_string()),
    }
}

/// Converts a sqlx PgRow to a JSON object.
fn convert_row(row: &PgRow) -> std::result::Result<JsonRow, ExecutionError> {
    let mut out = JsonRow::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let value = convert_value(row, i, col.type_info().name())
            .map_err(|e| ExecutionError::scan(col.name(), e))?;
        out.insert(col.name().to_string(), value);
    }
    Ok(out)
}

fn get<'r, T>(row: &'r PgRow, index: usize) -> std::result::Result<Option<T>, String>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<Option<T>, _>(index).map_err(|e| e.to_string())
}

/// Decodes an array column; NULL elements stay null.
fn array<'r, T>(
    row: &'r PgRow,
    index: usize,
    to_json: impl Fn(T) -> Value,
) -> std::result::Result<Option<Value>, String>
where
    Vec<Option<T>>: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    Ok(get::<Vec<Option<T>>>(row, index)?.map(|items| {
        Value::Array(
            items
                .into_iter()
                .map(|item| item.map_or(Value::Null, &to_json))
                .collect(),
        )
    }))
}

/// Converts a single column value from a PgRow to a JSON value.
///
/// Types without a dedicated conversion come through as their raw wire
/// bytes, as text when those are valid UTF-8 and base64 otherwise.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> std::result::Result<Value, String> {
    let value = match type_name.to_uppercase().as_str() {
        "BOOL" => get::<bool>(row, index)?.map(Value::Bool),
        "INT2" => get::<i16>(row, index)?.map(Value::from),
        "INT4" => get::<i32>(row, index)?.map(Value::from),
        "INT8" => get::<i64>(row, index)?.map(Value::from),
        "OID" => get::<Oid>(row, index)?.map(|v| Value::from(v.0)),
        "FLOAT4" => get::<f32>(row, index)?.map(|v| float_value(f64::from(v))),
        "FLOAT8" => get::<f64>(row, index)?.map(float_value),
        "NUMERIC" => get::<Decimal>(row, index)?.map(decimal_value),
        "MONEY" => get::<PgMoney>(row, index)?.map(|v| decimal_value(v.to_decimal(MONEY_SCALE))),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" | "UNKNOWN" => {
            get::<String>(row, index)?.map(Value::String)
        }
        "JSON" | "JSONB" => get::<Value>(row, index)?,
        "UUID" => get::<uuid::Uuid>(row, index)?.map(|v| Value::String(v.to_string())),
        "BYTEA" => get::<Vec<u8>>(row, index)?.map(bytes_value),
        "DATE" => get::<NaiveDate>(row, index)?.map(date_value),
        "TIME" => get::<NaiveTime>(row, index)?.map(|v| Value::String(v.to_string())),
        "TIMETZ" => get::<PgTimeTz<NaiveTime, FixedOffset>>(row, index)?
            .map(|v| Value::String(format!("{}{}", v.time, v.offset))),
        "TIMESTAMP" => get::<NaiveDateTime>(row, index)?.map(naive_timestamp_value),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, index)?.map(timestamp_value),
        "INTERVAL" => get::<PgInterval>(row, index)?.map(interval_value),
        "BOOL[]" => array(row, index, Value::Bool)?,
        "INT2[]" => array(row, index, |v: i16| Value::from(v))?,
        "INT4[]" => array(row, index, |v: i32| Value::from(v))?,
        "INT8[]" => array(row, index, |v: i64| Value::from(v))?,
        "FLOAT4[]" => array(row, index, |v: f32| float_value(f64::from(v)))?,
        "FLOAT8[]" => array(row, index, float_value)?,
        "NUMERIC[]" => array(row, index, decimal_value)?,
        "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => array(row, index, Value::String)?,
        "UUID[]" => array(row, index, |v: uuid::Uuid| Value::String(v.to_string()))?,
        "DATE[]" => array(row, index, date_value)?,
        "TIMESTAMP[]" => array(row, index, naive_timestamp_value)?,
        "TIMESTAMPTZ[]" => array(row, index, timestamp_value)?,
        other => raw_value(row, index, other)?,
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Fraction digits of `money` under the common locales.
const MONEY_SCALE: u32 = 2;

fn raw_value(
    row: &PgRow,
    index: usize,
    type_name: &str,
) -> std::result::Result<Option<Value>, String> {
    let raw = row.try_get_raw(index).map_err(|e| e.to_string())?;
    if raw.is_null() {
        return Ok(None);
    }
    debug!(type_name, "No dedicated conversion, passing raw value through");
    let bytes = raw.as_bytes().map_err(|e| e.to_string())?;
    Ok(Some(bytes_value(bytes.to_vec())))
}

/// Formats an interval as an ISO 8601 duration such as `P1Y2M3DT4H5M6.5S`.
fn interval_value(interval: PgInterval) -> Value {
    const MICROS_PER_SECOND: i64 = 1_000_000;
    const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;
    const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MINUTE;

    let mut out = String::from("P");
    let (years, months) = (interval.months / 12, interval.months % 12);
    for (amount, unit) in [(years, 'Y'), (months, 'M'), (interval.days, 'D')] {
        if amount != 0 {
            out.push_str(&format!("{amount}{unit}"));
        }
    }

    let micros = interval.microseconds;
    if micros != 0 {
        out.push('T');
        let hours = micros / MICROS_PER_HOUR;
        let minutes = micros % MICROS_PER_HOUR / MICROS_PER_MINUTE;
        let rest = micros % MICROS_PER_MINUTE;
        if hours != 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes != 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if rest != 0 {
            let sign = if rest < 0 { "-" } else { "" };
            let rest = rest.unsigned_abs();
            let seconds = rest / MICROS_PER_SECOND as u64;
            let fraction = rest % MICROS_PER_SECOND as u64;
            if fraction == 0 {
                out.push_str(&format!("{sign}{seconds}S"));
            } else {
                let digits = format!("{fraction:06}");
                out.push_str(&format!("{sign}{seconds}.{}S", digits.trim_end_matches('0')));
            }
        }
    }

    if out == "P" {
        out.push_str("T0S");
    }
    Value::String(out)
}

/// Determines if an error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("timeout")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, url: &str) -> ParleyError {
    let parsed = Url::parse(url).ok();
    let host = parsed
        .as_ref()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());
    let port = parsed.as_ref().and_then(Url::port).unwrap_or(5432);
    let user = parsed
        .as_ref()
        .map(|u| u.username().to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let database = parsed
        .as_ref()
        .map(|u| u.path().trim_start_matches('/').to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        ParleyError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        ParleyError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        ParleyError::connection(format!("Database '{database}' does not exist."))
    } else if error_str.contains("ssl") || error_str.contains("tls") {
        ParleyError::connection(
            "Server requires SSL. Add '?sslmode=require' to the database url.".to_string(),
        )
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        ParleyError::connection(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        ParleyError::connection(error.to_string())
    }
}

/// Formats a query error with detail and hint if available.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = String::from(db_error.message());

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str(" (detail: ");
            result.push_str(detail);
            result.push(')');
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str(" (hint: ");
            result.push_str(hint);
            result.push(')');
        }
    }

    result
}
