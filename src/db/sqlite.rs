//! SQLite database client implementation.
//!
//! SQLite values are dynamically typed, so conversion follows each value's
//! storage class rather than the declared column type. Dates and times are
//! stored as text and pass through unchanged.

use crate::db::{
    bytes_value, float_value, DatabaseBackend, DatabaseClient, ExecutionError, JsonRow, RowSet,
};
use crate::error::{ParleyError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;

/// Maximum pooled connections for file databases.
const MAX_CONNECTIONS: u32 = 5;

/// How long to wait for a locked database.
const BUSY_TIMEOUT_SECS: u64 = 5;

/// SQLite database client.
#[derive(Debug, Clone)]
pub struct SqliteClient {
    pool: SqlitePool,
}

impl SqliteClient {
    /// Creates a new SqliteClient from an existing connection pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the database at `url` (e.g. `sqlite:data.db`, `sqlite::memory:`).
    ///
    /// In-memory databases use a single connection so every statement sees
    /// the same data.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| ParleyError::connection(format!("Invalid SQLite url {url}: {e}")))?
            .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS));

        let max_connections = if url.contains(":memory:") {
            1
        } else {
            MAX_CONNECTIONS
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| ParleyError::connection(format!("Failed to open {url}: {e}")))?;

        Ok(Self { pool })
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DatabaseClient for SqliteClient {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Sqlite
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

        let mut stream = sqlx::query(sql).fetch(&mut *conn);
        let mut result = RowSet::new();

        while result.rows.len() < max_rows {
            match stream.try_next().await {
                Ok(Some(row)) => {
                    if result.columns.is_empty() {
                        result.columns =
                            row.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    result.rows.push(convert_row(&row)?);
                }
                Ok(None) => break,
                Err(e) if result.rows.is_empty() => {
                    return Err(ExecutionError::Execution(e.to_string()))
                }
                Err(e) => return Err(ExecutionError::RowIteration(e.to_string())),
            }
        }

        result.capped = result.rows.len() >= max_rows;
        Ok(result)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Converts a sqlx SqliteRow to a JSON object.
fn convert_row(row: &SqliteRow) -> std::result::Result<JsonRow, ExecutionError> {
    let mut out = JsonRow::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let value = convert_value(row, i).map_err(|e| ExecutionError::scan(col.name(), e))?;
        out.insert(col.name().to_string(), value);
    }
    Ok(out)
}

/// Converts one value by its storage class.
fn convert_value(row: &SqliteRow, index: usize) -> std::result::Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_string();

    Ok(match storage.as_str() {
        "INTEGER" => Value::from(row.try_get::<i64, _>(index)?),
        "REAL" => float_value(row.try_get::<f64, _>(index)?),
        "BLOB" => bytes_value(row.try_get::<Vec<u8>, _>(index)?),
        _ => Value::String(row.try_get::<String, _>(index)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> SqliteClient {
        let client = SqliteClient::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE transactions (id INTEGER PRIMARY KEY, merch_name TEXT, \
             trx_amount_usd REAL, card BLOB, date TEXT)",
        )
        .execute(client.pool())
        .await
        .unwrap();
        for i in 1..=20 {
            sqlx::query("INSERT INTO transactions (merch_name, trx_amount_usd, card, date) VALUES (?, ?, ?, ?)")
                .bind(format!("merchant {i}"))
                .bind(f64::from(i) * 10.5)
                .bind(vec![0xffu8, i as u8])
                .bind("2024-01-15")
                .execute(client.pool())
                .await
                .unwrap();
        }
        client
    }

    #[tokio::test]
    async fn test_fetch_converts_storage_classes() {
        let client = seeded().await;
        let rows = client
            .fetch_rows(
                "SELECT id, merch_name, trx_amount_usd, card, date, NULL AS missing \
                 FROM transactions ORDER BY id LIMIT 1",
                10,
            )
            .await
            .unwrap();

        assert_eq!(
            rows.columns,
            vec!["id", "merch_name", "trx_amount_usd", "card", "date", "missing"]
        );
        let row = &rows.rows[0];
        assert_eq!(row["id"], Value::from(1));
        assert_eq!(row["merch_name"], Value::from("merchant 1"));
        assert_eq!(row["trx_amount_usd"], serde_json::json!(10.5));
        assert_eq!(row["card"], Value::from("/wE="));
        assert_eq!(row["date"], Value::from("2024-01-15"));
        assert_eq!(row["missing"], Value::Null);
    }

    #[tokio::test]
    async fn test_fetch_stops_at_cap() {
        let client = seeded().await;
        let rows = client
            .fetch_rows("SELECT id FROM transactions", 5)
            .await
            .unwrap();
        assert_eq!(rows.row_count(), 5);
        assert!(rows.capped);
    }

    #[tokio::test]
    async fn test_fetch_below_cap_is_not_capped() {
        let client = seeded().await;
        let rows = client
            .fetch_rows("SELECT COUNT(*) AS n FROM transactions", 5)
            .await
            .unwrap();
        assert_eq!(rows.rows[0]["n"], Value::from(20));
        assert!(!rows.capped);
    }

    #[tokio::test]
    async fn test_fetch_execution_error() {
        let client = seeded().await;
        let err = client
            .fetch_rows("SELECT * FROM nonexistent_table_xyz", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Execution(_)));
        assert!(err.to_string().contains("nonexistent_table_xyz"));
    }

    #[tokio::test]
    async fn test_fetch_after_close_is_connection_error() {
        let client = seeded().await;
        client.close().await;
        let err = client.fetch_rows("SELECT 1", 5).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Connection(_)));
    }
}
