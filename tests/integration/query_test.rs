//! PostgreSQL execution tests.
//!
//! These tests require a running PostgreSQL database.
//! Set DATABASE_URL environment variable to run them.

use std::sync::Arc;
use std::time::Duration;

use db_parley::db::{DatabaseClient, ExecutionError, PostgresClient};
use db_parley::persistence::ResultFormat;
use db_parley::query::{QueryExecutor, QueryLimits};
use serde_json::json;

/// Helper to create a test client.
async fn get_test_client() -> Option<PostgresClient> {
    let url = std::env::var("DATABASE_URL").ok()?;
    if !url.starts_with("postgres") {
        return None;
    }
    PostgresClient::connect(&url).await.ok()
}

#[tokio::test]
async fn test_scalar_types_convert() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let rows = client
        .fetch_rows(
            "SELECT 1::int4 AS i, 2.5::float8 AS f, 'x'::text AS t, true AS b, \
             NULL::text AS n, 12.50::numeric AS d, '\\xff00'::bytea AS raw, \
             '2024-01-15 10:30:00+00'::timestamptz AS ts, '2024-01-15'::date AS day",
            10,
        )
        .await
        .unwrap();

    let row = &rows.rows[0];
    assert_eq!(row["i"], json!(1));
    assert_eq!(row["f"], json!(2.5));
    assert_eq!(row["t"], json!("x"));
    assert_eq!(row["b"], json!(true));
    assert_eq!(row["n"], json!(null));
    assert_eq!(row["d"], json!(12.5));
    assert_eq!(row["raw"], json!("/wA="));
    assert_eq!(row["ts"], json!("2024-01-15T10:30:00Z"));
    assert_eq!(row["day"], json!("2024-01-15T00:00:00Z"));

    client.close().await;
}

#[tokio::test]
async fn test_generate_series_is_capped() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let executor = QueryExecutor::new(
        Arc::new(client),
        QueryLimits::new(Duration::from_secs(10), 100),
    );
    let outcome = executor
        .execute("SELECT g FROM generate_series(1, 1000000) AS g")
        .await
        .unwrap();
    assert_eq!(outcome.row_count, 100);
    assert!(outcome.capped);
    assert_eq!(outcome.format, ResultFormat::Table);
}

#[tokio::test]
async fn test_slow_statement_times_out() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let executor = QueryExecutor::new(
        Arc::new(client),
        QueryLimits::new(Duration::from_millis(300), 10),
    );
    let err = executor.execute("SELECT pg_sleep(5)").await.unwrap_err();
    assert!(matches!(err, ExecutionError::Timeout(_)));
}

#[tokio::test]
async fn test_timed_out_statement_stops_on_the_server() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let Ok(observer) = sqlx::PgPool::connect(&std::env::var("DATABASE_URL").unwrap()).await else {
        eprintln!("Skipping test: cannot open observer connection");
        return;
    };

    let executor = QueryExecutor::new(
        Arc::new(client),
        QueryLimits::new(Duration::from_secs(1), 10),
    );
    let err = executor
        .execute("SELECT pg_sleep(8) AS parley_sleep_marker")
        .await
        .unwrap_err();
    assert_eq!(err, ExecutionError::Timeout(Duration::from_secs(1)));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let still_running: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pg_stat_activity \
         WHERE state = 'active' AND query LIKE '%parley_sleep_marker%' \
         AND pid <> pg_backend_pid()",
    )
    .fetch_one(&observer)
    .await
    .unwrap();
    assert_eq!(still_running, 0);

    observer.close().await;
}

#[tokio::test]
async fn test_missing_table_is_execution_error() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let err = client
        .fetch_rows("SELECT * FROM nonexistent_table_xyz", 10)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Execution(_)));
    client.close().await;
}
