//! Bounded executor tests against a real SQLite store.

use std::sync::Arc;
use std::time::Duration;

use super::common::{seeded_store, MERCHANTS};
use db_parley::db::ExecutionError;
use db_parley::persistence::ResultFormat;
use db_parley::query::{QueryExecutor, QueryLimits};

async fn executor(max_rows: usize) -> QueryExecutor {
    QueryExecutor::new(
        Arc::new(seeded_store().await),
        QueryLimits::new(Duration::from_secs(5), max_rows),
    )
}

#[tokio::test]
async fn test_zero_rows() {
    let outcome = executor(10)
        .await
        .execute("SELECT * FROM transactions WHERE merch_name = 'nobody'")
        .await
        .unwrap();
    assert_eq!(outcome.format, ResultFormat::Text);
    assert_eq!(outcome.row_count, 0);
    assert!(outcome.payload.is_none());
    assert!(!outcome.capped);
}

#[tokio::test]
async fn test_single_row_two_columns_is_table() {
    let outcome = executor(10)
        .await
        .execute("SELECT merch_name, trx_amount_usd FROM transactions LIMIT 1")
        .await
        .unwrap();
    assert_eq!(outcome.format, ResultFormat::Table);
    assert_eq!(outcome.column_count, 2);
}

#[tokio::test]
async fn test_cap_stops_consumption() {
    let outcome = executor(5)
        .await
        .execute("SELECT id FROM transactions")
        .await
        .unwrap();
    assert_eq!(outcome.row_count, 5);
    assert!(outcome.capped);
    assert!(MERCHANTS.len() * 3 > 5);
}

#[tokio::test]
async fn test_recursive_query_is_cut_at_cap() {
    // Unbounded generator; only the cap keeps this finite.
    let outcome = executor(1000)
        .await
        .execute(
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT x FROM n",
        )
        .await
        .unwrap();
    assert_eq!(outcome.row_count, 1000);
    assert!(outcome.capped);
}

#[tokio::test]
async fn test_syntax_error_is_execution_failure() {
    let err = executor(10)
        .await
        .execute("SELECT FROM WHERE")
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Execution(_)));
}
