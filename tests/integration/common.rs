//! Shared fixtures for integration tests.

use std::sync::Arc;
use std::time::Duration;

use db_parley::db::SqliteClient;
use db_parley::llm::{LlmService, MockLlmClient, DEFAULT_SCHEMA_CONTEXT};
use db_parley::persistence::{ConversationStore, StateDb};
use db_parley::query::{QueryExecutor, QueryLimits, QueryPipeline};
use tempfile::TempDir;

/// Merchants seeded into the transactions table, with per-row USD amounts.
pub const MERCHANTS: &[(&str, f64, &str)] = &[
    ("Magnum", 120.0, "Almaty"),
    ("Small", 80.5, "Almaty"),
    ("Kaspi Store", 300.0, "Astana"),
    ("Technodom", 210.25, "Almaty"),
    ("Sulpak", 150.0, "Shymkent"),
    ("Arbuz", 45.0, "Astana"),
    ("Wolt", 33.3, "Almaty"),
];

/// Opens an in-memory SQLite store holding a small transactions table.
///
/// Every merchant gets three rows, one per month of Q1 2024.
pub async fn seeded_store() -> SqliteClient {
    let client = SqliteClient::connect("sqlite::memory:").await.unwrap();
    sqlx::query(
        "CREATE TABLE transactions (
            id INTEGER PRIMARY KEY,
            merch_name TEXT NOT NULL,
            trx_amount_usd REAL NOT NULL,
            location_city TEXT,
            trx_date TEXT NOT NULL
        )",
    )
    .execute(client.pool())
    .await
    .unwrap();

    for (name, amount, city) in MERCHANTS {
        for month in 1..=3 {
            sqlx::query(
                "INSERT INTO transactions (merch_name, trx_amount_usd, location_city, trx_date) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(name)
            .bind(amount)
            .bind(city)
            .bind(format!("2024-0{month}-15"))
            .execute(client.pool())
            .await
            .unwrap();
        }
    }

    client
}

/// Opens a file-backed state database in a fresh temporary directory.
pub async fn state_db() -> (Arc<StateDb>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = StateDb::open(&dir.path().join("state.db")).await.unwrap();
    (Arc::new(db), dir)
}

/// Wires a pipeline over the seeded store.
pub async fn pipeline(
    llm: MockLlmClient,
    max_rows: usize,
) -> (QueryPipeline, Arc<StateDb>, TempDir) {
    let (state, dir) = state_db().await;
    let pipeline = pipeline_over(state.clone(), llm, max_rows).await;
    (pipeline, state, dir)
}

/// Wires a pipeline over the seeded store, recording into `store`.
pub async fn pipeline_over(
    store: Arc<dyn ConversationStore>,
    llm: MockLlmClient,
    max_rows: usize,
) -> QueryPipeline {
    let executor = QueryExecutor::new(
        Arc::new(seeded_store().await),
        QueryLimits::new(Duration::from_secs(5), max_rows),
    );
    let service = LlmService::new(Arc::new(llm), DEFAULT_SCHEMA_CONTEXT);
    QueryPipeline::new(store, service, executor)
}
