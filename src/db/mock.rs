//! Mock database client for testing.
//!
//! Returns canned row sets, simulates failures and slow statements, and
//! records every statement it receives.

use super::{DatabaseBackend, DatabaseClient, ExecutionError, JsonRow, RowSet};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A mock database client that returns predefined results.
#[derive(Debug, Clone, Default)]
pub struct MockDatabaseClient {
    /// Statement pattern -> canned rows. First match wins.
    results: Vec<(String, RowSet)>,
    /// Rows for statements matching no pattern.
    fallback: RowSet,
    failure: Option<ExecutionError>,
    delay: Option<Duration>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl MockDatabaseClient {
    /// Creates a mock that answers every statement with no rows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers statements containing `pattern` with `rows`.
    pub fn with_result(mut self, pattern: impl Into<String>, rows: RowSet) -> Self {
        self.results.push((pattern.into(), rows));
        self
    }

    /// Answers statements matching no pattern with `rows`.
    pub fn with_fallback(mut self, rows: RowSet) -> Self {
        self.fallback = rows;
        self
    }

    /// Fails every statement with `error`.
    pub fn failing(mut self, error: ExecutionError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Delays every statement by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the statements received so far.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Builds a row set from column names and row values.
    pub fn rows<const N: usize>(columns: [&str; N], rows: Vec<[Value; N]>) -> RowSet {
        let rows = rows
            .into_iter()
            .map(|values| {
                columns
                    .iter()
                    .map(|c| c.to_string())
                    .zip(values)
                    .collect::<JsonRow>()
            })
            .collect();
        RowSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            capped: false,
        }
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Postgres
    }

    async fn fetch_rows(
        &self,
        sql: &str,
        max_rows: usize,
    ) -> std::result::Result<RowSet, ExecutionError> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(sql.to_string());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        let sql_lower = sql.to_lowercase();
        let mut result = self
            .results
            .iter()
            .find(|(pattern, _)| sql_lower.contains(&pattern.to_lowercase()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_else(|| self.fallback.clone());

        if result.rows.len() >= max_rows {
            result.rows.truncate(max_rows);
            result.capped = true;
        }

        Ok(result)
    }

    async fn close(&self) {}
}
