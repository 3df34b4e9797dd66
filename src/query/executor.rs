//! Bounded query execution.
//!
//! Runs an already-validated statement under a wall-clock deadline and a row
//! cap, then classifies and serializes what came back.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::QueryConfig;
use crate::db::{DatabaseClient, ExecutionError, RowSet};
use crate::persistence::ResultFormat;

/// Resource bounds for one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub timeout: Duration,
    pub max_rows: usize,
}

impl QueryLimits {
    pub fn new(timeout: Duration, max_rows: usize) -> Self {
        Self { timeout, max_rows }
    }
}

impl From<&QueryConfig> for QueryLimits {
    fn from(config: &QueryConfig) -> Self {
        Self::new(config.timeout(), config.max_result_rows)
    }
}

/// What a successful execution produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    /// JSON array of row objects; `None` when no rows came back.
    pub payload: Option<String>,
    pub format: ResultFormat,
    pub row_count: usize,
    pub column_count: usize,
    /// True if the row cap cut the result short.
    pub capped: bool,
}

impl ExecutionOutcome {
    /// Classifies and serializes a row set.
    pub fn from_rows(rows: &RowSet) -> std::result::Result<Self, ExecutionError> {
        let payload = if rows.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&rows.rows)
                    .map_err(|e| ExecutionError::Serialization(e.to_string()))?,
            )
        };

        Ok(Self {
            payload,
            format: ResultFormat::classify(rows.row_count(), rows.column_count()),
            row_count: rows.row_count(),
            column_count: rows.column_count(),
            capped: rows.capped,
        })
    }
}

/// Returns `start + budget`, saturating far in the future instead of
/// overflowing.
pub fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Roughly thirty years; comfortably inside every platform's `Instant` range.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Executes validated statements against the queried store.
#[derive(Clone)]
pub struct QueryExecutor {
    db: Arc<dyn DatabaseClient>,
    limits: QueryLimits,
}

impl QueryExecutor {
    /// Creates a new query executor.
    pub fn new(db: Arc<dyn DatabaseClient>, limits: QueryLimits) -> Self {
        Self { db, limits }
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    /// Executes `sql` with the configured timeout starting now.
    pub async fn execute(&self, sql: &str) -> std::result::Result<ExecutionOutcome, ExecutionError> {
        self.execute_until(sql, deadline_after(Instant::now(), self.limits.timeout))
            .await
    }

    /// Executes `sql`, giving up at `deadline`.
    ///
    /// The time left is handed to the store as the statement's own limit, so
    /// backends that support it cancel the statement on the server as well.
    /// The statement is never retried.
    pub async fn execute_until(
        &self,
        sql: &str,
        deadline: Instant,
    ) -> std::result::Result<ExecutionOutcome, ExecutionError> {
        let started = Instant::now();
        let timed_out = ExecutionError::Timeout(self.limits.timeout);

        let budget = deadline.saturating_duration_since(started);
        if budget.is_zero() {
            return Err(timed_out);
        }

        let rows = tokio::time::timeout_at(
            deadline,
            self.db.fetch_rows_within(sql, self.limits.max_rows, budget),
        )
        .await
        .map_err(|_| timed_out.clone())?
        .map_err(|e| match e {
            ExecutionError::Timeout(_) => timed_out,
            other => other,
        })?;

        let outcome = ExecutionOutcome::from_rows(&rows)?;
        debug!(
            rows = outcome.row_count,
            columns = outcome.column_count,
            capped = outcome.capped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Statement executed"
        );
        Ok(outcome)
    }
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("backend", &self.db.backend())
            .field("limits", &self.limits)
            .finish()
    }
}
