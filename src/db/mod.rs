//! Database abstraction layer for Parley.
//!
//! Provides a trait-based interface over the store that questions are
//! answered from, allowing different backends to be used interchangeably.

mod mock;
mod postgres;
mod sqlite;
mod types;

pub use mock::MockDatabaseClient;
pub use postgres::PostgresClient;
pub use sqlite::SqliteClient;
pub use types::{
    bytes_value, date_value, decimal_value, float_value, naive_timestamp_value, timestamp_value,
    ExecutionError, JsonRow, RowSet,
};

use crate::config::backend_for_url;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Postgres,
    Sqlite,
}

impl DatabaseBackend {
    /// Returns the backend as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// Parses a backend from a URL scheme.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Creates a database client for the given connection URL.
///
/// This is the central factory function for database connections.
pub async fn connect(url: &str) -> Result<Box<dyn DatabaseClient>> {
    match backend_for_url(url)? {
        DatabaseBackend::Postgres => Ok(Box::new(PostgresClient::connect(url).await?)),
        DatabaseBackend::Sqlite => Ok(Box::new(SqliteClient::connect(url).await?)),
    }
}

/// Trait defining the interface for database clients.
///
/// Callers bound the returned futures with their own deadline. Dropping a
/// future only stops reading; backends that can also stop the statement on
/// the server do so in [`DatabaseClient::fetch_rows_within`].
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Returns the backend this client talks to.
    fn backend(&self) -> DatabaseBackend;

    /// Runs `sql` and reads at most `max_rows` rows, converting each as it
    /// arrives. Rows beyond the cap are never read.
    async fn fetch_rows(
        &self,
        sql: &str,
        max_rows: usize,
    ) -> std::result::Result<RowSet, ExecutionError>;

    /// Like [`DatabaseClient::fetch_rows`], but the statement may run for at
    /// most `budget`. Running out reports [`ExecutionError::Timeout`].
    async fn fetch_rows_within(
        &self,
        sql: &str,
        max_rows: usize,
        budget: Duration,
    ) -> std::result::Result<RowSet, ExecutionError> {
        tokio::time::timeout(budget, self.fetch_rows(sql, max_rows))
            .await
            .map_err(|_| ExecutionError::Timeout(budget))?
    }

    /// Closes the connection pool.
    async fn close(&self);
}
