//! Message persistence.
//!
//! A message records one question and its outcome. Messages are insert-only;
//! they disappear only when their conversation is deleted.

use crate::error::{ParleyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::fmt;

/// Shape of a message's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultFormat {
    /// No rows, or a single value.
    Text,
    /// Anything larger than a single value.
    Table,
    /// The question failed before producing rows.
    Error,
}

impl ResultFormat {
    /// Returns the stored tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
            Self::Error => "error",
        }
    }

    /// Classifies a result by its dimensions.
    ///
    /// Zero rows, or exactly one row with exactly one column, is text.
    pub fn classify(row_count: usize, column_count: usize) -> Self {
        match (row_count, column_count) {
            (0, _) | (1, 1) => Self::Text,
            _ => Self::Table,
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(Self::Text),
            "table" => Ok(Self::Table),
            "error" => Ok(Self::Error),
            other => Err(ParleyError::persistence(format!(
                "Unknown result format '{other}' in state database"
            ))),
        }
    }
}

impl fmt::Display for ResultFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored question and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    /// The question exactly as asked.
    pub user_message: String,
    pub sql_query: Option<String>,
    /// JSON array of row objects. Absent for errors and empty results.
    pub result_data: Option<String>,
    pub result_format: ResultFormat,
    pub error_message: Option<String>,
    /// Optional commentary on the result.
    pub analysis: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Returns true if this message records a failure.
    pub fn is_error(&self) -> bool {
        self.result_format == ResultFormat::Error
    }

    /// Parses the stored payload back into row objects.
    pub fn result_rows(&self) -> Result<Vec<serde_json::Value>> {
        match &self.result_data {
            Some(data) => serde_json::from_str(data).map_err(|e| {
                ParleyError::internal(format!("Stored result data is not valid JSON: {e}"))
            }),
            None => Ok(Vec::new()),
        }
    }
}

/// A message about to be stored.
///
/// Built through [`NewMessage::success`] or [`NewMessage::failure`] so a
/// message never carries both a payload and an error.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    conversation_id: i64,
    user_message: String,
    sql_query: Option<String>,
    result_data: Option<String>,
    result_format: ResultFormat,
    error_message: Option<String>,
    analysis: Option<String>,
    execution_time_ms: i64,
}

impl NewMessage {
    /// A successfully executed question. An empty payload is stored as absent.
    pub fn success(
        conversation_id: i64,
        question: impl Into<String>,
        sql: impl Into<String>,
        payload: Option<String>,
        format: ResultFormat,
        execution_time_ms: i64,
    ) -> Self {
        Self {
            conversation_id,
            user_message: question.into(),
            sql_query: Some(sql.into()),
            result_data: payload.filter(|p| !p.is_empty()),
            result_format: format,
            error_message: None,
            analysis: None,
            execution_time_ms,
        }
    }

    /// A question that failed at generation, validation or execution.
    pub fn failure(
        conversation_id: i64,
        question: impl Into<String>,
        error: impl Into<String>,
        execution_time_ms: i64,
    ) -> Self {
        Self {
            conversation_id,
            user_message: question.into(),
            sql_query: None,
            result_data: None,
            result_format: ResultFormat::Error,
            error_message: Some(error.into()),
            analysis: None,
            execution_time_ms,
        }
    }

    /// Attaches commentary. Ignored on failures.
    pub fn with_analysis(mut self, analysis: Option<String>) -> Self {
        if self.result_format != ResultFormat::Error {
            self.analysis = analysis;
        }
        self
    }

    /// Owning conversation.
    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    /// Shape of the outcome.
    pub fn result_format(&self) -> ResultFormat {
        self.result_format
    }
}

/// Raw database row for a message.
#[derive(Debug, Clone, FromRow)]
struct MessageRow {
    id: i64,
    conversation_id: i64,
    user_message: String,
    sql_query: Option<String>,
    result_data: Option<String>,
    result_format: String,
    error_message: Option<String>,
    analysis: Option<String>,
    execution_time_ms: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = ParleyError;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            conversation_id: row.conversation_id,
            user_message: row.user_message,
            sql_query: row.sql_query,
            result_data: row.result_data,
            result_format: ResultFormat::parse(&row.result_format)?,
            error_message: row.error_message,
            analysis: row.analysis,
            execution_time_ms: row.execution_time_ms,
            created_at: row.created_at,
        })
    }
}

const SELECT_MESSAGE: &str = r#"
    SELECT id, conversation_id, user_message, sql_query, result_data, result_format,
           error_message, analysis, execution_time_ms, created_at
    FROM messages
"#;

/// Inserts a message and touches its conversation's `updated_at`.
pub async fn insert_message(pool: &SqlitePool, message: &NewMessage) -> Result<Message> {
    let now = Utc::now();
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to begin transaction: {e}")))?;

    let id = sqlx::query(
        r#"
        INSERT INTO messages
        (conversation_id, user_message, sql_query, result_data, result_format,
         error_message, analysis, execution_time_ms, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(message.conversation_id)
    .bind(&message.user_message)
    .bind(&message.sql_query)
    .bind(&message.result_data)
    .bind(message.result_format.as_str())
    .bind(&message.error_message)
    .bind(&message.analysis)
    .bind(message.execution_time_ms)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to save message: {e}")))?
    .last_insert_rowid();

    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(message.conversation_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to touch conversation: {e}")))?;

    tx.commit()
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to commit message: {e}")))?;

    Ok(Message {
        id,
        conversation_id: message.conversation_id,
        user_message: message.user_message.clone(),
        sql_query: message.sql_query.clone(),
        result_data: message.result_data.clone(),
        result_format: message.result_format,
        error_message: message.error_message.clone(),
        analysis: message.analysis.clone(),
        execution_time_ms: Some(message.execution_time_ms),
        created_at: now,
    })
}

/// Gets a message by id.
pub async fn get_message(pool: &SqlitePool, id: i64) -> Result<Option<Message>> {
    let row: Option<MessageRow> = sqlx::query_as(&format!("{SELECT_MESSAGE} WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to get message: {e}")))?;

    row.map(Message::try_from).transpose()
}

/// Lists all messages of a conversation, oldest first.
pub async fn list_messages(pool: &SqlitePool, conversation_id: i64) -> Result<Vec<Message>> {
    let rows: Vec<MessageRow> = sqlx::query_as(&format!(
        "{SELECT_MESSAGE} WHERE conversation_id = ? ORDER BY created_at ASC, id ASC"
    ))
    .bind(conversation_id)
    .fetch_all(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to list messages: {e}")))?;

    rows.into_iter().map(Message::try_from).collect()
}

/// Returns the `limit` most recent questions of a conversation, oldest first.
pub async fn recent_questions(
    pool: &SqlitePool,
    conversation_id: i64,
    limit: usize,
) -> Result<Vec<String>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut questions: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT user_message FROM messages
        WHERE conversation_id = ?
        ORDER BY created_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(conversation_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to load history: {e}")))?;

    questions.reverse();
    Ok(questions)
}
