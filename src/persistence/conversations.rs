//! Conversation persistence.
//!
//! Conversations form a forest: roots have no parent, branches point at a
//! parent conversation and at the message they diverged from. Functions here
//! are unscoped; ownership is checked by the [`StateDb`](super::StateDb)
//! store through [`user_can_access`].

use super::messages::Message;
use crate::error::{ParleyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

/// Default page size for listings.
pub const DEFAULT_PAGE_LIMIT: i64 = 50;

/// Largest page a listing will return.
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Longest title derived from a question.
pub const MAX_DERIVED_TITLE_CHARS: usize = 80;

/// A conversation owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    pub id: i64,
    pub user_id: i64,
    pub title: Option<String>,
    pub parent_branch_id: Option<i64>,
    pub branch_point_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Returns true if this conversation was forked from another.
    pub fn is_branch(&self) -> bool {
        self.parent_branch_id.is_some()
    }
}

/// The single authorization predicate for conversations and their messages.
pub fn user_can_access(conversation: &Conversation, user_id: i64) -> bool {
    conversation.user_id == user_id
}

/// Derives a conversation title from a question.
pub fn title_from_question(question: &str) -> String {
    let trimmed = question.trim();
    match trimmed.char_indices().nth(MAX_DERIVED_TITLE_CHARS) {
        Some((idx, _)) => trimmed[..idx].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

/// A conversation together with its messages, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationWithMessages {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

/// Paging parameters, clamped to sane bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: i64,
    pub offset: i64,
}

impl PageRequest {
    /// Clamps `limit` to `1..=100` (default 50) and `offset` to `>= 0`.
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit
                .filter(|l| *l > 0)
                .unwrap_or(DEFAULT_PAGE_LIMIT)
                .min(MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of a user's conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPage {
    pub conversations: Vec<Conversation>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// A request to fork a conversation at one of its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBranch {
    pub parent_id: i64,
    pub branch_point_message_id: i64,
    pub title: Option<String>,
}

const SELECT_CONVERSATION: &str = r#"
    SELECT id, user_id, title, parent_branch_id, branch_point_message_id, created_at, updated_at
    FROM conversations
"#;

/// Inserts a conversation.
pub async fn insert_conversation(
    pool: &SqlitePool,
    user_id: i64,
    title: Option<&str>,
    parent_branch_id: Option<i64>,
    branch_point_message_id: Option<i64>,
) -> Result<Conversation> {
    let now = Utc::now();
    let id = sqlx::query(
        r#"
        INSERT INTO conversations
        (user_id, title, parent_branch_id, branch_point_message_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(title)
    .bind(parent_branch_id)
    .bind(branch_point_message_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to create conversation: {e}")))?
    .last_insert_rowid();

    Ok(Conversation {
        id,
        user_id,
        title: title.map(str::to_string),
        parent_branch_id,
        branch_point_message_id,
        created_at: now,
        updated_at: now,
    })
}

/// Gets a conversation by id, regardless of owner.
pub async fn get_conversation(pool: &SqlitePool, id: i64) -> Result<Option<Conversation>> {
    sqlx::query_as(&format!("{SELECT_CONVERSATION} WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to get conversation: {e}")))
}

/// Lists a user's conversations, most recently updated first.
pub async fn list_conversations(
    pool: &SqlitePool,
    user_id: i64,
    page: PageRequest,
) -> Result<ConversationPage> {
    let conversations: Vec<Conversation> = sqlx::query_as(&format!(
        "{SELECT_CONVERSATION} WHERE user_id = ? ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?"
    ))
    .bind(user_id)
    .bind(page.limit)
    .bind(page.offset)
    .fetch_all(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to list conversations: {e}")))?;

    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conversations WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to count conversations: {e}")))?;

    Ok(ConversationPage {
        conversations,
        total,
        limit: page.limit,
        offset: page.offset,
    })
}

/// Searches a user's conversation titles for `keyword`, case-insensitively.
pub async fn search_conversations(
    pool: &SqlitePool,
    user_id: i64,
    keyword: &str,
    page: PageRequest,
) -> Result<ConversationPage> {
    let pattern = format!("%{}%", escape_like(&keyword.to_lowercase()));

    let conversations: Vec<Conversation> = sqlx::query_as(&format!(
        r#"{SELECT_CONVERSATION}
        WHERE user_id = ? AND LOWER(title) LIKE ? ESCAPE '\'
        ORDER BY updated_at DESC, id DESC
        LIMIT ? OFFSET ?"#
    ))
    .bind(user_id)
    .bind(&pattern)
    .bind(page.limit)
    .bind(page.offset)
    .fetch_all(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to search conversations: {e}")))?;

    let (total,): (i64,) = sqlx::query_as(
        r#"SELECT COUNT(*) FROM conversations
        WHERE user_id = ? AND LOWER(title) LIKE ? ESCAPE '\'"#,
    )
    .bind(user_id)
    .bind(&pattern)
    .fetch_one(pool)
    .await
    .map_err(|e| ParleyError::persistence(format!("Failed to count conversations: {e}")))?;

    Ok(ConversationPage {
        conversations,
        total,
        limit: page.limit,
        offset: page.offset,
    })
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Sets a conversation's title. Returns false if it does not exist.
pub async fn rename_conversation(pool: &SqlitePool, id: i64, title: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
        .bind(title)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to rename conversation: {e}")))?;

    Ok(result.rows_affected() > 0)
}

/// Deletes a conversation and, by cascade, its messages.
///
/// Branches of the deleted conversation survive as roots.
pub async fn delete_conversation(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| ParleyError::persistence(format!("Failed to delete conversation: {e}")))?;

    Ok(result.rows_affected() > 0)
}
