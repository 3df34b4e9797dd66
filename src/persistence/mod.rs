//! Persistence layer for Parley.
//!
//! Manages the local SQLite state database holding conversations and their
//! messages. The question pipeline talks to it through [`ConversationStore`].

mod conversations;
mod messages;
mod migrations;

pub use conversations::{
    title_from_question, user_can_access, Conversation, ConversationPage,
    ConversationWithMessages, NewBranch, PageRequest, DEFAULT_PAGE_LIMIT,
    MAX_DERIVED_TITLE_CHARS, MAX_PAGE_LIMIT,
};
pub use messages::{Message, NewMessage, ResultFormat};

use crate::error::{ParleyError, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY_MS: u64 = 100;

/// Message returned whenever a conversation is missing or belongs to
/// someone else. The two cases are indistinguishable to callers.
pub const CONVERSATION_NOT_FOUND: &str = "conversation not found";

/// Message returned whenever a message is missing or not visible.
pub const MESSAGE_NOT_FOUND: &str = "message not found";

/// Conversations and messages, scoped by owning user.
///
/// Every user-scoped operation answers `NotFound` for conversations the user
/// cannot access, so existence is never leaked across users.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates a root conversation owned by `user_id`.
    async fn create_conversation(&self, user_id: i64, title: Option<&str>)
        -> Result<Conversation>;

    /// Looks up a conversation without any ownership check.
    async fn find_conversation(&self, id: i64) -> Result<Option<Conversation>>;

    /// Gets a conversation with its messages, oldest first.
    async fn get_conversation(&self, user_id: i64, id: i64) -> Result<ConversationWithMessages>;

    /// Lists the user's conversations, most recently updated first.
    async fn list_conversations(&self, user_id: i64, page: PageRequest)
        -> Result<ConversationPage>;

    /// Searches the user's conversation titles.
    async fn search_conversations(
        &self,
        user_id: i64,
        keyword: &str,
        page: PageRequest,
    ) -> Result<ConversationPage>;

    /// Sets a conversation's title.
    async fn rename_conversation(&self, user_id: i64, id: i64, title: &str)
        -> Result<Conversation>;

    /// Deletes a conversation and its messages.
    async fn delete_conversation(&self, user_id: i64, id: i64) -> Result<()>;

    /// Forks a conversation at one of its messages.
    async fn create_branch(&self, user_id: i64, branch: &NewBranch) -> Result<Conversation>;

    /// Appends a message to its conversation.
    async fn append_message(&self, message: &NewMessage) -> Result<Message>;

    /// Returns up to `limit` of the newest questions, oldest first.
    async fn recent_questions(&self, conversation_id: i64, limit: usize) -> Result<Vec<String>>;

    /// Gets a message, provided its conversation is visible to the user.
    async fn find_message(&self, user_id: i64, message_id: i64) -> Result<Message>;
}

/// Main persistence interface for the application state database.
pub struct StateDb {
    pool: SqlitePool,
    db_path: Option<PathBuf>,
}

impl StateDb {
    /// Opens or creates the state database at the specified path.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::ensure_parent_dirs(path)?;

        match Self::try_open(path).await {
            Ok(db) => Ok(db),
            Err(e) => {
                warn!("Failed to open state database: {e}. Attempting recovery...");
                Self::attempt_recovery(path).await
            }
        }
    }

    /// Opens a throwaway in-memory state database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ParleyError::persistence(format!("Invalid database path: {e}")))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                ParleyError::persistence(format!("Failed to open in-memory state database: {e}"))
            })?;
        migrations::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            db_path: None,
        })
    }

    /// Attempts to open the database with retries for lock contention.
    async fn try_open(path: &Path) -> Result<Self> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * 2u64.pow(attempt)))
                    .await;
            }

            match Self::connect(path).await {
                Ok(pool) => {
                    migrations::run_migrations(&pool).await?;
                    info!("State database opened at {}", path.display());
                    return Ok(Self {
                        pool,
                        db_path: Some(path.to_path_buf()),
                    });
                }
                Err(e) => {
                    debug!(attempt, "State database connect failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ParleyError::persistence("Failed to open database after retries")))
    }

    async fn connect(path: &Path) -> Result<SqlitePool> {
        let conn_str = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&conn_str)
            .map_err(|e| ParleyError::persistence(format!("Invalid database path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true);

        SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                ParleyError::persistence(format!("Failed to connect to state database: {e}"))
            })
    }

    fn ensure_parent_dirs(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ParleyError::persistence(format!(
                    "Failed to create state directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Attempts to recover from a corrupted database by backing up and recreating.
    async fn attempt_recovery(path: &Path) -> Result<Self> {
        let backup_path = path.with_extension("db.bak");

        if path.exists() {
            std::fs::rename(path, &backup_path).map_err(|e| {
                ParleyError::persistence(format!(
                    "Failed to backup corrupted database to {}: {e}",
                    backup_path.display()
                ))
            })?;
            warn!("Backed up corrupted database to {}", backup_path.display());
        }

        Self::try_open(path).await.map_err(|e| {
            ParleyError::persistence(format!("Failed to recreate database after backup: {e}"))
        })
    }

    /// Returns the path to the state database, if it is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Fetches a conversation the user can access.
    async fn accessible(&self, user_id: i64, id: i64) -> Result<Conversation> {
        conversations::get_conversation(&self.pool, id)
            .await?
            .filter(|c| user_can_access(c, user_id))
            .ok_or_else(|| ParleyError::not_found(CONVERSATION_NOT_FOUND))
    }
}

#[async_trait]
impl ConversationStore for StateDb {
    async fn create_conversation(
        &self,
        user_id: i64,
        title: Option<&str>,
    ) -> Result<Conversation> {
        conversations::insert_conversation(&self.pool, user_id, title, None, None).await
    }

    async fn find_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        conversations::get_conversation(&self.pool, id).await
    }

    async fn get_conversation(&self, user_id: i64, id: i64) -> Result<ConversationWithMessages> {
        let conversation = self.accessible(user_id, id).await?;
        let messages = messages::list_messages(&self.pool, id).await?;
        Ok(ConversationWithMessages {
            conversation,
            messages,
        })
    }

    async fn list_conversations(
        &self,
        user_id: i64,
        page: PageRequest,
    ) -> Result<ConversationPage> {
        conversations::list_conversations(&self.pool, user_id, page).await
    }

    async fn search_conversations(
        &self,
        user_id: i64,
        keyword: &str,
        page: PageRequest,
    ) -> Result<ConversationPage> {
        conversations::search_conversations(&self.pool, user_id, keyword, page).await
    }

    async fn rename_conversation(
        &self,
        user_id: i64,
        id: i64,
        title: &str,
    ) -> Result<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ParleyError::invalid_input("title must not be empty"));
        }
        self.accessible(user_id, id).await?;
        if !conversations::rename_conversation(&self.pool, id, title).await? {
            return Err(ParleyError::not_found(CONVERSATION_NOT_FOUND));
        }
        self.accessible(user_id, id).await
    }

    async fn delete_conversation(&self, user_id: i64, id: i64) -> Result<()> {
        self.accessible(user_id, id).await?;
        if !conversations::delete_conversation(&self.pool, id).await? {
            return Err(ParleyError::not_found(CONVERSATION_NOT_FOUND));
        }
        info!(conversation_id = id, "Conversation deleted");
        Ok(())
    }

    async fn create_branch(&self, user_id: i64, branch: &NewBranch) -> Result<Conversation> {
        let parent = self.accessible(user_id, branch.parent_id).await?;

        let branch_point = messages::get_message(&self.pool, branch.branch_point_message_id)
            .await?
            .ok_or_else(|| ParleyError::not_found(MESSAGE_NOT_FOUND))?;
        if branch_point.conversation_id != parent.id {
            return Err(ParleyError::invalid_input(
                "branch point message does not belong to the parent conversation",
            ));
        }

        let created = conversations::insert_conversation(
            &self.pool,
            parent.user_id,
            branch.title.as_deref(),
            Some(parent.id),
            Some(branch_point.id),
        )
        .await?;
        info!(
            conversation_id = created.id,
            parent_id = parent.id,
            branch_point = branch_point.id,
            "Branch created"
        );
        Ok(created)
    }

    async fn append_message(&self, message: &NewMessage) -> Result<Message> {
        messages::insert_message(&self.pool, message).await
    }

    async fn recent_questions(&self, conversation_id: i64, limit: usize) -> Result<Vec<String>> {
        messages::recent_questions(&self.pool, conversation_id, limit).await
    }

    async fn find_message(&self, user_id: i64, message_id: i64) -> Result<Message> {
        let message = messages::get_message(&self.pool, message_id)
            .await?
            .ok_or_else(|| ParleyError::not_found(MESSAGE_NOT_FOUND))?;
        self.accessible(user_id, message.conversation_id)
            .await
            .map_err(|e| match e {
                ParleyError::NotFound(_) => ParleyError::not_found(MESSAGE_NOT_FOUND),
                other => other,
            })?;
        Ok(message)
    }
}
