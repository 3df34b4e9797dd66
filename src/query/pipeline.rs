//! The question pipeline.
//!
//! Sequences history loading, statement generation, validation and bounded
//! execution for one question, then records the outcome as a message:
//!
//! ```text
//! RECEIVED -> HISTORY_LOADED -> SQL_GENERATED -> VALIDATED -> EXECUTED -> PERSISTED
//!                                    |              |            |
//!                                    +--------------+------------+--> ERROR_RECORDED
//! ```
//!
//! Generation, validation and execution failures become stored error
//! messages. Only failures of the conversation store reach the caller.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::executor::{deadline_after, ExecutionOutcome, QueryExecutor};
use crate::db::ExecutionError;
use crate::error::{ParleyError, Result};
use crate::llm::{
    AnalysisRequest, LlmService, QuestionHistory, ANALYSIS_HISTORY_LIMIT, SQL_HISTORY_LIMIT,
};
use crate::persistence::{
    title_from_question, user_can_access, Conversation, ConversationStore, Message, NewMessage,
    CONVERSATION_NOT_FOUND,
};
use crate::safety::{self, RejectionReason, Verdict, REJECTION_MESSAGE};

/// Where a question currently is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    HistoryLoaded,
    SqlGenerated,
    Validated,
    Executed,
    Persisted,
    ErrorRecorded,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::HistoryLoaded => "HISTORY_LOADED",
            Self::SqlGenerated => "SQL_GENERATED",
            Self::Validated => "VALIDATED",
            Self::Executed => "EXECUTED",
            Self::Persisted => "PERSISTED",
            Self::ErrorRecorded => "ERROR_RECORDED",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A functional failure of one pipeline stage.
///
/// The display text is what gets stored as the message's error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageFailure {
    /// The model was unreachable, failed, or produced nothing usable.
    #[error("failed to generate SQL: {0}")]
    Generation(String),

    /// The candidate statement was not read-only. The reason is logged only.
    #[error("{}", REJECTION_MESSAGE)]
    Validation(RejectionReason),

    /// The store could not run the statement.
    #[error("query execution failed: {0}")]
    Execution(#[from] ExecutionError),
}

impl StageFailure {
    /// Name of the stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Generation(_) => "generation",
            Self::Validation(_) => "validation",
            Self::Execution(_) => "execution",
        }
    }
}

/// A statement that ran, with what it produced.
#[derive(Debug, Clone)]
struct Executed {
    sql: String,
    outcome: ExecutionOutcome,
}

/// Turns questions into persisted messages.
#[derive(Clone)]
pub struct QueryPipeline {
    store: Arc<dyn ConversationStore>,
    llm: LlmService,
    executor: QueryExecutor,
    analysis_enabled: bool,
}

impl QueryPipeline {
    pub fn new(store: Arc<dyn ConversationStore>, llm: LlmService, executor: QueryExecutor) -> Self {
        Self {
            store,
            llm,
            executor,
            analysis_enabled: false,
        }
    }

    /// Generates commentary after each successful execution.
    pub fn with_analysis(mut self, enabled: bool) -> Self {
        self.analysis_enabled = enabled;
        self
    }

    /// Returns the conversation store.
    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Answers `question` for `user_id` and records the outcome.
    ///
    /// Without a conversation id a new conversation is started, titled after
    /// the question. Returns the stored message, which may itself record a
    /// failure; an `Err` means the outcome could not be recorded or the
    /// conversation is not visible to the user.
    pub async fn execute_query(
        &self,
        user_id: i64,
        question: &str,
        conversation_id: Option<i64>,
    ) -> Result<Message> {
        if question.trim().is_empty() {
            return Err(ParleyError::invalid_input("question must not be empty"));
        }

        let started = Instant::now();
        let budget = self.executor.limits().timeout;
        let deadline = deadline_after(started, budget);

        let conversation = self.resolve_conversation(user_id, question, conversation_id).await?;
        info!(
            state = %PipelineState::Received,
            conversation_id = conversation.id,
            user_id,
            "Question received"
        );

        let history = self.load_history(conversation.id, deadline).await?;
        debug!(
            state = %PipelineState::HistoryLoaded,
            conversation_id = conversation.id,
            history_len = history.len(),
            "History loaded"
        );

        let result = self.run_stages(conversation.id, question, &history, deadline, budget).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let new_message = match result {
            Ok(executed) => {
                let analysis = self.analyze_outcome(question, &executed, &history).await;
                NewMessage::success(
                    conversation.id,
                    question,
                    executed.sql,
                    executed.outcome.payload,
                    executed.outcome.format,
                    elapsed_ms,
                )
                .with_analysis(analysis)
            }
            Err(failure) => {
                if let StageFailure::Validation(reason) = &failure {
                    warn!(conversation_id = conversation.id, %reason, "Statement rejected");
                }
                NewMessage::failure(conversation.id, question, failure.to_string(), elapsed_ms)
            }
        };

        let message = self.store.append_message(&new_message).await?;
        let state = if message.is_error() {
            PipelineState::ErrorRecorded
        } else {
            PipelineState::Persisted
        };
        info!(
            %state,
            conversation_id = message.conversation_id,
            message_id = message.id,
            result_format = %message.result_format,
            elapsed_ms,
            "Question recorded"
        );

        Ok(message)
    }

    /// Produces commentary for a stored message on demand.
    ///
    /// The message itself is left unchanged.
    pub async fn analyze_message(&self, user_id: i64, message_id: i64) -> Result<String> {
        let message = self.store.find_message(user_id, message_id).await?;
        let sql = match (&message.sql_query, message.is_error()) {
            (Some(sql), false) => sql,
            _ => {
                return Err(ParleyError::invalid_input(
                    "only successfully answered questions can be analyzed",
                ))
            }
        };

        let questions = self
            .store
            .recent_questions(message.conversation_id, ANALYSIS_HISTORY_LIMIT)
            .await?;
        let history = QuestionHistory::from_questions(questions, ANALYSIS_HISTORY_LIMIT);

        let request = AnalysisRequest {
            question: &message.user_message,
            sql,
            results: message.result_data.as_deref().unwrap_or("[]"),
            result_format: message.result_format.as_str(),
        };
        let budget = self.executor.limits().timeout;
        tokio::time::timeout(budget, self.llm.generate_analysis(&request, &history))
            .await
            .map_err(|_| {
                ParleyError::llm(format!("analysis timed out after {}s", budget.as_secs()))
            })?
    }

    async fn resolve_conversation(
        &self,
        user_id: i64,
        question: &str,
        conversation_id: Option<i64>,
    ) -> Result<Conversation> {
        match conversation_id {
            Some(id) => self
                .store
                .find_conversation(id)
                .await?
                .filter(|c| user_can_access(c, user_id))
                .ok_or_else(|| ParleyError::not_found(CONVERSATION_NOT_FOUND)),
            None => {
                let title = title_from_question(question);
                let conversation = self.store.create_conversation(user_id, Some(&title)).await?;
                debug!(conversation_id = conversation.id, "Started new conversation");
                Ok(conversation)
            }
        }
    }

    async fn load_history(&self, conversation_id: i64, deadline: Instant) -> Result<QuestionHistory> {
        let questions = tokio::time::timeout_at(
            deadline,
            self.store.recent_questions(conversation_id, SQL_HISTORY_LIMIT),
        )
        .await
        .map_err(|_| ParleyError::persistence("timed out loading conversation history"))??;

        Ok(QuestionHistory::from_questions(questions, SQL_HISTORY_LIMIT))
    }

    async fn run_stages(
        &self,
        conversation_id: i64,
        question: &str,
        history: &QuestionHistory,
        deadline: Instant,
        budget: Duration,
    ) -> std::result::Result<Executed, StageFailure> {
        let stage_started = Instant::now();
        let sql = tokio::time::timeout_at(deadline, self.llm.generate_sql(question, history))
            .await
            .map_err(|_| {
                StageFailure::Generation(format!("timed out after {}s", budget.as_secs()))
            })?
            .map_err(|e| StageFailure::Generation(e.to_string()))?;
        debug!(
            state = %PipelineState::SqlGenerated,
            conversation_id,
            llm_ms = stage_started.elapsed().as_millis() as u64,
            sql_len = sql.len(),
            "Statement generated"
        );

        if let Verdict::Rejected(reason) = safety::classify(&sql) {
            return Err(StageFailure::Validation(reason));
        }
        debug!(state = %PipelineState::Validated, conversation_id, "Statement accepted");

        let exec_started = Instant::now();
        let outcome = self.executor.execute_until(&sql, deadline).await?;
        debug!(
            state = %PipelineState::Executed,
            conversation_id,
            exec_ms = exec_started.elapsed().as_millis() as u64,
            rows = outcome.row_count,
            capped = outcome.capped,
            "Statement executed"
        );

        Ok(Executed { sql, outcome })
    }

    /// Best-effort commentary; failures leave the message without analysis.
    async fn analyze_outcome(
        &self,
        question: &str,
        executed: &Executed,
        history: &QuestionHistory,
    ) -> Option<String> {
        if !self.analysis_enabled {
            return None;
        }

        let history = QuestionHistory::from_questions(
            history.recent(ANALYSIS_HISTORY_LIMIT).iter().cloned(),
            ANALYSIS_HISTORY_LIMIT,
        );
        let request = AnalysisRequest {
            question,
            sql: &executed.sql,
            results: executed.outcome.payload.as_deref().unwrap_or("[]"),
            result_format: executed.outcome.format.as_str(),
        };

        let budget = self.executor.limits().timeout;
        match tokio::time::timeout(budget, self.llm.generate_analysis(&request, &history)).await {
            Ok(Ok(text)) => Some(text),
            Ok(Err(e)) => {
                warn!("Analysis failed: {e}");
                None
            }
            Err(_) => {
                warn!("Analysis timed out after {}s", budget.as_secs());
                None
            }
        }
    }
}

impl fmt::Debug for QueryPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryPipeline")
            .field("llm", &self.llm)
            .field("executor", &self.executor)
            .field("analysis_enabled", &self.analysis_enabled)
            .finish_non_exhaustive()
    }
}
