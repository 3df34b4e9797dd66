//! LLM service for turning questions into candidate statements.
//!
//! Wraps a provider client with prompt building and response sanitizing so
//! the pipeline deals only in questions and cleaned statements.

use std::sync::Arc;
use std::time::Instant;

use crate::error::{ParleyError, Result};

use super::{
    build_analysis_prompt, build_sql_prompt, AnalysisRequest, LlmClient, Message,
    QuestionHistory, SqlSanitizer, EMPTY_RESPONSE,
};

/// LLM service that handles statement generation and result commentary.
#[derive(Clone)]
pub struct LlmService {
    client: Arc<dyn LlmClient>,
    sanitizer: SqlSanitizer,
    schema: Arc<str>,
}

impl LlmService {
    /// Creates a new LLM service describing `schema` to the model.
    pub fn new(client: Arc<dyn LlmClient>, schema: impl Into<Arc<str>>) -> Self {
        Self {
            client,
            sanitizer: SqlSanitizer::new(),
            schema: schema.into(),
        }
    }

    /// Returns the schema description sent with every prompt.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Generates a sanitized candidate statement for `question`.
    ///
    /// Provider errors and responses that sanitize to nothing are both
    /// reported as [`ParleyError::Llm`].
    pub async fn generate_sql(&self, question: &str, history: &QuestionHistory) -> Result<String> {
        let start = Instant::now();
        let prompt = build_sql_prompt(question, &self.schema, history);

        tracing::debug!(
            prompt_len = prompt.len(),
            history_len = history.len(),
            "Sending generation request to LLM"
        );

        let raw = self.client.complete(&[Message::user(prompt)]).await?;
        let sql = self.sanitizer.sanitize(&raw);

        tracing::debug!(
            llm_duration_ms = start.elapsed().as_millis(),
            raw_len = raw.len(),
            sql_len = sql.len(),
            "Received LLM response"
        );

        if sql.is_empty() {
            return Err(ParleyError::llm(EMPTY_RESPONSE));
        }

        Ok(sql)
    }

    /// Generates free-form commentary on an executed result.
    pub async fn generate_analysis(
        &self,
        request: &AnalysisRequest<'_>,
        history: &QuestionHistory,
    ) -> Result<String> {
        let start = Instant::now();
        let prompt = build_analysis_prompt(request, &self.schema, history);

        let raw = self.client.complete(&[Message::user(prompt)]).await?;
        let analysis = raw.trim();

        tracing::debug!(
            llm_duration_ms = start.elapsed().as_millis(),
            analysis_len = analysis.len(),
            "Received analysis from LLM"
        );

        if analysis.is_empty() {
            return Err(ParleyError::llm("model returned an empty analysis"));
        }

        Ok(analysis.to_string())
    }
}

impl std::fmt::Debug for LlmService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmService")
            .field("schema_len", &self.schema.len())
            .finish_non_exhaustive()
    }
}
