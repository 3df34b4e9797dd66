//! Mock LLM client for testing.
//!
//! Provides deterministic responses based on the question embedded in the
//! prompt. Also simulates provider failures and slow responses.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ParleyError, Result};
use crate::llm::types::{Message, Role};
use crate::llm::LlmClient;

/// Marker preceding the question in generation and analysis prompts.
const QUESTION_MARKER: &str = "USER QUESTION:";

/// Marker closing an analysis prompt.
const ANALYSIS_MARKER: &str = "Analysis:";

const DEFAULT_ANALYSIS: &str =
    "The results answer the question directly; no unusual values stand out.";

/// Mock LLM client that returns canned responses based on input patterns.
///
/// Used for unit testing without making real API calls.
#[derive(Debug, Clone, Default)]
pub struct MockLlmClient {
    /// Custom response mappings (pattern -> response).
    custom_responses: Vec<(String, String)>,
    /// Reply to analysis prompts.
    analysis_response: Option<String>,
    /// When set, every call fails with this message.
    failure: Option<String>,
    /// Artificial latency before answering.
    delay: Option<Duration>,
    /// Number of `complete` calls made, shared between clones.
    calls: Arc<AtomicUsize>,
}

impl MockLlmClient {
    /// Creates a new mock client with default responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a custom response mapping.
    ///
    /// When the question contains `pattern`, the mock will return `response`.
    pub fn with_response(
        mut self,
        pattern: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        self.custom_responses
            .push((pattern.into(), response.into()));
        self
    }

    /// Sets the reply returned for analysis prompts.
    pub fn with_analysis(mut self, response: impl Into<String>) -> Self {
        self.analysis_response = Some(response.into());
        self
    }

    /// Makes every call fail with an LLM error.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Delays every reply by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns how many completions were requested.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Generates a mock response based on the question.
    fn mock_response(&self, question: &str) -> String {
        let input_lower = question.to_lowercase();

        // Check custom responses first
        for (pattern, response) in &self.custom_responses {
            if input_lower.contains(&pattern.to_lowercase()) {
                return response.clone();
            }
        }

        if input_lower.contains("top") && input_lower.contains("merchant") {
            return "```sql\nSELECT merch_name, SUM(trx_amount_usd) AS volume\nFROM transactions\nGROUP BY merch_name\nORDER BY volume DESC\nLIMIT 5;\n```"
                .to_string();
        }

        if input_lower.contains("how many") || input_lower.contains("count") {
            return "```sql\nSELECT COUNT(*) FROM transactions;\n```".to_string();
        }

        if input_lower.contains("almaty") {
            return r#"SELECT SUM(trx_amount_usd) FROM transactions WHERE location_city = "Almaty""#
                .to_string();
        }

        if input_lower.contains("drop") || input_lower.contains("remove") {
            return "```sql\nDROP TABLE transactions;\n```".to_string();
        }

        if input_lower.contains("delete") {
            return "```sql\nDELETE FROM transactions WHERE trx_direction = 'minus';\n```"
                .to_string();
        }

        "I don't understand that question. Could you please rephrase it?".to_string()
    }

    /// Extracts the last user message content from a message list.
    fn extract_user_input(messages: &[Message]) -> &str {
        messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    /// Pulls the question line out of an assembled prompt.
    ///
    /// Raw input without the marker is treated as the question itself.
    fn extract_question(input: &str) -> &str {
        input
            .lines()
            .find_map(|line| line.trim_start().strip_prefix(QUESTION_MARKER))
            .map(str::trim)
            .unwrap_or(input)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = &self.failure {
            return Err(ParleyError::llm(message.clone()));
        }

        let input = Self::extract_user_input(messages);
        if input.trim_end().ends_with(ANALYSIS_MARKER) {
            return Ok(self
                .analysis_response
                .clone()
                .unwrap_or_else(|| DEFAULT_ANALYSIS.to_string()));
        }

        Ok(self.mock_response(Self::extract_question(input)))
    }
}
