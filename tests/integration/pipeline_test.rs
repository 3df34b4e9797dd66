//! End-to-end question pipeline tests.
//!
//! Questions flow through the mock model, the sanitizer and the validator
//! into a real SQLite store, and outcomes land in a file-backed state database.

use std::sync::Arc;

use super::common::{pipeline, pipeline_over, state_db, MERCHANTS};
use async_trait::async_trait;
use db_parley::error::{ParleyError, Result};
use db_parley::llm::MockLlmClient;
use db_parley::persistence::{
    Conversation, ConversationPage, ConversationStore, ConversationWithMessages, Message,
    NewBranch, NewMessage, PageRequest, ResultFormat, StateDb,
};
use db_parley::safety::REJECTION_MESSAGE;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

#[tokio::test]
async fn test_top_merchants_is_a_table() {
    let (pipeline, _state, _dir) = pipeline(MockLlmClient::new(), 100).await;

    let msg = pipeline
        .execute_query(1, "top 5 merchants by USD volume in Q1 2024", None)
        .await
        .unwrap();

    assert_eq!(msg.result_format, ResultFormat::Table);
    assert!(msg.sql_query.is_some());
    assert!(msg.error_message.is_none());

    let rows = msg.result_rows().unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0]["merch_name"], json!("Kaspi Store"));
    assert_eq!(rows[0]["volume"], json!(900.0));
    let keys: Vec<&String> = rows[0].as_object().unwrap().keys().collect();
    assert_eq!(keys, vec!["merch_name", "volume"]);
}

#[tokio::test]
async fn test_count_is_text() {
    let (pipeline, _state, _dir) = pipeline(MockLlmClient::new(), 100).await;

    let msg = pipeline
        .execute_query(1, "How many transactions are there?", None)
        .await
        .unwrap();

    assert_eq!(msg.result_format, ResultFormat::Text);
    let rows = msg.result_rows().unwrap();
    assert_eq!(rows, vec![json!({ "COUNT(*)": MERCHANTS.len() * 3 })]);
}

#[tokio::test]
async fn test_double_quoted_literal_is_normalized_before_execution() {
    let (pipeline, _state, _dir) = pipeline(MockLlmClient::new(), 100).await;

    let msg = pipeline
        .execute_query(1, "total spent in Almaty", None)
        .await
        .unwrap();

    assert_eq!(
        msg.sql_query.as_deref(),
        Some("SELECT SUM(trx_amount_usd) FROM transactions WHERE location_city = 'Almaty'")
    );
    assert_eq!(msg.result_format, ResultFormat::Text);
    let total: f64 = MERCHANTS
        .iter()
        .filter(|(_, _, city)| *city == "Almaty")
        .map(|(_, amount, _)| amount * 3.0)
        .sum();
    let rows = msg.result_rows().unwrap();
    let got = rows[0]["SUM(trx_amount_usd)"].as_f64().unwrap();
    assert!((got - total).abs() < 1e-6);
}

#[tokio::test]
async fn test_empty_result_has_no_payload() {
    let llm = MockLlmClient::new().with_response(
        "nobody",
        "SELECT merch_name FROM transactions WHERE trx_amount_usd > 1000000",
    );
    let (pipeline, _state, _dir) = pipeline(llm, 100).await;

    let msg = pipeline
        .execute_query(1, "which merchants had nobody pay over a million?", None)
        .await
        .unwrap();

    assert_eq!(msg.result_format, ResultFormat::Text);
    assert!(msg.result_data.is_none());
    assert!(msg.error_message.is_none());
}

#[tokio::test]
async fn test_row_cap_applies_end_to_end() {
    let llm = MockLlmClient::new().with_response("everything", "SELECT * FROM transactions");
    let (pipeline, _state, _dir) = pipeline(llm, 4).await;

    let msg = pipeline
        .execute_query(1, "show me everything", None)
        .await
        .unwrap();

    assert_eq!(msg.result_format, ResultFormat::Table);
    assert_eq!(msg.result_rows().unwrap().len(), 4);
}

#[tokio::test]
async fn test_drop_is_rejected_and_table_survives() {
    let (pipeline, _state, _dir) = pipeline(MockLlmClient::new(), 100).await;

    let msg = pipeline
        .execute_query(1, "drop the transactions table", None)
        .await
        .unwrap();
    assert_eq!(msg.result_format, ResultFormat::Error);
    assert_eq!(msg.error_message.as_deref(), Some(REJECTION_MESSAGE));
    assert!(msg.sql_query.is_none());
    assert!(msg.result_data.is_none());

    let count = pipeline
        .execute_query(1, "how many transactions?", Some(msg.conversation_id))
        .await
        .unwrap();
    assert_eq!(count.result_format, ResultFormat::Text);
}

#[tokio::test]
async fn test_piggybacked_statement_is_rejected() {
    let llm = MockLlmClient::new().with_response(
        "sneaky",
        "SELECT 1;DELETE FROM transactions",
    );
    let (pipeline, _state, _dir) = pipeline(llm, 100).await;

    let msg = pipeline.execute_query(1, "sneaky", None).await.unwrap();
    assert_eq!(msg.error_message.as_deref(), Some(REJECTION_MESSAGE));
}

#[tokio::test]
async fn test_prose_response_is_rejected() {
    let (pipeline, _state, _dir) = pipeline(MockLlmClient::new(), 100).await;

    let msg = pipeline
        .execute_query(1, "what is the meaning of life?", None)
        .await
        .unwrap();
    assert_eq!(msg.result_format, ResultFormat::Error);
    assert_eq!(msg.error_message.as_deref(), Some(REJECTION_MESSAGE));
}

#[tokio::test]
async fn test_execution_error_is_recorded() {
    let llm = MockLlmClient::new().with_response("ghost", "SELECT * FROM ghost_table");
    let (pipeline, _state, _dir) = pipeline(llm, 100).await;

    let msg = pipeline.execute_query(1, "ghost rows", None).await.unwrap();
    assert_eq!(msg.result_format, ResultFormat::Error);
    let error = msg.error_message.unwrap();
    assert!(error.starts_with("query execution failed: "));
    assert!(error.contains("ghost_table"));
    assert!(msg.result_data.is_none());
}

#[tokio::test]
async fn test_messages_accumulate_in_one_conversation() {
    let (pipeline, state, _dir) = pipeline(MockLlmClient::new(), 100).await;

    let first = pipeline.execute_query(1, "how many?", None).await.unwrap();
    let conv = first.conversation_id;
    pipeline
        .execute_query(1, "top merchants please", Some(conv))
        .await
        .unwrap();
    pipeline
        .execute_query(1, "drop it all", Some(conv))
        .await
        .unwrap();

    let loaded = state.get_conversation(1, conv).await.unwrap();
    let questions: Vec<&str> = loaded
        .messages
        .iter()
        .map(|m| m.user_message.as_str())
        .collect();
    assert_eq!(questions, vec!["how many?", "top merchants please", "drop it all"]);
    assert_eq!(loaded.conversation.title.as_deref(), Some("how many?"));

    let recent = state.recent_questions(conv, 2).await.unwrap();
    assert_eq!(recent, vec!["top merchants please", "drop it all"]);
}

#[tokio::test]
async fn test_other_users_conversation_is_not_found() {
    let (pipeline, _state, _dir) = pipeline(MockLlmClient::new(), 100).await;
    let msg = pipeline.execute_query(1, "how many?", None).await.unwrap();

    let err = pipeline
        .execute_query(2, "how many?", Some(msg.conversation_id))
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::NotFound(_)));
}

#[tokio::test]
async fn test_branch_starts_with_empty_history() {
    let (pipeline, state, _dir) = pipeline(MockLlmClient::new(), 100).await;

    let msg = pipeline.execute_query(1, "how many?", None).await.unwrap();
    let branch = state
        .create_branch(
            1,
            &NewBranch {
                parent_id: msg.conversation_id,
                branch_point_message_id: msg.id,
                title: Some("alternative".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(branch.parent_branch_id, Some(msg.conversation_id));
    assert_eq!(branch.branch_point_message_id, Some(msg.id));
    assert_eq!(branch.user_id, 1);

    assert!(state.recent_questions(branch.id, 10).await.unwrap().is_empty());

    let in_branch = pipeline
        .execute_query(1, "top merchants", Some(branch.id))
        .await
        .unwrap();
    assert_eq!(in_branch.conversation_id, branch.id);

    let parent = state.get_conversation(1, msg.conversation_id).await.unwrap();
    assert_eq!(parent.messages.len(), 1);
}

#[tokio::test]
async fn test_concurrent_questions_are_all_recorded() {
    let (pipeline, state, _dir) = pipeline(MockLlmClient::new(), 100).await;
    let first = pipeline.execute_query(1, "how many?", None).await.unwrap();
    let conv = first.conversation_id;

    let questions = ["top merchants", "how many again?", "drop it", "total in Almaty"];
    let handles: Vec<_> = questions
        .iter()
        .map(|q| {
            let pipeline = pipeline.clone();
            let q = q.to_string();
            tokio::spawn(async move { pipeline.execute_query(1, &q, Some(conv)).await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let loaded = state.get_conversation(1, conv).await.unwrap();
    assert_eq!(loaded.messages.len(), questions.len() + 1);
    for m in &loaded.messages {
        assert!(m.result_data.is_none() || m.error_message.is_none());
    }
}

#[tokio::test]
async fn test_analysis_is_stored_when_enabled() {
    let llm = MockLlmClient::new().with_analysis("Kaspi Store leads the quarter.");
    let (pipeline, _state, _dir) = pipeline(llm, 100).await;
    let pipeline = pipeline.with_analysis(true);

    let msg = pipeline
        .execute_query(1, "top 5 merchants", None)
        .await
        .unwrap();
    assert_eq!(msg.analysis.as_deref(), Some("Kaspi Store leads the quarter."));
    assert_eq!(msg.result_format, ResultFormat::Table);
}

#[tokio::test]
async fn test_stored_message_serializes_with_stable_shape() {
    let (pipeline, _state, _dir) = pipeline(MockLlmClient::new(), 100).await;
    let msg = pipeline.execute_query(1, "how many?", None).await.unwrap();

    let value: Value = serde_json::to_value(&msg).unwrap();
    let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
    assert_eq!(
        keys,
        vec![
            "id",
            "conversation_id",
            "user_message",
            "sql_query",
            "result_data",
            "result_format",
            "error_message",
            "analysis",
            "execution_time_ms",
            "created_at",
        ]
    );
    assert_eq!(value["result_format"], json!("text"));
    assert!(value["created_at"].as_str().unwrap().ends_with('Z'));
}

/// State store whose message writes always fail.
struct ReadOnlyState {
    inner: Arc<StateDb>,
}

#[async_trait]
impl ConversationStore for ReadOnlyState {
    async fn create_conversation(&self, user_id: i64, title: Option<&str>) -> Result<Conversation> {
        self.inner.create_conversation(user_id, title).await
    }

    async fn find_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        self.inner.find_conversation(id).await
    }

    async fn get_conversation(&self, user_id: i64, id: i64) -> Result<ConversationWithMessages> {
        self.inner.get_conversation(user_id, id).await
    }

    async fn list_conversations(&self, user_id: i64, page: PageRequest) -> Result<ConversationPage> {
        self.inner.list_conversations(user_id, page).await
    }

    async fn search_conversations(
        &self,
        user_id: i64,
        keyword: &str,
        page: PageRequest,
    ) -> Result<ConversationPage> {
        self.inner.search_conversations(user_id, keyword, page).await
    }

    async fn rename_conversation(&self, user_id: i64, id: i64, title: &str) -> Result<Conversation> {
        self.inner.rename_conversation(user_id, id, title).await
    }

    async fn delete_conversation(&self, user_id: i64, id: i64) -> Result<()> {
        self.inner.delete_conversation(user_id, id).await
    }

    async fn create_branch(&self, user_id: i64, branch: &NewBranch) -> Result<Conversation> {
        self.inner.create_branch(user_id, branch).await
    }

    async fn append_message(&self, _message: &NewMessage) -> Result<Message> {
        Err(ParleyError::persistence("failed to save message: disk full"))
    }

    async fn recent_questions(&self, conversation_id: i64, limit: usize) -> Result<Vec<String>> {
        self.inner.recent_questions(conversation_id, limit).await
    }

    async fn find_message(&self, user_id: i64, message_id: i64) -> Result<Message> {
        self.inner.find_message(user_id, message_id).await
    }
}

/// One question per outcome: success, then a generation, validation and
/// execution failure.
fn every_outcome() -> (MockLlmClient, [&'static str; 4]) {
    let llm = MockLlmClient::new()
        .with_response("ghost", "SELECT * FROM ghost_table")
        .with_response("mute", "```sql\n```");
    let questions = [
        "How many transactions are there?",
        "mute please",
        "drop the transactions table",
        "ghost rows",
    ];
    (llm, questions)
}

#[tokio::test]
async fn test_stage_failures_are_returned_as_messages() {
    let (llm, questions) = every_outcome();
    let (pipeline, _state, _dir) = pipeline(llm, 100).await;

    let mut formats = Vec::new();
    for question in questions {
        let msg = pipeline.execute_query(1, question, None).await.unwrap();
        formats.push(msg.result_format);
    }

    assert_eq!(
        formats,
        vec![
            ResultFormat::Text,
            ResultFormat::Error,
            ResultFormat::Error,
            ResultFormat::Error
        ]
    );
}

#[tokio::test]
async fn test_failed_write_is_a_hard_error_for_every_outcome() {
    let (state, _dir) = state_db().await;
    let (llm, questions) = every_outcome();
    let pipeline = pipeline_over(Arc::new(ReadOnlyState { inner: state }), llm, 100).await;

    for question in questions {
        let err = pipeline.execute_query(1, question, None).await.unwrap_err();
        assert!(
            matches!(err, ParleyError::Persistence(_)),
            "{question}: {err}"
        );
    }
}

#[tokio::test]
async fn test_closed_state_database_is_a_hard_error() {
    let (pipeline, state, _dir) = pipeline(MockLlmClient::new(), 100).await;
    state.close().await;

    let err = pipeline
        .execute_query(1, "How many transactions are there?", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::Persistence(_)));
}
