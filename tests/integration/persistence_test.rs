//! Integration tests for the conversation store.

use super::common::state_db;
use db_parley::error::ParleyError;
use db_parley::persistence::{
    ConversationStore, NewBranch, NewMessage, PageRequest, ResultFormat, StateDb,
};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

#[tokio::test]
async fn test_state_db_creation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");

    let db = StateDb::open(&path).await.unwrap();
    assert!(path.exists());
    db.close().await;
}

#[tokio::test]
async fn test_conversation_lifecycle() {
    let (db, _dir) = state_db().await;

    let conv = db.create_conversation(1, Some("Q1 review")).await.unwrap();
    assert_eq!(conv.user_id, 1);
    assert!(conv.parent_branch_id.is_none());

    db.append_message(&NewMessage::success(
        conv.id,
        "how many?",
        "SELECT COUNT(*) FROM transactions",
        Some(r#"[{"count":21}]"#.to_string()),
        ResultFormat::Text,
        8,
    ))
    .await
    .unwrap();
    db.append_message(&NewMessage::failure(
        conv.id,
        "drop it",
        "only read-only statements are permitted",
        2,
    ))
    .await
    .unwrap();

    let loaded = db.get_conversation(1, conv.id).await.unwrap();
    assert_eq!(loaded.messages.len(), 2);
    assert_eq!(loaded.messages[0].result_format, ResultFormat::Text);
    assert_eq!(loaded.messages[1].result_format, ResultFormat::Error);
    assert!(loaded.messages[1].result_data.is_none());

    let renamed = db.rename_conversation(1, conv.id, "Q1 wrap-up").await.unwrap();
    assert_eq!(renamed.title.as_deref(), Some("Q1 wrap-up"));

    db.delete_conversation(1, conv.id).await.unwrap();
    let err = db.get_conversation(1, conv.id).await.unwrap_err();
    assert!(matches!(err, ParleyError::NotFound(_)));

    let message_id = loaded.messages[0].id;
    assert!(matches!(
        db.find_message(1, message_id).await.unwrap_err(),
        ParleyError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_list_orders_by_latest_activity() {
    let (db, _dir) = state_db().await;

    let older = db.create_conversation(1, Some("older")).await.unwrap();
    let newer = db.create_conversation(1, Some("newer")).await.unwrap();

    let page = db.list_conversations(1, PageRequest::default()).await.unwrap();
    assert_eq!(page.conversations[0].id, newer.id);

    db.append_message(&NewMessage::failure(older.id, "q", "e", 1))
        .await
        .unwrap();

    let page = db.list_conversations(1, PageRequest::default()).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.limit, 50);
    assert_eq!(page.conversations[0].id, older.id);
}

#[tokio::test]
async fn test_list_paging() {
    let (db, _dir) = state_db().await;
    for i in 0..5 {
        db.create_conversation(9, Some(&format!("c{i}"))).await.unwrap();
    }

    let page = db
        .list_conversations(9, PageRequest::new(Some(2), Some(4)))
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.conversations.len(), 1);
    assert_eq!(page.conversations[0].title.as_deref(), Some("c0"));
}

#[tokio::test]
async fn test_search_is_scoped_to_user() {
    let (db, _dir) = state_db().await;
    db.create_conversation(1, Some("Almaty cafes")).await.unwrap();
    db.create_conversation(2, Some("Almaty taxis")).await.unwrap();

    let page = db
        .search_conversations(1, "almaty", PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.conversations[0].title.as_deref(), Some("Almaty cafes"));
}

#[tokio::test]
async fn test_branch_tree() {
    let (db, _dir) = state_db().await;
    let root = db.create_conversation(1, Some("root")).await.unwrap();
    let m1 = db
        .append_message(&NewMessage::failure(root.id, "first", "e", 1))
        .await
        .unwrap();
    db.append_message(&NewMessage::failure(root.id, "second", "e", 1))
        .await
        .unwrap();

    let branch = db
        .create_branch(
            1,
            &NewBranch {
                parent_id: root.id,
                branch_point_message_id: m1.id,
                title: None,
            },
        )
        .await
        .unwrap();
    assert!(branch.is_branch());

    let nested_point = db
        .append_message(&NewMessage::failure(branch.id, "in branch", "e", 1))
        .await
        .unwrap();
    let nested = db
        .create_branch(
            1,
            &NewBranch {
                parent_id: branch.id,
                branch_point_message_id: nested_point.id,
                title: Some("nested".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(nested.parent_branch_id, Some(branch.id));

    assert_eq!(db.recent_questions(root.id, 10).await.unwrap().len(), 2);
    assert_eq!(db.recent_questions(branch.id, 10).await.unwrap(), vec!["in branch"]);
}

#[tokio::test]
async fn test_branch_with_unknown_message_is_not_found() {
    let (db, _dir) = state_db().await;
    let root = db.create_conversation(1, None).await.unwrap();

    let err = db
        .create_branch(
            1,
            &NewBranch {
                parent_id: root.id,
                branch_point_message_id: 4242,
                title: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::NotFound(_)));
}
