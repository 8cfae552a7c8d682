use palaver_persist::{
    InMemoryStore, PersistError, StoredMessage, StoredMessageStatus, StoredRole, StoredToolCall,
    Thread, ThreadQuery, ThreadStore, Visibility,
};
use serde_json::json;
use std::sync::Arc;

fn store() -> Arc<dyn ThreadStore> {
    Arc::new(InMemoryStore::new())
}

#[tokio::test]
async fn test_thread_metadata_updates() {
    let store = store();
    store
        .create_thread(Thread::new("t1", "alice").with_title("Draft"))
        .await
        .unwrap();

    store.change_title("t1", "Trip planning").await.unwrap();
    store.set_visibility("t1", Visibility::Public).await.unwrap();
    store.set_pinned("t1", true).await.unwrap();

    let thread = store.get_thread("t1").await.unwrap().unwrap();
    assert_eq!(thread.title.as_deref(), Some("Trip planning"));
    assert_eq!(thread.visibility, Visibility::Public);
    assert!(thread.pinned);
    assert!(thread.updated_at >= thread.created_at);
}

#[tokio::test]
async fn test_updates_on_unknown_thread_fail() {
    let store = store();
    assert!(matches!(
        store.change_title("ghost", "x").await,
        Err(PersistError::ThreadNotFound(_))
    ));
    assert!(matches!(
        store.delete_thread("ghost").await,
        Err(PersistError::ThreadNotFound(_))
    ));
}

#[tokio::test]
async fn test_messages_keep_conversation_order() {
    let store = store();
    store.create_thread(Thread::new("t1", "alice")).await.unwrap();

    let call = StoredToolCall::new("call_1", "weather", json!({"city": "Lisbon"}));
    store
        .save_messages(vec![
            StoredMessage::user("t1", "weather?"),
            StoredMessage::assistant("t1", "").with_tool_call(call),
            StoredMessage::tool("t1", "call_1", r#"{"temp":21}"#),
            StoredMessage::assistant("t1", "It is 21 degrees."),
        ])
        .await
        .unwrap();

    let messages = store.get_messages("t1").await.unwrap();
    let roles: Vec<StoredRole> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            StoredRole::User,
            StoredRole::Assistant,
            StoredRole::Tool,
            StoredRole::Assistant
        ]
    );
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_1"));
    assert!(messages.iter().all(|m| m.status == StoredMessageStatus::Done));
}

#[tokio::test]
async fn test_list_threads_respects_limit_and_owner() {
    let store = store();
    for i in 0..5 {
        store
            .create_thread(Thread::new(format!("t{i}"), "alice"))
            .await
            .unwrap();
    }
    store.create_thread(Thread::new("b", "bob")).await.unwrap();

    let threads = store
        .list_threads(ThreadQuery::for_user("alice").limit(3))
        .await
        .unwrap();
    assert_eq!(threads.len(), 3);
    assert!(threads.iter().all(|t| t.user_id == "alice"));
}

#[tokio::test]
async fn test_projects_are_scoped_to_user() {
    let store = store();
    store.create_project("alice", "Work").await.unwrap();
    store.create_project("alice", "Home").await.unwrap();
    store.create_project("bob", "Garden").await.unwrap();

    let names: Vec<String> = store
        .list_projects("alice")
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["Work", "Home"]);
}

#[test]
fn test_stored_message_serializes_lowercase_role() {
    let message = StoredMessage::user("t1", "hi");
    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(value["role"], "user");
    assert_eq!(value["status"], "done");
}
