use dhenu::chat::{NewMessage, Role};
use dhenu::store::{Store, StoreError};
use serde_json::json;

async fn test_store() -> Store {
    Store::in_memory().await.expect("in-memory store")
}

#[tokio::test]
async fn conversation_lifecycle() {
    let store = test_store().await;

    let convo = store
        .create_conversation(Some("farmer-1".into()), "Wheat rust", "hi")
        .await
        .unwrap();
    assert_eq!(convo.title, "Wheat rust");
    assert_eq!(convo.language, "hi");
    assert!(convo.updated_at >= convo.created_at);

    let fetched = store.get_conversation(&convo.id).await.unwrap();
    assert_eq!(fetched.id, convo.id);
    assert_eq!(fetched.user_id.as_deref(), Some("farmer-1"));

    // Fresh conversation has no history.
    let messages = store.get_conversation_messages(&convo.id).await.unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn unknown_conversation_is_a_typed_not_found() {
    let store = test_store().await;

    let err = store.get_conversation("nope").await.unwrap_err();
    assert!(matches!(err, StoreError::ConversationNotFound(_)));

    let err = store
        .create_message("nope", Role::User, NewMessage::text("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ConversationNotFound(_)));

    let err = store.touch_conversation("nope").await.unwrap_err();
    assert!(matches!(err, StoreError::ConversationNotFound(_)));
}

#[tokio::test]
async fn messages_come_back_in_insertion_order() {
    let store = test_store().await;
    let convo = store.create_conversation(None, "Ordering", "en").await.unwrap();

    for i in 0..5 {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        store
            .create_message(&convo.id, role, NewMessage::text(format!("message {i}")))
            .await
            .unwrap();
    }

    let messages = store.get_conversation_messages(&convo.id).await.unwrap();
    assert_eq!(messages.len(), 5);
    for (i, msg) in messages.iter().enumerate() {
        assert_eq!(msg.content, format!("message {i}"));
        assert_eq!(msg.conversation_id, convo.id);
    }
    for pair in messages.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }
}

#[tokio::test]
async fn metadata_round_trips_deep_equal() {
    let store = test_store().await;
    let convo = store.create_conversation(None, "Metadata", "en").await.unwrap();

    let metadata = json!({
        "diagnosis": "Leaf rust",
        "confidence": 88,
        "treatment": ["spray", "prune"],
        "nested": { "severity": "high", "zones": [1, 2, 3] }
    });

    let created = store
        .create_message(
            &convo.id,
            Role::Assistant,
            NewMessage {
                content: "analysis".into(),
                image_url: Some("/uploads/leaf.jpg".into()),
                audio_url: None,
                metadata: Some(metadata.clone()),
            },
        )
        .await
        .unwrap();
    assert_eq!(created.metadata.as_ref(), Some(&metadata));

    let fetched = store.get_conversation_messages(&convo.id).await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].metadata.as_ref(), Some(&metadata));
    assert_eq!(fetched[0].image_url.as_deref(), Some("/uploads/leaf.jpg"));
}

#[tokio::test]
async fn touch_refreshes_updated_at() {
    let store = test_store().await;
    let convo = store.create_conversation(None, "Touch", "en").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store.touch_conversation(&convo.id).await.unwrap();

    let fetched = store.get_conversation(&convo.id).await.unwrap();
    assert!(fetched.updated_at > convo.updated_at);
    assert!(fetched.updated_at >= fetched.created_at);
}

#[tokio::test]
async fn user_conversations_are_scoped_and_newest_first() {
    let store = test_store().await;

    let first = store
        .create_conversation(Some("farmer-1".into()), "First", "en")
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = store
        .create_conversation(Some("farmer-1".into()), "Second", "en")
        .await
        .unwrap();
    store
        .create_conversation(Some("farmer-2".into()), "Other", "en")
        .await
        .unwrap();
    store.create_conversation(None, "Anonymous", "en").await.unwrap();

    let listed = store.get_user_conversations("farmer-1").await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);
}
