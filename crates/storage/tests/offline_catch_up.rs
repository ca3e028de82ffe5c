use chrono::{Duration, Utc};
use shared::{
    domain::{ConversationId, LocalUser, MessageId, MessageStatus, PresenceState, UserId},
    protocol::ChatMessage,
};
use storage::{ContactStore, MessageStore, Storage};

fn message_to(recipient: &str, sender: &str, id: &str, offset_secs: i64) -> ChatMessage {
    ChatMessage {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(recipient),
        text: "while you were away".into(),
        sender_id: UserId::from(sender),
        sender_name: sender.into(),
        timestamp: Utc::now() + Duration::seconds(offset_secs),
        status: Some(MessageStatus::Sent),
        attachment: None,
        reactions: Vec::new(),
        is_forwarded: false,
        is_group: false,
        reply_to: None,
    }
}

#[tokio::test]
async fn messages_sent_during_outage_are_returned_once_on_catch_up() {
    let temp = tempfile::tempdir().expect("tempdir");
    let url = format!(
        "sqlite://{}",
        temp.path().join("chat.db").to_string_lossy().replace('\\', "/")
    );
    let storage = Storage::new(&url).await.expect("db");
    let u1 = UserId::from("u1");
    storage
        .upsert_user(&LocalUser::new("u1", "User One"))
        .await
        .expect("u1");
    storage
        .upsert_user(&LocalUser::new("u2", "User Two"))
        .await
        .expect("u2");

    storage
        .update_user_status(&u1, PresenceState::Offline, Utc::now())
        .await
        .expect("u1 offline");

    storage
        .save_message(&message_to("u1", "u2", "away-1", 1))
        .await
        .expect("first");
    storage
        .save_message(&message_to("u1", "u2", "away-2", 2))
        .await
        .expect("second");

    let batch = storage
        .get_unread_since(&u1, None, 500)
        .await
        .expect("catch up");
    let missed = &batch[&ConversationId::from("u2")];
    assert_eq!(missed.len(), 2);
    assert_eq!(missed[0].id, MessageId::from("away-1"));
    assert_eq!(missed[1].id, MessageId::from("away-2"));
}
