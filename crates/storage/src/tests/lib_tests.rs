use chrono::{Duration, TimeZone, Utc};

use super::*;

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
}

fn direct(id: &str, from: &str, to: &str, minute: u32) -> ChatMessage {
    ChatMessage {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(to),
        text: format!("text {id}"),
        sender_id: UserId::from(from),
        sender_name: from.to_uppercase(),
        timestamp: at(minute),
        status: Some(MessageStatus::Sent),
        attachment: None,
        reactions: Vec::new(),
        is_forwarded: false,
        is_group: false,
        reply_to: None,
    }
}

fn in_group(id: &str, from: &str, group: &str, minute: u32) -> ChatMessage {
    ChatMessage {
        conversation_id: ConversationId::from(group),
        is_group: true,
        ..direct(id, from, group, minute)
    }
}

async fn storage_with_users() -> Storage {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    for (id, name) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
        storage
            .upsert_user(&LocalUser::new(id, name))
            .await
            .expect("user");
    }
    storage
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("chat.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn direct_history_contains_both_directions_in_time_order() {
    let storage = storage_with_users().await;
    storage
        .save_message(&direct("m2", "bob", "alice", 2))
        .await
        .expect("save");
    storage
        .save_message(&direct("m1", "alice", "bob", 1))
        .await
        .expect("save");
    storage
        .save_message(&direct("m3", "carol", "alice", 3))
        .await
        .expect("save");

    let history = storage
        .get_messages(&UserId::from("alice"), &Conversation::direct("bob"), 50)
        .await
        .expect("history");
    let ids: Vec<_> = history.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert_eq!(history[1].conversation_id, ConversationId::from("alice"));
}

#[tokio::test]
async fn saving_same_message_twice_keeps_one_row() {
    let storage = storage_with_users().await;
    let message = direct("m1", "alice", "bob", 1);
    storage.save_message(&message).await.expect("first save");
    storage.save_message(&message).await.expect("second save");

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(storage.pool())
        .await
        .expect("count");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn status_updates_never_move_backwards() {
    let storage = storage_with_users().await;
    storage
        .save_message(&direct("m1", "alice", "bob", 1))
        .await
        .expect("save");

    let id = MessageId::from("m1");
    storage
        .update_message_status(&id, MessageStatus::Read)
        .await
        .expect("read");
    storage
        .update_message_status(&id, MessageStatus::Delivered)
        .await
        .expect("late delivered");

    let history = storage
        .get_messages(&UserId::from("alice"), &Conversation::direct("bob"), 50)
        .await
        .expect("history");
    assert_eq!(history[0].status, Some(MessageStatus::Read));
}

#[tokio::test]
async fn reactions_are_a_set_per_user_and_emoji() {
    let storage = storage_with_users().await;
    storage
        .save_message(&direct("m1", "alice", "bob", 1))
        .await
        .expect("save");

    let id = MessageId::from("m1");
    let bob = UserId::from("bob");
    storage.add_reaction(&id, &bob, "👍").await.expect("add");
    storage.add_reaction(&id, &bob, "👍").await.expect("add again");
    storage
        .remove_reaction(&id, &bob, "🎉")
        .await
        .expect("remove absent");

    let history = storage
        .get_messages(&bob, &Conversation::direct("alice"), 50)
        .await
        .expect("history");
    assert_eq!(
        history[0].reactions,
        vec![Reaction {
            emoji: "👍".into(),
            user_id: bob.clone(),
        }]
    );

    storage.remove_reaction(&id, &bob, "👍").await.expect("remove");
    let history = storage
        .get_messages(&bob, &Conversation::direct("alice"), 50)
        .await
        .expect("history");
    assert!(history[0].reactions.is_empty());
}

#[tokio::test]
async fn unread_since_groups_direct_and_group_messages_by_conversation() {
    let storage = storage_with_users().await;
    let alice = UserId::from("alice");
    storage
        .add_contact(
            &alice,
            &Contact::group("team", "Team", alice.clone(), vec![UserId::from("bob")]),
        )
        .await
        .expect("group contact");

    storage
        .save_message(&direct("old", "bob", "alice", 1))
        .await
        .expect("save");
    storage
        .save_message(&direct("d1", "bob", "alice", 10))
        .await
        .expect("save");
    storage
        .save_message(&direct("d2", "bob", "alice", 11))
        .await
        .expect("save");
    storage
        .save_message(&in_group("g1", "carol", "team", 12))
        .await
        .expect("save");
    storage
        .save_message(&direct("mine", "alice", "bob", 13))
        .await
        .expect("save");

    let batch = storage
        .get_unread_since(&alice, Some(at(5)), 100)
        .await
        .expect("unread");

    let direct_ids: Vec<_> = batch[&ConversationId::from("bob")]
        .iter()
        .map(|m| m.id.as_str())
        .collect();
    assert_eq!(direct_ids, vec!["d1", "d2"]);
    assert_eq!(batch[&ConversationId::from("team")].len(), 1);
    assert_eq!(batch.len(), 2);
}

#[tokio::test]
async fn unread_since_defaults_to_last_logout() {
    let storage = storage_with_users().await;
    let alice = UserId::from("alice");
    storage
        .save_message(&direct("before", "bob", "alice", 1))
        .await
        .expect("save");
    storage
        .update_user_status(&alice, PresenceState::Offline, at(5))
        .await
        .expect("logout");
    storage
        .save_message(&direct("after", "bob", "alice", 6))
        .await
        .expect("save");

    assert_eq!(
        storage.last_logout_at(&alice).await.expect("logout time"),
        Some(at(5))
    );
    let batch = storage
        .get_unread_since(&alice, None, 100)
        .await
        .expect("unread");
    assert_eq!(batch[&ConversationId::from("bob")].len(), 1);
    assert_eq!(batch[&ConversationId::from("bob")][0].id.as_str(), "after");
}

#[tokio::test]
async fn read_messages_are_not_unread() {
    let storage = storage_with_users().await;
    storage
        .save_message(&direct("d1", "bob", "alice", 10))
        .await
        .expect("save");
    storage
        .update_message_status(&MessageId::from("d1"), MessageStatus::Read)
        .await
        .expect("read");

    let batch = storage
        .get_unread_since(&UserId::from("alice"), Some(at(0)), 100)
        .await
        .expect("unread");
    assert!(batch.is_empty());
}

#[tokio::test]
async fn online_status_keeps_previous_logout_time() {
    let storage = storage_with_users().await;
    let bob = UserId::from("bob");
    storage
        .update_user_status(&bob, PresenceState::Offline, at(1))
        .await
        .expect("offline");
    storage
        .update_user_status(&bob, PresenceState::Online, at(1) + Duration::minutes(3))
        .await
        .expect("online");

    assert_eq!(
        storage.user_status(&bob).await.expect("status"),
        Some(PresenceState::Online)
    );
    assert_eq!(storage.last_logout_at(&bob).await.expect("logout"), Some(at(1)));
}

#[tokio::test]
async fn contacts_round_trip_with_presence_from_users() {
    let storage = storage_with_users().await;
    let alice = UserId::from("alice");
    let mut bob = Contact::person("bob", "Bob");
    bob.is_pinned = true;
    storage.add_contact(&alice, &bob).await.expect("add bob");
    storage
        .add_contact(
            &alice,
            &Contact::group("team", "Team", alice.clone(), vec![UserId::from("bob")]),
        )
        .await
        .expect("add team");
    storage
        .update_user_status(&UserId::from("bob"), PresenceState::Online, at(2))
        .await
        .expect("bob online");

    let contacts = storage.list_contacts(&alice).await.expect("contacts");
    assert_eq!(contacts.len(), 2);
    assert_eq!(contacts[0].id, ConversationId::from("bob"));
    assert_eq!(contacts[0].status, PresenceState::Online);
    assert!(contacts[1].is_group);
    assert_eq!(contacts[1].member_ids, vec![UserId::from("bob")]);
}
