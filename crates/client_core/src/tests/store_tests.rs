use chrono::{Duration, TimeZone, Utc};

use super::*;

fn message(id: &str, sender: &str, minute: i64, status: Option<MessageStatus>) -> ChatMessage {
    ChatMessage {
        id: MessageId::from(id),
        conversation_id: ConversationId::from("peer"),
        text: format!("text {id}"),
        sender_id: UserId::from(sender),
        sender_name: sender.to_uppercase(),
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap() + Duration::minutes(minute),
        status,
        attachment: None,
        reactions: Vec::new(),
        is_forwarded: false,
        is_group: false,
        reply_to: None,
    }
}

fn key() -> ConversationId {
    ConversationId::from("peer")
}

fn status_of(store: &ConversationStore, id: &str) -> Option<MessageStatus> {
    store
        .find(&key(), &MessageId::from(id))
        .and_then(LocalMessage::status)
}

#[test]
fn duplicate_ids_are_not_appended() {
    let mut store = ConversationStore::new();
    let first = message("m1", "peer", 0, None);
    assert_eq!(
        store.upsert_message(&key(), first.clone(), Persistence::Pending),
        Upsert::Inserted
    );
    assert_eq!(
        store.upsert_message(&key(), first, Persistence::Confirmed),
        Upsert::Existing
    );
    assert_eq!(store.messages(&key()).len(), 1);
    assert_eq!(store.messages(&key())[0].persistence, Persistence::Pending);
}

#[test]
fn status_only_moves_forward() {
    let mut store = ConversationStore::new();
    store.upsert_message(&key(), message("m1", "me", 0, Some(MessageStatus::Sent)), Persistence::Confirmed);

    assert!(store.patch_message_status(&key(), &MessageId::from("m1"), MessageStatus::Read, StatusOrigin::Receipt));
    assert!(!store.patch_message_status(&key(), &MessageId::from("m1"), MessageStatus::Delivered, StatusOrigin::Receipt));
    assert_eq!(status_of(&store, "m1"), Some(MessageStatus::Read));
    assert!(!store.patch_message_status(&key(), &MessageId::from("missing"), MessageStatus::Read, StatusOrigin::Local));
}

#[test]
fn receipt_confirms_optimistic_delivery() {
    let mut store = ConversationStore::new();
    store.upsert_message(&key(), message("m1", "me", 0, Some(MessageStatus::Sent)), Persistence::Confirmed);
    store.patch_message_status(&key(), &MessageId::from("m1"), MessageStatus::Delivered, StatusOrigin::Optimistic);
    assert_eq!(store.messages(&key())[0].status_origin, StatusOrigin::Optimistic);

    let advanced = store.apply_receipt(
        &key(),
        &UserId::from("me"),
        Some(&[MessageId::from("m1")]),
        MessageStatus::Delivered,
    );
    assert!(advanced.is_empty());
    assert_eq!(store.messages(&key())[0].status_origin, StatusOrigin::Receipt);
}

#[test]
fn receipts_only_touch_the_authors_messages() {
    let mut store = ConversationStore::new();
    store.upsert_message(&key(), message("m1", "me", 0, Some(MessageStatus::Sent)), Persistence::Confirmed);
    store.upsert_message(&key(), message("m2", "peer", 1, None), Persistence::Confirmed);
    store.upsert_message(&key(), message("m3", "me", 2, Some(MessageStatus::Delivered)), Persistence::Confirmed);

    let advanced = store.apply_receipt(&key(), &UserId::from("me"), None, MessageStatus::Read);
    assert_eq!(advanced, vec![MessageId::from("m1"), MessageId::from("m3")]);
    assert_eq!(status_of(&store, "m2"), None);

    let again = store.apply_receipt(&key(), &UserId::from("me"), None, MessageStatus::Delivered);
    assert!(again.is_empty());
}

#[test]
fn out_of_order_receipts_settle_on_read() {
    let mut store = ConversationStore::new();
    store.upsert_message(&key(), message("m1", "me", 0, Some(MessageStatus::Sent)), Persistence::Confirmed);
    let ids = [MessageId::from("m1")];

    store.apply_receipt(&key(), &UserId::from("me"), Some(&ids), MessageStatus::Read);
    store.apply_receipt(&key(), &UserId::from("me"), Some(&ids), MessageStatus::Delivered);
    assert_eq!(status_of(&store, "m1"), Some(MessageStatus::Read));
}

#[test]
fn reactions_behave_as_a_set() {
    let mut store = ConversationStore::new();
    store.upsert_message(&key(), message("m1", "peer", 0, None), Persistence::Confirmed);
    let id = MessageId::from("m1");
    let thumbs = Reaction {
        emoji: "👍".into(),
        user_id: UserId::from("me"),
    };

    assert!(store.patch_reactions(&key(), &id, thumbs.clone(), ReactionAction::Add));
    assert!(!store.patch_reactions(&key(), &id, thumbs.clone(), ReactionAction::Add));
    assert_eq!(store.find(&key(), &id).map(|m| m.message.reactions.len()), Some(1));
    assert!(store.patch_reactions(&key(), &id, thumbs.clone(), ReactionAction::Remove));
    assert!(!store.patch_reactions(&key(), &id, thumbs, ReactionAction::Remove));
    assert_eq!(store.find(&key(), &id).map(|m| m.message.reactions.len()), Some(0));
}

#[test]
fn merge_appends_new_and_advances_known() {
    let mut store = ConversationStore::new();
    store.upsert_message(&key(), message("m1", "me", 0, Some(MessageStatus::Sent)), Persistence::Pending);

    let inserted = store.merge_messages(
        &key(),
        vec![
            message("m1", "me", 0, Some(MessageStatus::Read)),
            message("m2", "peer", 1, None),
        ],
    );
    assert_eq!(inserted, vec![MessageId::from("m2")]);
    assert_eq!(status_of(&store, "m1"), Some(MessageStatus::Read));
    assert_eq!(store.messages(&key())[0].persistence, Persistence::Confirmed);
}

#[test]
fn history_replace_keeps_newer_and_unsaved_entries() {
    let mut store = ConversationStore::new();
    store.upsert_message(&key(), message("old", "peer", 0, None), Persistence::Confirmed);
    store.upsert_message(&key(), message("unsaved", "me", 1, Some(MessageStatus::Queued)), Persistence::Failed);
    let watermark = store.watermark();
    store.upsert_message(&key(), message("live", "peer", 3, None), Persistence::Pending);

    store.replace_history(
        &key(),
        vec![message("stored", "peer", 2, Some(MessageStatus::Delivered))],
        watermark,
    );

    let ids: Vec<String> = store
        .snapshot(&key())
        .into_iter()
        .map(|message| message.id.to_string())
        .collect();
    assert_eq!(ids, vec!["unsaved", "stored", "live"]);
}

#[test]
fn history_replace_never_regresses_status() {
    let mut store = ConversationStore::new();
    store.upsert_message(&key(), message("m1", "me", 0, Some(MessageStatus::Sent)), Persistence::Confirmed);
    store.patch_message_status(&key(), &MessageId::from("m1"), MessageStatus::Read, StatusOrigin::Receipt);
    let watermark = store.watermark();

    store.replace_history(&key(), vec![message("m1", "me", 0, Some(MessageStatus::Sent))], watermark);
    assert_eq!(status_of(&store, "m1"), Some(MessageStatus::Read));
    assert_eq!(store.messages(&key())[0].status_origin, StatusOrigin::Receipt);
}

#[test]
fn typing_entries_disappear_when_empty() {
    let mut store = ConversationStore::new();
    let user = UserId::from("peer");
    store.set_typing(&key(), &user, Some("Peer".into()));
    assert_eq!(
        store.typing(&key()).map(|typing| typing.len()),
        Some(1)
    );
    store.set_typing(&key(), &user, None);
    assert!(store.typing(&key()).is_none());
}

#[test]
fn unread_counters() {
    let mut store = ConversationStore::new();
    assert_eq!(store.increment_unread(&key()), 1);
    assert_eq!(store.increment_unread(&key()), 2);
    assert_eq!(store.add_unread(&key(), 3), 5);
    assert_eq!(store.add_unread(&ConversationId::from("g-1"), 0), 0);
    assert_eq!(store.unread_counts().len(), 1);
    assert_eq!(store.add_unread(&ConversationId::from("g-1"), 4), 4);
    assert_eq!(store.unread_counts().len(), 2);

    store.clear_unread(&ConversationId::from("g-1"));
    store.clear_unread(&key());
    assert_eq!(store.unread(&key()), 0);
    assert!(store.unread_counts().is_empty());
}

#[test]
fn discard_only_drops_unsaved_messages() {
    let mut store = ConversationStore::new();
    store.upsert_message(&key(), message("m1", "me", 0, Some(MessageStatus::Sent)), Persistence::Confirmed);
    store.upsert_message(&key(), message("m2", "bot", 1, Some(MessageStatus::Read)), Persistence::Pending);

    assert!(!store.discard_unconfirmed(&key(), &MessageId::from("m1")));
    assert!(store.discard_unconfirmed(&key(), &MessageId::from("m2")));
    assert!(!store.discard_unconfirmed(&ConversationId::from("other"), &MessageId::from("m1")));
    assert_eq!(store.messages(&key()).len(), 1);
    assert_eq!(store.messages(&key())[0].id(), &MessageId::from("m1"));
}

#[test]
fn queued_outgoing_requires_a_saved_copy() {
    let mut store = ConversationStore::new();
    let me = UserId::from("me");
    store.upsert_message(&key(), message("saved", "me", 0, Some(MessageStatus::Queued)), Persistence::Confirmed);
    store.upsert_message(&key(), message("failed", "me", 1, Some(MessageStatus::Queued)), Persistence::Failed);
    store.upsert_message(&key(), message("theirs", "peer", 2, Some(MessageStatus::Queued)), Persistence::Confirmed);

    assert_eq!(
        store.queued_outgoing(&me),
        vec![(key(), MessageId::from("saved"))]
    );
    assert_eq!(
        store.unread_incoming(&key(), &me),
        vec![MessageId::from("theirs")]
    );
}
