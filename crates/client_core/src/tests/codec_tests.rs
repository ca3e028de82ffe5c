use chrono::{TimeZone, Utc};
use shared::{
    domain::{ConversationId, MessageId, MessageStatus, PresenceState, UserId},
    protocol::{ChatMessage, Receipt, TypingIndicator, TypingState},
};

use super::*;

fn sample_message() -> ChatMessage {
    ChatMessage {
        id: MessageId::from("m-1"),
        conversation_id: ConversationId::from("u2"),
        text: "hello".into(),
        sender_id: UserId::from("u1"),
        sender_name: "Ana".into(),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        status: Some(MessageStatus::Sent),
        attachment: None,
        reactions: Vec::new(),
        is_forwarded: false,
        is_group: false,
        reply_to: None,
    }
}

#[test]
fn encodes_chat_with_type_tag_and_iso_timestamp() {
    let payload = encode(&ChatEvent::Chat(sample_message())).expect("encode chat");
    let value: serde_json::Value = serde_json::from_slice(&payload).expect("valid json");

    assert_eq!(value["type"], "chat");
    assert_eq!(value["conversationId"], "u2");
    assert_eq!(value["timestamp"], "2024-05-01T12:30:00.000Z");
    assert_eq!(value["status"], "sent");
    assert!(value.get("reactions").is_none());
}

#[test]
fn decodes_epoch_millis_and_legacy_contact_id() {
    let raw = br#"{
        "type": "chat",
        "id": "m-9",
        "contactId": "g-1",
        "text": "hi all",
        "senderId": "u3",
        "senderName": "Caro",
        "timestamp": 1714566600000,
        "isGroup": true
    }"#;

    let ChatEvent::Chat(message) = decode(raw).expect("decode chat") else {
        panic!("expected a chat event");
    };
    assert_eq!(message.conversation_id, ConversationId::from("g-1"));
    assert_eq!(
        message.timestamp,
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    );
    assert!(message.is_group);
    assert_eq!(message.status, None);
}

#[test]
fn receipt_without_ids_decodes_as_legacy_form() {
    let raw = br#"{"type":"read_receipt","conversationId":"u1","readerId":"u2"}"#;
    let event = decode(raw).expect("decode receipt");
    assert_eq!(
        event,
        ChatEvent::ReadReceipt(Receipt {
            conversation_id: ConversationId::from("u1"),
            reader_id: UserId::from("u2"),
            message_ids: None,
        })
    );
}

#[test]
fn typing_round_trips_through_the_codec() {
    let event = ChatEvent::Typing(TypingIndicator {
        conversation_id: ConversationId::from("u2"),
        user_id: UserId::from("u1"),
        user_name: "Ana".into(),
        state: TypingState::Start,
    });
    let decoded = decode(&encode(&event).expect("encode typing")).expect("decode typing");
    assert_eq!(decoded, event);
}

#[test]
fn malformed_payloads_are_dropped() {
    assert!(decode_or_log("chat/u1-u2", b"not json").is_none());
    assert!(decode_or_log("chat/u1-u2", br#"{"type":"unknown"}"#).is_none());
    assert!(matches!(
        decode(br#"{"type":"chat","id":"x"}"#),
        Err(CodecError::Decode(_))
    ));
}

#[test]
fn presence_payload_uses_plain_status_names() {
    let update = PresenceUpdate {
        status: PresenceState::Offline,
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
    };
    let payload = encode_presence(&update).expect("encode presence");
    let value: serde_json::Value = serde_json::from_slice(&payload).expect("valid json");
    assert_eq!(value["status"], "offline");
    assert_eq!(decode_presence(&payload).expect("decode presence"), update);
}
