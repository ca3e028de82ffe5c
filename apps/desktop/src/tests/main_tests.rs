use shared::domain::ConversationId;

use super::*;

fn unread(count: u32) -> SyncEvent {
    SyncEvent::UnreadChanged {
        conversation_id: ConversationId::from("u2"),
        count,
    }
}

#[tokio::test]
async fn printer_keeps_going_after_lagging() {
    let (tx, mut events) = broadcast::channel(2);
    for count in 1..=4 {
        tx.send(unread(count)).expect("receiver alive");
    }
    drop(tx);

    let mut seen = Vec::new();
    while let Some(event) = next_event(&mut events).await {
        seen.push(event);
    }
    assert_eq!(seen, vec![unread(3), unread(4)]);
}
