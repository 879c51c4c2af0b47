//! Classification of inbound client frames: ping, typing, read receipts and
//! regular messages.

use std::sync::Arc;

use chrono::Utc;
use relay_common::id::{prefix, prefixed_ulid};

use crate::task::spawn_guarded;
use crate::AppState;

use super::message::{Message, MessageType, ServerNotice};
use super::session::Session;

/// Process one inbound text frame from `session`.
///
/// Malformed or invalid frames are answered with an `error` notice to the
/// sender and go no further.
pub async fn handle_inbound(state: &AppState, session: &Arc<Session>, raw: &str) {
    let mut message: Message = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(err) => {
            tracing::debug!(client_id = %session.id, %err, "unparseable frame");
            session.notify(&ServerNotice::error("Invalid message format"));
            return;
        }
    };

    if message.is(&MessageType::Ping) {
        session.notify(&ServerNotice::ping(Utc::now()));
        return;
    }

    if message.sender_id.as_deref().map_or(true, |s| s.trim().is_empty()) {
        message.sender_id = Some(session.user_id.clone());
    }

    if let Err(err) = message.validate() {
        tracing::warn!(client_id = %session.id, kind = message.kind.as_ref().map_or("", MessageType::as_str), %err, "rejected message");
        session.notify(&ServerNotice::error(err.to_string()));
        return;
    }

    match message.kind {
        Some(MessageType::Typing) => relay_typing(state, session, message).await,
        Some(MessageType::ReadReceipt) => relay_read_receipt(state, session, message).await,
        _ => relay_message(state, session, message).await,
    }
}

/// Typing indicators are routed and never persisted.
async fn relay_typing(state: &AppState, session: &Session, message: Message) {
    let request_id = prefixed_ulid(prefix::TYPING);
    tracing::debug!(
        %request_id,
        client_id = %session.id,
        typing = message.is_typing,
        conversation_id = message.conversation_id.as_deref().unwrap_or_default(),
        "typing status"
    );
    state.router.deliver(&request_id, &message).await;
}

/// Read receipts are routed and, independently, persisted fire-and-forget.
async fn relay_read_receipt(state: &AppState, session: &Session, message: Message) {
    let request_id = prefixed_ulid(prefix::READ_RECEIPT);
    let conversation_id = message.conversation_id.as_deref().unwrap_or_default();
    if !message.message_ids.is_empty() {
        tracing::info!(%request_id, client_id = %session.id, conversation_id, count = message.message_ids.len(), "messages marked read");
    } else if let Some(cutoff) = message.timestamp.as_deref() {
        tracing::info!(%request_id, client_id = %session.id, conversation_id, cutoff, "messages marked read up to timestamp");
    } else {
        tracing::info!(%request_id, client_id = %session.id, conversation_id, "read receipt without ids or timestamp");
    }

    let message = Arc::new(message);
    {
        let persistence = state.persistence.clone();
        let message = message.clone();
        let request_id = request_id.clone();
        spawn_guarded("persist_read_receipt", async move {
            persistence.persist(&request_id, &message).await;
        });
    }
    state.router.deliver(&request_id, &message).await;
}

/// Regular messages: route first for immediacy, then persist on a separate
/// task. Both outcomes are reported to the sender.
async fn relay_message(state: &AppState, session: &Arc<Session>, mut message: Message) {
    let request_id = prefixed_ulid(prefix::REQUEST);
    message.stamp(Utc::now());

    tracing::info!(
        %request_id,
        client_id = %session.id,
        receiver_id = %message.receiver_id,
        kind = message.kind.as_ref().map_or("", MessageType::as_str),
        message_client_id = message.client_id.as_deref().unwrap_or_default(),
        preview = %message.preview(),
        "relaying message"
    );

    let message = Arc::new(message);
    let delivered = state.router.deliver(&request_id, &message).await;
    if delivered {
        session.notify(&ServerNotice::delivered(&message, Utc::now()));
    }

    let persistence = state.persistence.clone();
    let session = session.clone();
    spawn_guarded("persist_message", async move {
        if persistence.persist(&request_id, &message).await {
            session.notify(&ServerNotice::saved(&message, Utc::now()));
        } else if delivered {
            tracing::warn!(%request_id, "message delivered in real time but not persisted");
            session.notify(&ServerNotice::not_saved(&message));
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio::time;

    use super::*;
    use crate::config::Config;
    use crate::hub::persistence::testing::{fast_policy, FlakySink};
    use crate::hub::persistence::PersistenceGateway;
    use crate::hub::session::Payload;

    fn state_with(sink: Arc<FlakySink>) -> AppState {
        let mut state = AppState::with_sink(Config::default(), sink.clone());
        state.persistence = Arc::new(PersistenceGateway::new(sink, fast_policy()));
        state
    }

    async fn connect(state: &AppState, id: &str) -> (Arc<Session>, mpsc::Receiver<Payload>) {
        let (session, mut rx) = Session::new(id);
        state.registry.upsert(session.clone()).await.unwrap();
        assert!(rx.try_recv().is_err());
        (session, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Payload>) -> Value {
        let payload = time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed");
        serde_json::from_str(payload.as_str()).unwrap()
    }

    async fn wait_for_calls(sink: &FlakySink, n: u32) {
        time::timeout(Duration::from_secs(2), async {
            while sink.calls() < n {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sink was not called in time");
    }

    #[tokio::test]
    async fn ping_is_answered_to_sender_only() {
        let sink = Arc::new(FlakySink::healthy());
        let state = state_with(sink.clone());
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (_bob, mut bob_rx) = connect(&state, "bob").await;

        let before = Utc::now().timestamp_millis();
        handle_inbound(&state, &alice, r#"{"type":"ping","receiverId":"bob"}"#).await;

        let reply = next(&mut alice_rx).await;
        assert_eq!(reply["type"], "ping");
        assert!(reply["timestamp"].as_i64().unwrap() >= before);
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let state = state_with(Arc::new(FlakySink::healthy()));
        let (alice, mut alice_rx) = connect(&state, "alice").await;

        handle_inbound(&state, &alice, "{not json").await;
        let reply = next(&mut alice_rx).await;
        assert_eq!(reply, json!({"type": "error", "message": "Invalid message format"}));
    }

    #[tokio::test]
    async fn missing_conversation_short_circuits() {
        let sink = Arc::new(FlakySink::healthy());
        let state = state_with(sink.clone());
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (_bob, mut bob_rx) = connect(&state, "bob").await;

        handle_inbound(&state, &alice, r#"{"receiverId":"bob","content":"hi"}"#).await;

        let reply = next(&mut alice_rx).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "Conversation ID is required");

        time::sleep(Duration::from_millis(50)).await;
        assert!(bob_rx.try_recv().is_err());
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test]
    async fn message_is_routed_then_acknowledged_twice() {
        let sink = Arc::new(FlakySink::healthy());
        let state = state_with(sink.clone());
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (_bob, mut bob_rx) = connect(&state, "bob").await;

        let frame = json!({
            "receiverId": "bob",
            "conversationId": "c1",
            "content": "hi bob",
            "clientId": "tmp-1",
        });
        handle_inbound(&state, &alice, &frame.to_string()).await;

        let relayed = next(&mut bob_rx).await;
        assert_eq!(relayed["content"], "hi bob");
        assert_eq!(relayed["senderId"], "alice");
        assert!(relayed["createdAt"].is_string());
        assert!(relayed["updatedAt"].is_string());

        let mut kinds = vec![next(&mut alice_rx).await, next(&mut alice_rx).await];
        kinds.sort_by_key(|v| v["type"].as_str().unwrap_or_default().to_string());
        assert_eq!(kinds[0]["type"], "delivery_status");
        assert_eq!(kinds[0]["clientId"], "tmp-1");
        assert_eq!(kinds[1]["type"], "persistence_status");
        assert_eq!(kinds[1]["status"], "saved");
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test]
    async fn chat_and_file_tags_reach_receiver_and_store_unchanged() {
        let sink = Arc::new(FlakySink::healthy());
        let state = state_with(sink.clone());
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (_bob, mut bob_rx) = connect(&state, "bob").await;

        for (n, tag) in ["message", "file"].into_iter().enumerate() {
            let frame = json!({
                "type": tag,
                "receiverId": "bob",
                "conversationId": "c1",
                "content": "see attached",
                "fileKey": "k1",
            });
            handle_inbound(&state, &alice, &frame.to_string()).await;

            let relayed = next(&mut bob_rx).await;
            assert_eq!(relayed["type"], tag);
            assert_eq!(next(&mut alice_rx).await["type"], "delivery_status");
            assert_eq!(next(&mut alice_rx).await["type"], "persistence_status");

            wait_for_calls(&sink, n as u32 + 1).await;
            let persisted: Value = serde_json::from_slice(&sink.bodies.lock()[n]).unwrap();
            assert_eq!(persisted["type"], tag);
        }
    }

    #[tokio::test]
    async fn unrecognised_tag_is_relayed_as_a_regular_message() {
        let sink = Arc::new(FlakySink::healthy());
        let state = state_with(sink.clone());
        let (alice, _alice_rx) = connect(&state, "alice").await;
        let (_bob, mut bob_rx) = connect(&state, "bob").await;

        let frame = json!({"type": "voice_note", "receiverId": "bob", "conversationId": "c1"});
        handle_inbound(&state, &alice, &frame.to_string()).await;

        let relayed = next(&mut bob_rx).await;
        assert_eq!(relayed["type"], "voice_note");
        assert!(relayed["createdAt"].is_string());
        wait_for_calls(&sink, 1).await;
    }

    #[tokio::test]
    async fn persistence_failure_after_delivery_is_reported() {
        let sink = Arc::new(FlakySink::down());
        let state = state_with(sink.clone());
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (_bob, _bob_rx) = connect(&state, "bob").await;

        let frame = json!({"id": "m1", "receiverId": "bob", "conversationId": "c1", "content": "x", "clientId": "tmp-2"});
        handle_inbound(&state, &alice, &frame.to_string()).await;

        assert_eq!(next(&mut alice_rx).await["type"], "delivery_status");
        let failure = next(&mut alice_rx).await;
        assert_eq!(failure["type"], "persistence_error");
        assert_eq!(failure["originalMessageId"], "m1");
        assert_eq!(failure["clientId"], "tmp-2");
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test]
    async fn undelivered_and_unsaved_is_only_logged() {
        let sink = Arc::new(FlakySink::down());
        let state = state_with(sink.clone());
        let (alice, mut alice_rx) = connect(&state, "alice").await;

        let frame = json!({"receiverId": "nobody", "conversationId": "c1", "content": "x"});
        handle_inbound(&state, &alice, &frame.to_string()).await;

        wait_for_calls(&sink, 3).await;
        time::sleep(Duration::from_millis(50)).await;
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_receipt_is_routed_and_persisted_independently() {
        let sink = Arc::new(FlakySink::down());
        let state = state_with(sink.clone());
        let (alice, mut alice_rx) = connect(&state, "alice").await;
        let (_bob, mut bob_rx) = connect(&state, "bob").await;

        let frame = json!({
            "type": "read_receipt",
            "receiverId": "bob",
            "conversationId": "c1",
            "messageIds": ["m1", "m2"],
        });
        handle_inbound(&state, &alice, &frame.to_string()).await;

        let routed = next(&mut bob_rx).await;
        assert_eq!(routed["type"], "read_receipt");
        assert_eq!(routed["messageIds"], json!(["m1", "m2"]));

        // The backend is down: every attempt is made, the receiver still got
        // the receipt and the sender is not notified either way.
        wait_for_calls(&sink, 3).await;
        let persisted: Value = serde_json::from_slice(&sink.bodies.lock()[0]).unwrap();
        assert_eq!(persisted["type"], "read_receipt");
        time::sleep(Duration::from_millis(50)).await;
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_is_routed_but_never_persisted() {
        let sink = Arc::new(FlakySink::healthy());
        let state = state_with(sink.clone());
        let (alice, _alice_rx) = connect(&state, "alice").await;
        let (_bob, mut bob_rx) = connect(&state, "bob").await;

        let frame = json!({"type": "typing", "receiverId": "bob", "conversationId": "c1", "isTyping": true});
        handle_inbound(&state, &alice, &frame.to_string()).await;

        let routed = next(&mut bob_rx).await;
        assert_eq!(routed["type"], "typing");
        assert_eq!(routed["isTyping"], true);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.calls(), 0);
    }
}
