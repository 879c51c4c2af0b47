mod common;

use std::time::Duration;

use axum::http::StatusCode;

use common::MockBackend;
use relay_hub::hub::message::Message;
use relay_hub::hub::persistence::{HttpSink, MessageSink, PersistenceGateway, RetryPolicy};

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        attempt_timeout: Duration::from_secs(2),
    }
}

fn message() -> Message {
    Message {
        receiver_id: "bob".to_string(),
        conversation_id: Some("c1".to_string()),
        content: "persist me".to_string(),
        ..Default::default()
    }
}

fn gateway(backend: &MockBackend) -> PersistenceGateway {
    PersistenceGateway::new(std::sync::Arc::new(HttpSink::new(backend.url.clone())), policy())
}

#[tokio::test]
async fn recovers_after_two_server_errors() {
    let backend = MockBackend::start(2, StatusCode::OK).await;

    let attempts = gateway(&backend).try_persist("req_abc", &message()).await.unwrap();
    assert_eq!(attempts, 3);
    assert_eq!(backend.hits(), 3);
    for request in backend.requests() {
        assert_eq!(request.request_id.as_deref(), Some("req_abc"));
        assert_eq!(request.body["content"], "persist me");
    }
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let backend = MockBackend::down().await;

    assert!(!gateway(&backend).persist("req_abc", &message()).await);
    assert_eq!(backend.hits(), 3);
}

#[tokio::test]
async fn any_2xx_counts_as_saved() {
    let backend = MockBackend::start(0, StatusCode::ACCEPTED).await;

    assert!(gateway(&backend).persist("req_abc", &message()).await);
    assert_eq!(backend.hits(), 1);
}

#[tokio::test]
async fn unreachable_store_is_a_failed_attempt() {
    let sink = HttpSink::new("http://127.0.0.1:1/api/messages/save");
    assert!(sink.submit("req_abc", b"{}").await.is_err());
}
