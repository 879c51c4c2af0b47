#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use relay_hub::config::Config;
use relay_hub::AppState;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One request the mock store received.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub request_id: Option<String>,
    pub body: Value,
}

struct BackendState {
    fail_first: usize,
    success: StatusCode,
    hits: AtomicUsize,
    requests: Mutex<Vec<Recorded>>,
}

/// In-process stand-in for the main server's message store.
#[derive(Clone)]
pub struct MockBackend {
    pub url: String,
    state: Arc<BackendState>,
}

impl MockBackend {
    /// Answers 500 to the first `fail_first` requests, then `success`.
    pub async fn start(fail_first: usize, success: StatusCode) -> Self {
        let state = Arc::new(BackendState {
            fail_first,
            success,
            hits: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/api/messages/save", post(save))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/api/messages/save"),
            state,
        }
    }

    pub async fn healthy() -> Self {
        Self::start(0, StatusCode::OK).await
    }

    pub async fn down() -> Self {
        Self::start(usize::MAX, StatusCode::OK).await
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().clone()
    }

    /// Wait until the store has seen at least `n` requests.
    pub async fn wait_for_hits(&self, n: usize) {
        time::timeout(Duration::from_secs(5), async {
            while self.hits() < n {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {n} hits, saw {}", self.hits()));
    }
}

async fn save(State(state): State<Arc<BackendState>>, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    let n = state.hits.fetch_add(1, Ordering::SeqCst);
    state.requests.lock().push(Recorded {
        request_id: headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });
    if n < state.fail_first {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        state.success
    }
}

/// Config pointing at `backend` with retry delays short enough for tests.
pub fn test_config(backend: &MockBackend) -> Config {
    Config {
        port: 0,
        persistence_url: backend.url.clone(),
        persist_backoff: Duration::from_millis(10),
        persist_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

pub fn test_state(backend: &MockBackend) -> AppState {
    AppState::new(test_config(backend))
}

/// Serve the full app on an ephemeral port.
pub async fn start_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap();
    let app = relay_hub::app(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Open a WebSocket as `id` and consume the `connected` notice.
pub async fn connect(addr: SocketAddr, id: &str) -> WsClient {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?id={id}"))
        .await
        .expect("ws connect");
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "connection");
    assert_eq!(hello["status"], "connected");
    assert_eq!(hello["clientId"], id);
    ws
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.expect("ws send");
}

/// Next text frame as JSON, skipping keepalives.
pub async fn next_json(ws: &mut WsClient) -> Value {
    time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).expect("json frame"),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Assert that no text frame arrives within `window`.
pub async fn expect_silence(ws: &mut WsClient, window: Duration) {
    let outcome = time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await;
    if let Ok(frame) = outcome {
        panic!("expected silence, got {frame:?}");
    }
}

/// Assert the server closes the connection next.
pub async fn expect_closed(ws: &mut WsClient) {
    time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(other)) => panic!("expected close, got {other:?}"),
            }
        }
    })
    .await
    .expect("connection was not closed");
}
