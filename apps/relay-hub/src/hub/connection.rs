//! WebSocket upgrade handler and the per-connection read/write pumps.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::error::{ApiError, RelayError};
use crate::task::{panic_message, spawn_guarded};
use crate::AppState;

use super::handler::handle_inbound;
use super::message::ServerNotice;
use super::session::{Payload, Session};

/// Largest inbound frame accepted.
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Renewed by every frame received, pongs included.
const READ_DEADLINE: Duration = Duration::from_secs(120);
/// Maximum time without a data frame.
const IDLE_WINDOW: Duration = Duration::from_secs(10 * 60);
const PING_INTERVAL: Duration = Duration::from_secs(15);
const PING_DEADLINE: Duration = Duration::from_secs(10);
const WRITE_DEADLINE: Duration = Duration::from_secs(20);
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// How long cleanup waits for the writer to flush and send its close frame.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_WRITE_FAILURES: u32 = 3;
const MAX_READ_ERRORS: u32 = 5;
/// Read errors below this count back off briefly, the rest back off longer.
const SHORT_BACKOFF_ERRORS: u32 = 3;

/// Payloads above this size are logged.
const LARGE_PAYLOAD_BYTES: usize = 10_000;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    id: Option<String>,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(client_id) = params
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
    else {
        tracing::warn!("connection attempt without client id");
        return ApiError::bad_request("Client ID is required").into_response();
    };

    match ws {
        Ok(ws) => ws
            .max_message_size(MAX_MESSAGE_SIZE)
            .on_upgrade(move |socket| handle_connection(socket, state, client_id))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// Serialized access to the socket's sink. Every write is bounded twice: once
/// for acquiring the lock and once for the write itself.
pub(crate) struct SessionWriter<S> {
    sink: Mutex<S>,
}

impl<S> SessionWriter<S>
where
    S: Sink<WsMessage, Error = axum::Error> + Unpin + Send,
{
    pub(crate) fn new(sink: S) -> Self {
        Self { sink: Mutex::new(sink) }
    }

    async fn send(&self, frame: WsMessage, deadline: Duration) -> Result<(), RelayError> {
        let mut sink = time::timeout(WRITE_LOCK_TIMEOUT, self.sink.lock())
            .await
            .map_err(|_| RelayError::LockTimeout { resource: "socket writer" })?;
        time::timeout(deadline, sink.send(frame))
            .await
            .map_err(|_| RelayError::WriteTimeout)??;
        Ok(())
    }

    async fn send_close(&self, code: u16, reason: &'static str) -> Result<(), RelayError> {
        let frame = WsMessage::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        }));
        self.send(frame, WRITE_DEADLINE).await
    }
}

async fn handle_connection(socket: WebSocket, state: AppState, client_id: String) {
    let (ws_tx, ws_rx) = socket.split();
    let writer = Arc::new(SessionWriter::new(ws_tx));
    let (session, outbound) = Session::new(client_id);

    if let Err(err) = state.registry.upsert(session.clone()).await {
        tracing::error!(client_id = %session.id, %err, "could not register connection");
        if let Err(err) = writer.send_close(close_code::AGAIN, "Server busy").await {
            tracing::debug!(client_id = %session.id, %err, "busy close frame not sent");
        }
        session.mark_closed();
        return;
    }

    session.notify(&ServerNotice::connected(&session.id));
    let write_task = spawn_guarded("session_writer", write_pump(session.clone(), writer, outbound));

    let ended = AssertUnwindSafe(read_pump(&state, &session, ws_rx)).catch_unwind().await;
    match ended {
        Ok(reason) => tracing::debug!(client_id = %session.id, conn_id = %session.conn_id, ?reason, "read loop ended"),
        Err(panic) => tracing::error!(
            client_id = %session.id,
            conn_id = %session.conn_id,
            panic = %panic_message(&panic),
            "read loop panicked"
        ),
    }

    cleanup(&state, &session, write_task).await;
}

/// Runs once per connection, after the read loop has ended for any reason.
async fn cleanup(state: &AppState, session: &Arc<Session>, mut write_task: JoinHandle<()>) {
    session.close(None);

    if time::timeout(WRITER_FLUSH_TIMEOUT, &mut write_task).await.is_err() {
        tracing::warn!(client_id = %session.id, conn_id = %session.conn_id, "writer did not flush in time");
        write_task.abort();
    }

    if let Err(err) = state.registry.remove(session).await {
        tracing::error!(client_id = %session.id, conn_id = %session.conn_id, %err, "failed to unregister connection");
    }
    session.mark_closed();
}

/// Why a read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadEnd {
    Cancelled,
    ClosedByPeer,
    ReadDeadline,
    Idle,
    TooManyErrors,
}

pub(crate) async fn read_pump<S>(state: &AppState, session: &Arc<Session>, mut stream: S) -> ReadEnd
where
    S: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    let mut read_deadline = Instant::now() + READ_DEADLINE;
    let mut last_data = Instant::now();
    let mut errors = 0u32;

    loop {
        let idle_deadline = last_data + IDLE_WINDOW;
        let next = tokio::select! {
            _ = session.cancelled() => return ReadEnd::Cancelled,
            next = time::timeout_at(read_deadline.min(idle_deadline), stream.next()) => next,
        };

        let frame = match next {
            Err(_) if Instant::now() >= idle_deadline => {
                tracing::info!(client_id = %session.id, "closing idle connection");
                return ReadEnd::Idle;
            }
            Err(_) => {
                tracing::info!(client_id = %session.id, "read deadline exceeded");
                return ReadEnd::ReadDeadline;
            }
            Ok(None) => return ReadEnd::ClosedByPeer,
            Ok(Some(Err(err))) => {
                errors += 1;
                tracing::warn!(client_id = %session.id, errors, %err, "websocket read error");
                if errors >= MAX_READ_ERRORS {
                    return ReadEnd::TooManyErrors;
                }
                let backoff = if errors < SHORT_BACKOFF_ERRORS {
                    Duration::from_millis(100)
                } else {
                    Duration::from_millis(500)
                };
                time::sleep(backoff).await;
                continue;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        read_deadline = Instant::now() + READ_DEADLINE;
        errors = 0;

        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Utf8Bytes::from(text),
                Err(_) => {
                    session.notify(&ServerNotice::error("Invalid message format"));
                    continue;
                }
            },
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(frame) => {
                tracing::debug!(client_id = %session.id, ?frame, "close frame received");
                return ReadEnd::ClosedByPeer;
            }
        };

        last_data = Instant::now();
        let state = state.clone();
        let session = session.clone();
        spawn_guarded("classify_inbound", async move {
            handle_inbound(&state, &session, text.as_str()).await;
        });
    }
}

/// Single writer per connection: drains the outbound queue and keeps the
/// connection alive with pings. Cancels the read loop when it exits.
pub(crate) async fn write_pump<S>(session: Arc<Session>, writer: Arc<SessionWriter<S>>, mut outbound: mpsc::Receiver<Payload>)
where
    S: Sink<WsMessage, Error = axum::Error> + Unpin + Send,
{
    let mut ping = time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut failures = 0u32;

    loop {
        let result = tokio::select! {
            next = outbound.recv() => match next {
                Some(payload) => {
                    let bytes = payload.as_str().len();
                    if bytes > LARGE_PAYLOAD_BYTES {
                        tracing::debug!(client_id = %session.id, bytes, "writing large payload");
                    }
                    writer.send(WsMessage::Text(payload), WRITE_DEADLINE).await
                }
                None => {
                    if let Err(err) = writer.send_close(close_code::NORMAL, "").await {
                        tracing::debug!(client_id = %session.id, %err, "close frame not sent");
                    }
                    break;
                }
            },
            _ = ping.tick() => writer.send(WsMessage::Ping(Bytes::new()), PING_DEADLINE).await,
        };

        match result {
            Ok(()) => failures = 0,
            Err(err @ RelayError::LockTimeout { .. }) => {
                tracing::error!(client_id = %session.id, conn_id = %session.conn_id, %err, "writer stalled");
                break;
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(client_id = %session.id, conn_id = %session.conn_id, failures, %err, "write failed");
                if failures >= MAX_WRITE_FAILURES {
                    break;
                }
            }
        }
    }

    session.cancel();
}
