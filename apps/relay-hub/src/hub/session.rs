//! Per-connection session state shared between the registry, the router and
//! the connection's own read/write loops.

use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;
use relay_common::id::{prefix, prefixed_ulid};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::message::{encode, ServerNotice};

/// Capacity of each session's outbound queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// A serialized frame waiting in an outbound queue.
pub type Payload = Utf8Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why an enqueue did not happen. Neither case blocks the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound queue is closed")]
    Closed,
}

/// State for a single client connection.
pub struct Session {
    /// Trimmed client identifier, used as the registry key.
    pub id: String,
    /// The user behind the connection. Currently the same as `id`.
    pub user_id: String,
    /// Unique per accepted connection (`conn_` prefixed ULID).
    pub conn_id: String,
    state: Mutex<SessionState>,
    /// Producer side of the outbound queue. Taken exactly once on close.
    outbound: Mutex<Option<mpsc::Sender<Payload>>>,
    /// Tells the read loop to stop.
    cancel: CancellationToken,
    /// Fires once cleanup has fully finished.
    finished: CancellationToken,
}

impl Session {
    /// Create a session in `Connecting` state together with the consumer end
    /// of its outbound queue.
    pub fn new(id: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<Payload>) {
        let id = id.into();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let session = Self {
            user_id: id.clone(),
            id,
            conn_id: prefixed_ulid(prefix::CONNECTION),
            state: Mutex::new(SessionState::Connecting),
            outbound: Mutex::new(Some(tx)),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        };
        (Arc::new(session), rx)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Identity comparison used by guarded registry removal.
    pub fn same_connection(&self, other: &Session) -> bool {
        self.conn_id == other.conn_id
    }

    /// `Connecting → Active`. Returns false if the session already left
    /// `Connecting`.
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Connecting {
            *state = SessionState::Active;
            true
        } else {
            false
        }
    }

    /// Non-blocking enqueue. A full queue drops the payload for this session
    /// only.
    pub fn enqueue(&self, payload: Payload) -> Result<(), EnqueueError> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(EnqueueError::Closed);
        };
        tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Best-effort notice to this session. Failures are logged, not returned.
    pub fn notify(&self, notice: &ServerNotice) -> bool {
        let payload = match encode(notice) {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(?err, client_id = %self.id, "failed to encode notice");
                return false;
            }
        };
        match self.enqueue(payload) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(client_id = %self.id, conn_id = %self.conn_id, %err, "notice dropped");
                false
            }
        }
    }

    /// Begin closing: optionally queue a final notice, close the outbound
    /// queue and stop the read loop.
    ///
    /// Only the first call has any effect; it returns true.
    pub fn close(&self, notice: Option<&ServerNotice>) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Closing | SessionState::Closed => return false,
                _ => *state = SessionState::Closing,
            }
        }

        if let Some(notice) = notice {
            self.notify(notice);
        }
        // Dropping the only sender lets the writer drain what is queued, then
        // observe the closed channel.
        self.outbound.lock().take();
        self.cancel.cancel();
        true
    }

    /// `Closing → Closed`, called by connection cleanup once everything is
    /// released.
    pub fn mark_closed(&self) {
        self.close(None);
        *self.state.lock() = SessionState::Closed;
        self.finished.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the session has been asked to stop reading.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Ask the read loop to stop without touching the queue.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once cleanup has marked the session `Closed`.
    pub async fn wait_closed(&self) {
        self.finished.cancelled().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("conn_id", &self.conn_id)
            .field("state", &self.state())
            .finish()
    }
}
