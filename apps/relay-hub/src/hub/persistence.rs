//! Retrying forwarder to the external message store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

use crate::config::Config;
use crate::error::{RelayError, SinkError};

use super::message::Message;

/// Transport used for one persistence attempt.
///
/// Backed by HTTP in production and by in-memory fakes in tests.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn submit(&self, request_id: &str, body: &[u8]) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// POSTs the serialized message to the store's save endpoint.
pub struct HttpSink {
    url: String,
    http: reqwest::Client,
}

impl HttpSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MessageSink for HttpSink {
    async fn submit(&self, request_id: &str, body: &[u8]) -> Result<(), SinkError> {
        let resp = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-Request-ID", request_id)
            .body(body.to_vec())
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    /// Attempt `n` (1-based) waits `(n - 1) * base_delay` before starting.
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.persist_max_attempts.max(1),
            base_delay: config.persist_backoff,
            attempt_timeout: config.persist_timeout,
        }
    }

    /// Delay before the given 1-based attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay * attempt.saturating_sub(1)
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Stateless at-least-once forwarder. Each attempt is independent; only the
/// attempt counter carries over.
pub struct PersistenceGateway {
    sink: Arc<dyn MessageSink>,
    policy: RetryPolicy,
}

impl PersistenceGateway {
    pub fn new(sink: Arc<dyn MessageSink>, policy: RetryPolicy) -> Self {
        Self { sink, policy }
    }

    /// Persist `message`, retrying up to the policy's budget. Returns true
    /// once any attempt succeeded.
    pub async fn persist(&self, request_id: &str, message: &Message) -> bool {
        match self.try_persist(request_id, message).await {
            Ok(attempts) => {
                tracing::info!(request_id, attempts, "message persisted");
                true
            }
            Err(err) => {
                tracing::error!(request_id, %err, "giving up on persistence");
                false
            }
        }
    }

    /// Returns the number of attempts used on success.
    pub async fn try_persist(&self, request_id: &str, message: &Message) -> Result<u32, RelayError> {
        let body = serde_json::to_vec(message)?;

        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                tracing::debug!(request_id, attempt, ?delay, "retrying persistence");
                time::sleep(delay).await;
            }

            let outcome = match time::timeout(self.policy.attempt_timeout, self.sink.submit(request_id, &body)).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout(self.policy.attempt_timeout)),
            };

            match outcome {
                Ok(()) => return Ok(attempt),
                Err(err) => tracing::warn!(
                    request_id,
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    %err,
                    "persistence attempt failed"
                ),
            }
        }

        Err(RelayError::Persistence {
            attempts: self.policy.max_attempts,
        })
    }
}
