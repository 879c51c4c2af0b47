//! Fan-out of one message to every session matching its receiver.
//!
//! The message is serialized once and the same payload is handed to each
//! matching session's outbound queue. Enqueueing never blocks: a full queue
//! only fails that one recipient. Delivery counts as successful when at
//! least one recipient accepted the payload.

use std::sync::Arc;

use super::message::{encode, Message};
use super::registry::Registry;
use super::session::EnqueueError;

/// Outcome of delivering to one resolved session.
#[derive(Debug, Clone)]
pub struct RecipientOutcome {
    pub client_id: String,
    pub conn_id: String,
    pub result: Result<(), EnqueueError>,
}

/// Per-recipient outcomes of a single fan-out.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub recipients: Vec<RecipientOutcome>,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.recipients.len()
    }

    pub fn succeeded(&self) -> usize {
        self.recipients.iter().filter(|r| r.result.is_ok()).count()
    }

    pub fn delivered(&self) -> bool {
        self.succeeded() > 0
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<Registry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Deliver `message` to every session matching its receiver. Returns true
    /// if at least one session accepted it.
    pub async fn deliver(&self, request_id: &str, message: &Message) -> bool {
        self.fan_out(request_id, message).await.delivered()
    }

    /// Like [`deliver`](Self::deliver) but keeps the per-recipient outcomes.
    pub async fn fan_out(&self, request_id: &str, message: &Message) -> DeliveryReport {
        let recipients = match self.registry.resolve(&message.receiver_id).await {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::error!(request_id, %err, "receiver lookup failed, delivery aborted");
                return DeliveryReport::default();
            }
        };

        if recipients.is_empty() {
            tracing::info!(request_id, receiver_id = %message.receiver_id, "receiver not connected");
            return DeliveryReport::default();
        }

        let payload = match encode(message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(request_id, %err, "failed to serialize message");
                return DeliveryReport::default();
            }
        };

        let report = DeliveryReport {
            recipients: recipients
                .iter()
                .map(|session| {
                    let result = session.enqueue(payload.clone());
                    if let Err(err) = &result {
                        tracing::warn!(
                            request_id,
                            client_id = %session.id,
                            conn_id = %session.conn_id,
                            %err,
                            "recipient skipped"
                        );
                    }
                    RecipientOutcome {
                        client_id: session.id.clone(),
                        conn_id: session.conn_id.clone(),
                        result,
                    }
                })
                .collect(),
        };

        tracing::info!(
            request_id,
            receiver_id = %message.receiver_id,
            succeeded = report.succeeded(),
            attempted = report.attempted(),
            "real-time delivery complete"
        );
        report
    }
}
