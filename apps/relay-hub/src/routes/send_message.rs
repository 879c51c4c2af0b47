//! Fallback HTTP ingress used by the main server to push messages that it
//! has already persisted.

use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use relay_common::id::{prefix, prefixed_ulid};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::{ApiError, FieldError, RelayError};
use crate::hub::message::{Message, MESSAGE_FIELDS};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/send-message", post(send_message))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub status: String,
    pub delivered: bool,
    pub processing_time_ms: u64,
}

/// Reject keys that are not part of the message schema.
fn unknown_fields(body: &Value) -> Result<(), ApiError> {
    let Some(object) = body.as_object() else {
        return Err(ApiError::bad_request("Request body must be a JSON object"));
    };
    let errors: Vec<FieldError> = object
        .keys()
        .filter(|key| !MESSAGE_FIELDS.contains(&key.as_str()))
        .map(|key| FieldError {
            field: key.clone(),
            message: "Unknown field".to_string(),
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::validation(errors))
    }
}

#[utoipa::path(
    post,
    path = "/send-message",
    tag = "Messages",
    request_body = Message,
    responses(
        (status = 200, description = "Message accepted; `delivered` tells whether a recipient was connected", body = SendMessageResponse),
        (status = 400, description = "Validation error", body = crate::error::ApiErrorBody),
    ),
)]
pub async fn send_message(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let started = Instant::now();
    let request_id = prefixed_ulid(prefix::INGRESS);

    let Json(body) = body.map_err(|rejection| {
        tracing::warn!(%request_id, error = %rejection.body_text(), "unreadable ingress body");
        ApiError::bad_request(format!("Invalid request body: {}", rejection.body_text()))
    })?;

    unknown_fields(&body)?;
    let mut message: Message = serde_json::from_value(body).map_err(RelayError::from)?;
    if !message.has_receiver() {
        tracing::warn!(%request_id, "ingress message without receiver");
        return Err(ApiError::bad_request("Receiver ID is required"));
    }
    message.stamp(Utc::now());

    tracing::info!(%request_id, receiver_id = %message.receiver_id, "delivering message from HTTP ingress");
    let delivered = state.router.deliver(&request_id, &message).await;
    let processing_time_ms = started.elapsed().as_millis() as u64;

    let status = if delivered {
        "Message delivered successfully"
    } else {
        "Message received, but recipient not connected"
    };
    tracing::info!(%request_id, delivered, processing_time_ms, "ingress delivery finished");

    Ok(Json(SendMessageResponse {
        status: status.to_string(),
        delivered,
        processing_time_ms,
    }))
}
