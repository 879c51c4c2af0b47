use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

/// Failures inside the relay pipeline.
///
/// None of these are fatal to the process: each one fails the operation that
/// produced it and is either reported back to the sending client or logged.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Inbound payload was not a valid message.
    #[error("malformed payload: {0}")]
    Protocol(#[from] serde_json::Error),

    /// A field required by the message type is missing.
    #[error("{0}")]
    Validation(&'static str),

    /// The external store did not accept the message within the retry budget.
    #[error("persistence failed after {attempts} attempt(s)")]
    Persistence { attempts: u32 },

    /// A shared lock could not be acquired in bounded time.
    #[error("timed out acquiring the {resource} lock")]
    LockTimeout { resource: &'static str },

    #[error("websocket write timed out")]
    WriteTimeout,

    #[error("websocket error: {0}")]
    Socket(#[from] axum::Error),

    #[error("listener error: {0}")]
    Listener(#[from] std::io::Error),
}

/// A single failed delivery attempt to the external store.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("attempt timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Structured API error returned to HTTP clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Vec<FieldError>>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "UNAVAILABLE".to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(details: Vec<FieldError>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR".to_string(),
            message: "Validation failed".to_string(),
            details: Some(details),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Protocol(e) => Self::bad_request(format!("Invalid request body: {e}")),
            RelayError::Validation(message) => Self::bad_request(message),
            RelayError::LockTimeout { resource } => {
                tracing::warn!(resource, "lock contention while serving request");
                Self::unavailable("Server is busy, try again")
            }
            other => {
                tracing::error!(?other, "relay error while serving request");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "INTERNAL_ERROR".to_string(),
                    message: "An internal error occurred".to_string(),
                    details: None,
                }
            }
        }
    }
}
