pub mod health;
pub mod send_message;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(send_message::router())
        .merge(crate::hub::connection::router())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        send_message::send_message,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            // Models
            crate::hub::message::Message,
            // Route request/response types
            health::HealthResponse,
            send_message::SendMessageResponse,
        )
    ),
    tags(
        (name = "Health", description = "Liveness"),
        (name = "Messages", description = "HTTP ingress for relayed messages"),
    )
)]
pub struct ApiDoc;
