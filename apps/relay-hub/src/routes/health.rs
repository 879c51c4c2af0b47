use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::RelayError;
use crate::hub::registry::Registry;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health-check", get(health))
        .route("/health", get(health))
}

/// What the liveness probe and the health endpoints observe.
#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    pub connections: usize,
}

/// Read the registry size under its bounded lock.
pub async fn snapshot(registry: &Registry) -> Result<HealthSnapshot, RelayError> {
    Ok(HealthSnapshot {
        connections: registry.size().await?,
    })
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<usize>,
}

#[utoipa::path(
    get,
    path = "/health-check",
    tag = "Health",
    responses(
        (status = 200, description = "Hub is serving", body = HealthResponse),
        (status = 503, description = "Session registry unavailable", body = HealthResponse),
    ),
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match snapshot(&state.registry).await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "OK".to_string(),
                time: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
                connections: Some(snapshot.connections),
            }),
        ),
        Err(err) => {
            tracing::warn!(%err, "health check could not read registry");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "UNAVAILABLE".to_string(),
                    time: None,
                    connections: None,
                }),
            )
        }
    }
}
