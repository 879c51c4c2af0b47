pub mod config;
pub mod error;
pub mod hub;
pub mod routes;
pub mod task;

use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use hub::persistence::{HttpSink, MessageSink, PersistenceGateway, RetryPolicy};
use hub::registry::Registry;
use hub::router::MessageRouter;

/// Shared application state available to all route handlers and sessions.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub router: MessageRouter,
    pub persistence: Arc<PersistenceGateway>,
}

impl AppState {
    /// State persisting to the HTTP store named in `config`.
    pub fn new(config: Config) -> Self {
        let sink = Arc::new(HttpSink::new(config.persistence_url.clone()));
        Self::with_sink(config, sink)
    }

    pub fn with_sink(config: Config, sink: Arc<dyn MessageSink>) -> Self {
        let registry = Arc::new(Registry::with_lock_timeout(config.registry_lock_timeout));
        let persistence = Arc::new(PersistenceGateway::new(sink, RetryPolicy::from_config(&config)));
        Self {
            router: MessageRouter::new(registry.clone()),
            registry,
            persistence,
            config: Arc::new(config),
        }
    }
}

/// The full HTTP/WebSocket application with its middleware stack.
pub fn app(state: AppState) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    axum::Router::new()
        .merge(routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
