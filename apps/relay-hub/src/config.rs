use std::time::Duration;

/// Relay hub configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket listener binds to.
    pub port: u16,
    /// Endpoint of the external message store that persists relayed messages.
    pub persistence_url: String,
    /// Total attempts (first try included) per persisted message.
    pub persist_max_attempts: u32,
    /// Linear backoff unit between persistence attempts.
    pub persist_backoff: Duration,
    /// Upper bound for a single persistence request.
    pub persist_timeout: Duration,
    /// Upper bound for acquiring the session registry lock.
    pub registry_lock_timeout: Duration,
}

pub const DEFAULT_PERSISTENCE_URL: &str = "http://localhost:3000/api/messages/save";

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            persistence_url: DEFAULT_PERSISTENCE_URL.to_string(),
            persist_max_attempts: 3,
            persist_backoff: Duration::from_secs(1),
            persist_timeout: Duration::from_secs(15),
            registry_lock_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unset or unparsable values fall back to
    /// the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed_var("PORT").unwrap_or(defaults.port),
            persistence_url: std::env::var("MAIN_SERVER_API_URL")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.persistence_url),
            persist_max_attempts: parsed_var::<u32>("PERSIST_MAX_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.persist_max_attempts),
            persist_backoff: parsed_var("PERSIST_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.persist_backoff),
            persist_timeout: parsed_var("PERSIST_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.persist_timeout),
            registry_lock_timeout: parsed_var("REGISTRY_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.registry_lock_timeout),
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
