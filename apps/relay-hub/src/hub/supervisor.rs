//! Owns the listener lifecycle: bind, serve, probe liveness, drain, restart.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::routes::health;
use crate::task::spawn_guarded;
use crate::AppState;

use super::message::ServerNotice;

/// Probes between two monitor log lines.
const MONITOR_EVERY: u64 = 6;
/// Identifiers listed in a monitor line.
const MONITOR_MAX_IDS: usize = 100;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub probe_interval: Duration,
    /// Consecutive failed probes that trigger a restart.
    pub failure_threshold: u32,
    /// How long a stopped listener may take to finish in-flight requests.
    pub shutdown_grace: Duration,
    pub restart_delay: Duration,
    /// How long to wait for drained sessions to finish closing.
    pub drain_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            failure_threshold: 3,
            shutdown_grace: Duration::from_secs(5),
            restart_delay: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerStatus {
    Starting,
    Listening { addr: SocketAddr, generation: u64 },
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
enum RestartReason {
    #[error("{failures} consecutive liveness probes failed")]
    Unhealthy { failures: u32 },
    #[error("listener exited: {0}")]
    ListenerExited(String),
}

enum Outcome {
    Shutdown,
    Restart(RestartReason),
}

pub struct Supervisor {
    state: AppState,
    addr: SocketAddr,
    settings: SupervisorSettings,
    status: watch::Sender<ListenerStatus>,
}

impl Supervisor {
    pub fn new(state: AppState, addr: SocketAddr, settings: SupervisorSettings) -> Self {
        let (status, _) = watch::channel(ListenerStatus::Starting);
        Self {
            state,
            addr,
            settings,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<ListenerStatus> {
        self.status.subscribe()
    }

    /// Serve until `shutdown` fires, restarting the listener whenever it
    /// exits unexpectedly or stops answering liveness probes.
    ///
    /// Only a failure to bind the very first listener is returned as an
    /// error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let mut generation = 0u64;

        loop {
            generation += 1;
            self.status.send_replace(ListenerStatus::Starting);

            let listener = match TcpListener::bind(self.addr).await {
                Ok(listener) => listener,
                Err(err) if generation == 1 => {
                    self.status.send_replace(ListenerStatus::Stopped);
                    return Err(err.into());
                }
                Err(err) => {
                    tracing::error!(addr = %self.addr, generation, %err, "rebind failed");
                    if self.pause(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.serve_generation(listener, generation, &shutdown).await {
                Outcome::Shutdown => break,
                Outcome::Restart(reason) => {
                    tracing::warn!(generation, %reason, delay = ?self.settings.restart_delay, "restarting listener");
                    if self.pause(&shutdown).await {
                        break;
                    }
                }
            }
        }

        self.status.send_replace(ListenerStatus::Stopped);
        tracing::info!("relay hub stopped");
        Ok(())
    }

    /// Wait out the restart delay. Returns true if shutdown fired meanwhile.
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = time::sleep(self.settings.restart_delay) => false,
        }
    }

    async fn serve_generation(&self, listener: TcpListener, generation: u64, shutdown: &CancellationToken) -> Outcome {
        let addr = listener.local_addr().unwrap_or(self.addr);
        let stop = CancellationToken::new();
        let mut server = self.spawn_server(listener, stop.clone());

        let (restart_tx, mut restart_rx) = mpsc::channel(1);
        let probe = spawn_guarded(
            "liveness_probe",
            probe_loop(self.state.clone(), self.settings.clone(), restart_tx, stop.clone()),
        );

        self.status.send_replace(ListenerStatus::Listening { addr, generation });
        tracing::info!(%addr, generation, "relay hub listening");

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => Outcome::Shutdown,
            Some(reason) = restart_rx.recv() => Outcome::Restart(reason),
            exit = &mut server => {
                let detail = match exit {
                    Ok(Ok(())) => "listener returned".to_string(),
                    Ok(Err(err)) => err.to_string(),
                    Err(join) => join.to_string(),
                };
                tracing::error!(generation, %detail, "listener exited unexpectedly");
                Outcome::Restart(RestartReason::ListenerExited(detail))
            }
        };

        self.status.send_replace(ListenerStatus::Draining);
        probe.abort();
        self.wind_down(&stop, server, generation).await;
        outcome
    }

    /// Stop accepting, give in-flight requests the grace period against a
    /// still populated registry, then drain the sessions.
    async fn wind_down(&self, stop: &CancellationToken, mut server: JoinHandle<Result<(), RelayError>>, generation: u64) {
        stop.cancel();
        if !server.is_finished() && time::timeout(self.settings.shutdown_grace, &mut server).await.is_err() {
            tracing::warn!(generation, "listener did not stop within grace period");
            server.abort();
        }
        self.drain().await;
    }

    fn spawn_server(&self, listener: TcpListener, stop: CancellationToken) -> JoinHandle<Result<(), RelayError>> {
        let app = crate::app(self.state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await?;
            Ok(())
        })
    }

    /// Close every session with a `server_shutdown` notice and wait (bounded)
    /// for their cleanup to finish.
    async fn drain(&self) {
        let sessions = match self.state.registry.drain(&ServerNotice::server_shutdown()).await {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::error!(%err, "could not drain sessions");
                return;
            }
        };
        if sessions.is_empty() {
            return;
        }

        let count = sessions.len();
        let closing = join_all(sessions.iter().map(|s| s.wait_closed()));
        match time::timeout(self.settings.drain_timeout, closing).await {
            Ok(_) => tracing::info!(count, "sessions drained"),
            Err(_) => tracing::warn!(count, "sessions still closing after drain timeout"),
        }
    }
}

async fn probe_loop(
    state: AppState,
    settings: SupervisorSettings,
    restart: mpsc::Sender<RestartReason>,
    stop: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + settings.probe_interval, settings.probe_interval);
    let mut failures = 0u32;
    let mut probes = 0u64;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        probes += 1;

        match health::snapshot(&state.registry).await {
            Ok(snapshot) => {
                if failures > 0 {
                    tracing::info!(failures, "liveness probe recovered");
                }
                failures = 0;
                if probes % MONITOR_EVERY == 0 {
                    log_monitor(&state, snapshot.connections).await;
                }
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(failures, threshold = settings.failure_threshold, %err, "liveness probe failed");
                if failures >= settings.failure_threshold {
                    request_restart(&restart, RestartReason::Unhealthy { failures });
                    failures = 0;
                }
            }
        }
    }
}

/// Coalesces restart requests: one pending request is enough.
fn request_restart(restart: &mpsc::Sender<RestartReason>, reason: RestartReason) {
    match restart.try_send(reason) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => tracing::debug!("restart already pending"),
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

async fn log_monitor(state: &AppState, connections: usize) {
    match state.registry.ids().await {
        Ok(mut ids) => {
            let truncated = ids.len() > MONITOR_MAX_IDS;
            ids.truncate(MONITOR_MAX_IDS);
            tracing::info!(connections, ?ids, truncated, "connection monitor");
        }
        Err(err) => tracing::debug!(%err, "monitor skipped"),
    }
}
