//! Directory of live sessions keyed by client identifier.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time;

use crate::error::RelayError;

use super::message::ServerNotice;
use super::session::Session;

/// Default upper bound for any registry lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// How a session identifier matched a lookup target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    Exact,
    CaseInsensitive,
    /// One identifier is a prefix or suffix of the other. Tolerates clients
    /// that send truncated identifiers.
    Affix,
}

/// Classify how `candidate` relates to `target`, if at all.
pub fn match_kind(candidate: &str, target: &str) -> Option<MatchKind> {
    if candidate.is_empty() || target.is_empty() {
        return None;
    }
    if candidate == target {
        Some(MatchKind::Exact)
    } else if candidate.to_lowercase() == target.to_lowercase() {
        Some(MatchKind::CaseInsensitive)
    } else if candidate.starts_with(target)
        || target.starts_with(candidate)
        || candidate.ends_with(target)
        || target.ends_with(candidate)
    {
        Some(MatchKind::Affix)
    } else {
        None
    }
}

/// Shared registry of live sessions.
///
/// Lookups take the shared lock and mutations the exclusive one. Every
/// acquisition is bounded by `lock_timeout`; a timeout fails the operation
/// with [`RelayError::LockTimeout`] instead of stalling the caller.
pub struct Registry {
    sessions: RwLock<BTreeMap<String, Arc<Session>>>,
    lock_timeout: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            lock_timeout,
        }
    }

    async fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Arc<Session>>>, RelayError> {
        time::timeout(self.lock_timeout, self.sessions.read())
            .await
            .map_err(|_| RelayError::LockTimeout { resource: "registry" })
    }

    async fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Arc<Session>>>, RelayError> {
        time::timeout(self.lock_timeout, self.sessions.write())
            .await
            .map_err(|_| RelayError::LockTimeout { resource: "registry" })
    }

    /// Install `session` under its identifier.
    ///
    /// A previous occupant is sent a `replaced` notice and closed inside the
    /// same critical section, so two live sessions never share an identifier.
    /// Returns the replaced session.
    pub async fn upsert(&self, session: Arc<Session>) -> Result<Option<Arc<Session>>, RelayError> {
        let mut sessions = self.write().await?;

        let replaced = sessions.remove(&session.id);
        if let Some(old) = &replaced {
            old.close(Some(&ServerNotice::replaced()));
        }
        session.activate();
        sessions.insert(session.id.clone(), session.clone());
        let total = sessions.len();
        drop(sessions);

        match &replaced {
            Some(old) => tracing::info!(
                client_id = %session.id,
                old_conn = %old.conn_id,
                new_conn = %session.conn_id,
                total,
                "replaced existing connection"
            ),
            None => tracing::info!(client_id = %session.id, conn_id = %session.conn_id, total, "client registered"),
        }
        Ok(replaced)
    }

    /// Remove `session` only if it is still the one registered under its
    /// identifier. Returns whether an entry was removed.
    pub async fn remove(&self, session: &Session) -> Result<bool, RelayError> {
        let mut sessions = self.write().await?;
        let current = sessions
            .get(&session.id)
            .is_some_and(|registered| registered.same_connection(session));
        if current {
            sessions.remove(&session.id);
            tracing::info!(client_id = %session.id, remaining = sessions.len(), "client disconnected");
        } else {
            tracing::debug!(
                client_id = %session.id,
                conn_id = %session.conn_id,
                "stale connection closed, newer one (or none) registered"
            );
        }
        Ok(current)
    }

    /// Every session matching `target`: the exact match, then
    /// case-insensitive matches, then prefix/suffix matches.
    pub async fn resolve(&self, target: &str) -> Result<Vec<Arc<Session>>, RelayError> {
        let target = target.trim();
        if target.is_empty() {
            return Ok(Vec::new());
        }

        let sessions = self.read().await?;
        let mut matches: Vec<(MatchKind, &Arc<Session>)> = sessions
            .iter()
            .filter_map(|(id, session)| match_kind(id, target).map(|kind| (kind, session)))
            .collect();
        // Stable: keeps identifier order inside each tier.
        matches.sort_by_key(|(kind, _)| *kind);

        for (kind, session) in &matches {
            if *kind != MatchKind::Exact {
                tracing::debug!(target_id = target, client_id = %session.id, ?kind, "tolerant identifier match");
            }
        }

        Ok(matches.into_iter().map(|(_, s)| s.clone()).collect())
    }

    /// Exact lookup.
    #[cfg(test)]
    pub(crate) async fn get(&self, id: &str) -> Result<Option<Arc<Session>>, RelayError> {
        Ok(self.read().await?.get(id).cloned())
    }

    pub async fn size(&self) -> Result<usize, RelayError> {
        Ok(self.read().await?.len())
    }

    /// Registered identifiers, in order. Used for monitoring output.
    pub async fn ids(&self) -> Result<Vec<String>, RelayError> {
        Ok(self.read().await?.keys().cloned().collect())
    }

    /// Close every session with `notice` and empty the registry. Returns the
    /// drained sessions so the caller can wait for them to finish.
    pub async fn drain(&self, notice: &ServerNotice) -> Result<Vec<Arc<Session>>, RelayError> {
        let mut sessions = self.write().await?;
        let drained: Vec<Arc<Session>> = std::mem::take(&mut *sessions).into_values().collect();
        drop(sessions);

        for session in &drained {
            session.close(Some(notice));
        }
        Ok(drained)
    }

    /// Hold the exclusive lock to simulate contention.
    #[cfg(test)]
    pub(crate) async fn jam(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<Session>>> {
        self.sessions.write().await
    }
}
