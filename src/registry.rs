use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Backend, ConnectRequest};
use crate::error::{Result, SessionError};
use crate::model::{
    ConnectionSettings, Session, SessionId, SessionKind, SessionStatus, TabId, TermSize,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub connecting: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub error: usize,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    tabs: HashMap<TabId, SessionId>,
    /// Connect attempt that owns each entry. A result from any other attempt
    /// is stale.
    attempts: HashMap<SessionId, u64>,
    next_attempt: u64,
}

/// Where a finished connect attempt landed.
enum ConnectFate {
    Applied,
    Superseded,
    Closed,
}

impl RegistryState {
    fn insert(&mut self, session: Session) -> u64 {
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.attempts.insert(session.id.clone(), attempt);
        self.tabs.insert(session.tab_id.clone(), session.id.clone());
        self.sessions.insert(session.id.clone(), session);
        attempt
    }

    fn remove(&mut self, id: &SessionId) -> Option<Session> {
        self.attempts.remove(id);
        let session = self.sessions.remove(id)?;
        if self.tabs.get(&session.tab_id) == Some(id) {
            self.tabs.remove(&session.tab_id);
        }
        Some(session)
    }
}

/// Owns the lifecycle of every session and the tab to session mapping.
pub struct SessionRegistry {
    backend: Arc<dyn Backend>,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Registers the session as connecting and drives the backend connect.
    ///
    /// Calling this again for a session that is still live returns its current
    /// status without contacting the backend. A failed connect leaves the
    /// session in `Error` until it is evicted or replaced.
    pub async fn create_session(
        &self,
        id: SessionId,
        tab_id: TabId,
        kind: SessionKind,
        settings: ConnectionSettings,
        size: TermSize,
    ) -> Result<SessionStatus> {
        let attempt = {
            let mut state = self.state.lock();
            if let Some(existing) = state.sessions.get(&id) {
                if !existing.status.is_terminal() {
                    tracing::debug!(session = %id, status = ?existing.status, "session already live");
                    return Ok(existing.status);
                }
            }
            if let Some(bound) = state.tabs.get(&tab_id).cloned() {
                let bound_live = state
                    .sessions
                    .get(&bound)
                    .is_some_and(|s| !s.status.is_terminal());
                if bound != id && bound_live {
                    return Err(SessionError::TabInUse {
                        tab: tab_id,
                        session: bound,
                    });
                }
                // Reconnect under the same tab replaces the dead session.
                state.remove(&bound);
            }
            state.remove(&id);
            state.insert(Session::connecting(id.clone(), tab_id, kind, &settings))
        };

        tracing::info!(session = %id, ?kind, "connecting session");
        let request = ConnectRequest {
            session_id: id.clone(),
            kind,
            settings,
            size,
        };
        let outcome = self.backend.connect(request).await;

        let outcome = outcome.map_err(|err| format!("{err:#}"));
        let fate = {
            let mut state = self.state.lock();
            let owner = state.attempts.get(&id).copied();
            match state.sessions.get_mut(&id) {
                Some(_) if owner != Some(attempt) => ConnectFate::Superseded,
                Some(session) => {
                    match &outcome {
                        Ok(()) => {
                            session.status = SessionStatus::Connected;
                            session.error_message = None;
                        }
                        Err(message) => {
                            session.status = SessionStatus::Error;
                            session.error_message = Some(message.clone());
                        }
                    }
                    ConnectFate::Applied
                }
                None => ConnectFate::Closed,
            }
        };

        match fate {
            ConnectFate::Applied => {}
            ConnectFate::Superseded => {
                // The transport under this id now belongs to the newer attempt.
                tracing::warn!(session = %id, attempt, "stale connect result discarded");
                return Err(SessionError::Aborted(id));
            }
            ConnectFate::Closed => {
                if outcome.is_ok() {
                    tracing::warn!(session = %id, "session closed while connecting; tearing down");
                    if let Err(err) = self.backend.disconnect(&id).await {
                        tracing::warn!(session = %id, "late disconnect failed: {err:#}");
                    }
                }
                return Err(SessionError::Aborted(id));
            }
        }

        match outcome {
            Ok(()) => {
                tracing::info!(session = %id, "session connected");
                Ok(SessionStatus::Connected)
            }
            Err(message) => {
                tracing::warn!(session = %id, "connect failed: {message}");
                Err(SessionError::Connect {
                    session: id,
                    message,
                })
            }
        }
    }

    /// Backend first, then local state. A failing backend call is logged and
    /// local cleanup proceeds anyway.
    pub async fn disconnect(&self, id: &SessionId) {
        if let Err(err) = self.backend.disconnect(id).await {
            tracing::warn!(session = %id, "backend disconnect failed: {err:#}");
        }
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(id) {
            session.status = SessionStatus::Disconnected;
        }
        if state.remove(id).is_some() {
            tracing::info!(session = %id, "session removed");
        }
    }

    /// The remote end went away on its own; keep the session visible.
    pub fn mark_remote_closed(&self, id: &SessionId, message: Option<String>) -> bool {
        let mut state = self.state.lock();
        match state.sessions.get_mut(id) {
            Some(session) if !session.status.is_terminal() => {
                session.status = SessionStatus::Disconnected;
                session.error_message = message;
                tracing::info!(session = %id, "remote side closed");
                true
            }
            _ => false,
        }
    }

    /// Drops an entry without telling the backend, typically one in `Error`.
    pub fn evict(&self, id: &SessionId) -> Option<Session> {
        self.state.lock().remove(id)
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.state.lock().sessions.get(id).cloned()
    }

    pub fn get_by_tab(&self, tab: &TabId) -> Option<Session> {
        let state = self.state.lock();
        let id = state.tabs.get(tab)?;
        state.sessions.get(id).cloned()
    }

    pub fn has(&self, id: &SessionId) -> bool {
        self.state.lock().sessions.contains_key(id)
    }

    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.state.lock().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        let mut stats = RegistryStats {
            total: state.sessions.len(),
            ..Default::default()
        };
        for session in state.sessions.values() {
            match session.status {
                SessionStatus::Connecting => stats.connecting += 1,
                SessionStatus::Connected => stats.connected += 1,
                SessionStatus::Disconnected => stats.disconnected += 1,
                SessionStatus::Error => stats.error += 1,
            }
        }
        stats
    }
}
