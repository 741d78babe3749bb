//! The surface the UI talks to.
//!
//! A [`Coordinator`] owns one of each service and a dispatcher task that reads
//! the backend's single event stream in arrival order and routes every event by
//! the session id embedded in its name.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{
    Backend, BackendEvent, EventTopic, OutputChunk, RemoteState, StatusReport, UploadProgress,
};
use crate::coalescer::{CoalesceSettings, InputCoalescer};
use crate::error::{Result, SessionError};
use crate::model::{
    ConnectionSettings, Session, SessionId, SessionKind, SessionStatus, TabId, TaskId, TermSize,
};
use crate::path_inference::{PathTracker, ResolvedTarget, DEFAULT_SCAN_LINES};
use crate::registry::{RegistryStats, SessionRegistry};
use crate::router::{EventRouter, SessionEvent, Subscription, DEFAULT_BUFFER_LIMIT};
use crate::sequencer::Sequencer;
use crate::surface::ScrollbackSource;
use crate::uploads::{UploadTask, UploadTracker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub coalesce: CoalesceSettings,
    /// Non-blank scrollback lines examined per upload gesture.
    pub scan_line_limit: usize,
    pub router_buffer_limit: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            coalesce: CoalesceSettings::default(),
            scan_line_limit: DEFAULT_SCAN_LINES,
            router_buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }
}

/// State the dispatcher task shares with the coordinator.
struct Shared {
    registry: SessionRegistry,
    router: EventRouter,
    uploads: UploadTracker,
    paths: Mutex<HashMap<SessionId, PathTracker>>,
    /// Separate from each stream's own sequencer: decides which chunks are
    /// new enough to scan for directory hints.
    observed: Mutex<Sequencer>,
    scan_line_limit: usize,
}

impl Shared {
    fn with_paths<T>(&self, session: &SessionId, f: impl FnOnce(&mut PathTracker) -> T) -> T {
        let mut paths = self.paths.lock();
        let tracker = paths
            .entry(session.clone())
            .or_insert_with(|| PathTracker::new(self.scan_line_limit));
        f(tracker)
    }

    fn dispatch(&self, event: BackendEvent) {
        let Some(topic) = EventTopic::parse(&event.name) else {
            tracing::debug!(name = %event.name, "ignoring unknown backend event");
            return;
        };
        match topic {
            EventTopic::UploadProgress => {
                match serde_json::from_value::<UploadProgress>(event.payload) {
                    Ok(progress) => {
                        self.uploads.apply_progress(&progress);
                    }
                    Err(err) => tracing::warn!("malformed upload-progress payload: {err}"),
                }
            }
            EventTopic::Output(session) => {
                if !self.registry.has(&session) {
                    tracing::trace!(session = %session, "output for unknown session dropped");
                    return;
                }
                let chunk: OutputChunk = match serde_json::from_value(event.payload) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        tracing::warn!(session = %session, "malformed output payload: {err}");
                        return;
                    }
                };
                if self.observed.lock().accept(&session, chunk.seq, ()).is_some() {
                    self.with_paths(&session, |paths| paths.observe(&chunk.bytes));
                }
                self.router.publish(&session, SessionEvent::Output(chunk));
            }
            EventTopic::Status(session) => {
                if !self.registry.has(&session) {
                    tracing::trace!(session = %session, "status for unknown session dropped");
                    return;
                }
                let report: StatusReport = match serde_json::from_value(event.payload) {
                    Ok(report) => report,
                    Err(err) => {
                        tracing::warn!(session = %session, "malformed status payload: {err}");
                        return;
                    }
                };
                if let Some(home) = report.home_dir.as_deref() {
                    self.with_paths(&session, |paths| paths.set_home(home));
                }
                if report.state == Some(RemoteState::Closed) {
                    self.registry
                        .mark_remote_closed(&session, report.message.clone());
                }
                self.router.publish(&session, SessionEvent::Status(report));
            }
        }
    }
}

async fn run_dispatcher(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
    while let Some(event) = events.recv().await {
        shared.dispatch(event);
    }
    tracing::info!("backend event stream ended");
}

pub struct Coordinator {
    backend: Arc<dyn Backend>,
    shared: Arc<Shared>,
    coalescer: InputCoalescer,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Spawns the dispatcher on the current tokio runtime.
    pub fn new(
        backend: Arc<dyn Backend>,
        events: mpsc::UnboundedReceiver<BackendEvent>,
        settings: CoordinatorSettings,
    ) -> Self {
        let shared = Arc::new(Shared {
            registry: SessionRegistry::new(Arc::clone(&backend)),
            router: EventRouter::new(settings.router_buffer_limit),
            uploads: UploadTracker::new(Arc::clone(&backend)),
            paths: Mutex::new(HashMap::new()),
            observed: Mutex::new(Sequencer::new()),
            scan_line_limit: settings.scan_line_limit,
        });
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&shared), events));
        Self {
            coalescer: InputCoalescer::new(Arc::clone(&backend), settings.coalesce),
            backend,
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Connects a session for `tab`. Opening a session that is already live is
    /// a no-op that reports its current status.
    pub async fn open_session(
        &self,
        id: SessionId,
        tab: TabId,
        kind: SessionKind,
        settings: ConnectionSettings,
        size: TermSize,
    ) -> Result<SessionStatus> {
        match self.shared.registry.get(&id) {
            Some(existing) if !existing.status.is_terminal() => {
                tracing::debug!(session = %id, "open_session on live session ignored");
                return Ok(existing.status);
            }
            Some(_) => {
                // Reconnect: history from the previous connection must not replay.
                self.shared.router.remove_session(&id);
            }
            None => {}
        }

        self.shared.observed.lock().reset(&id);
        self.shared
            .paths
            .lock()
            .insert(id.clone(), PathTracker::new(self.shared.scan_line_limit));

        self.shared
            .registry
            .create_session(id, tab, kind, settings, size)
            .await
    }

    /// Cancels pending input, disconnects through the backend and forgets all
    /// per-session state.
    pub async fn close_session(&self, id: &SessionId) {
        self.coalescer.cancel(id);
        self.shared.registry.disconnect(id).await;
        self.forget(id);
    }

    /// Drops a failed session without contacting the backend.
    pub fn evict_session(&self, id: &SessionId) -> Option<Session> {
        self.coalescer.cancel(id);
        let session = self.shared.registry.evict(id);
        self.forget(id);
        session
    }

    fn forget(&self, id: &SessionId) {
        self.shared.router.remove_session(id);
        self.shared.observed.lock().forget(id);
        self.shared.paths.lock().remove(id);
    }

    /// Ordered, duplicate-free output for one rendering surface, starting
    /// with any banner the backend buffered before we listened. Each stream
    /// dedupes on its own, so several surfaces may follow one session.
    pub fn subscribe_output(&self, id: &SessionId) -> OutputStream {
        let subscription = self.shared.router.subscribe(id);
        let pending = self
            .backend
            .take_buffered_output(id)
            .into_iter()
            .map(SessionEvent::Output)
            .collect();
        OutputStream {
            session: id.clone(),
            subscription,
            sequencer: Sequencer::new(),
            pending,
        }
    }

    /// Raw routed events for observers other than the rendering surface.
    pub fn subscribe_events(&self, id: &SessionId) -> Subscription {
        self.shared.router.subscribe(id)
    }

    pub fn send_keystrokes(&self, id: &SessionId, data: &str) {
        match self.shared.registry.get(id).map(|s| s.status) {
            Some(SessionStatus::Connected) => self.coalescer.append(id, data),
            status => {
                tracing::debug!(session = %id, ?status, "keystrokes for inactive session dropped");
            }
        }
    }

    pub async fn flush_input(&self, id: &SessionId) {
        self.coalescer.flush(id).await;
    }

    pub async fn resize(&self, id: &SessionId, size: TermSize) {
        if !self.shared.registry.has(id) {
            return;
        }
        if let Err(err) = self.backend.resize(id, size).await {
            tracing::warn!(session = %id, "resize failed: {err:#}");
        }
    }

    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.shared.registry.get(id)
    }

    pub fn session_status(&self, id: &SessionId) -> Option<SessionStatus> {
        self.shared.registry.get(id).map(|s| s.status)
    }

    pub fn session_status_by_tab(&self, tab: &TabId) -> Option<SessionStatus> {
        self.shared.registry.get_by_tab(tab).map(|s| s.status)
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.shared.registry.list()
    }

    pub fn stats(&self) -> RegistryStats {
        self.shared.registry.stats()
    }

    pub fn list_upload_tasks(&self) -> Vec<UploadTask> {
        self.shared.uploads.list()
    }

    pub fn upload_task(&self, task: &TaskId) -> Option<UploadTask> {
        self.shared.uploads.get(task)
    }

    pub fn clear_finished_uploads(&self) -> usize {
        self.shared.uploads.clear()
    }

    /// Directory an upload dropped on this session should land in.
    pub fn resolve_upload_target<S>(&self, id: &SessionId, scrollback: &S) -> ResolvedTarget
    where
        S: ScrollbackSource + ?Sized,
    {
        let lines = scrollback.recent_lines(self.shared.scan_line_limit);
        self.shared.with_paths(id, |paths| paths.infer(&lines))
    }

    pub fn create_upload(&self, id: &SessionId, local_path: &Path) -> Result<TaskId> {
        if !self.shared.registry.has(id) {
            return Err(SessionError::UnknownSession(id.clone()));
        }
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SessionError::InvalidLocalPath(local_path.display().to_string()))?;
        Ok(self.shared.uploads.create(id, file_name))
    }

    /// Hands a created task to the backend. Returns the remote path.
    pub async fn issue_upload(
        &self,
        task: &TaskId,
        local_path: &Path,
        target_dir: &str,
    ) -> Result<String> {
        let session = self
            .shared
            .uploads
            .session_of(task)
            .ok_or_else(|| SessionError::UnknownTask(task.clone()))?;
        if self.session_status(&session) != Some(SessionStatus::Connected) {
            self.shared.uploads.fail(task, "session is not connected");
            return Err(SessionError::NotConnected(session));
        }
        let (last_known, home) = self.shared.with_paths(&session, |paths| {
            (
                paths.last_known().map(str::to_string),
                paths.home().map(str::to_string),
            )
        });
        self.shared
            .uploads
            .issue(
                task,
                local_path,
                target_dir,
                last_known.as_deref(),
                home.as_deref(),
            )
            .await
    }

    /// Resolve, create and issue in one step.
    pub async fn upload_file<S>(
        &self,
        id: &SessionId,
        local_path: &Path,
        scrollback: &S,
    ) -> Result<(TaskId, String)>
    where
        S: ScrollbackSource + ?Sized,
    {
        let target = self.resolve_upload_target(id, scrollback);
        let task = self.create_upload(id, local_path)?;
        let remote_path = self.issue_upload(&task, local_path, &target.path).await?;
        Ok((task, remote_path))
    }

    /// Lets a surface that receives bytes some other way feed directory hints.
    pub fn observe_terminal_output(&self, id: &SessionId, bytes: &[u8]) {
        self.shared.with_paths(id, |paths| paths.observe(bytes));
    }

    /// Flushes typed input, closes every session and stops the dispatcher.
    pub async fn shutdown(&self) {
        self.coalescer.shutdown().await;
        for session in self.shared.registry.list() {
            self.close_session(&session.id).await;
        }
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
        tracing::info!("coordinator shut down");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            dispatcher.abort();
        }
    }
}

/// Output for one rendering surface, filtered through its own sequencer.
pub struct OutputStream {
    session: SessionId,
    subscription: Subscription,
    sequencer: Sequencer,
    pending: VecDeque<SessionEvent>,
}

impl OutputStream {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    fn admit(&mut self, event: SessionEvent) -> Option<SessionEvent> {
        match event {
            SessionEvent::Output(chunk) => {
                let seq = chunk.seq;
                self.sequencer
                    .accept(&self.session, seq, SessionEvent::Output(chunk))
            }
            status @ SessionEvent::Status(_) => Some(status),
        }
    }

    /// Next event without blocking.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        while let Some(event) = self.pending.pop_front() {
            if let Some(event) = self.admit(event) {
                return Some(event);
            }
        }
        while let Ok(event) = self.subscription.try_recv() {
            if let Some(event) = self.admit(event) {
                return Some(event);
            }
        }
        None
    }

    /// Everything available right now, in order.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Blocks the calling thread. `Disconnected` once the session was closed
    /// and nothing is left to read.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<SessionEvent, RecvTimeoutError> {
        if let Some(event) = self.try_recv() {
            return Ok(event);
        }
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            let event = self.subscription.recv_timeout(left)?;
            if let Some(event) = self.admit(event) {
                return Ok(event);
            }
        }
    }

    /// Blocks the calling thread until an event arrives or the session is gone.
    pub fn recv(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.try_recv() {
            return Some(event);
        }
        while let Ok(event) = self.subscription.recv() {
            if let Some(event) = self.admit(event) {
                return Some(event);
            }
        }
        None
    }
}
