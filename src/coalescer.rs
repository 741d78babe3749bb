use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::model::SessionId;

pub const DEFAULT_THRESHOLD: usize = 32;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoalesceSettings {
    /// A buffer longer than this many characters is flushed immediately.
    pub threshold: usize,
    /// Quiet period after the last append before a timed flush.
    pub delay: Duration,
}

impl Default for CoalesceSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            delay: DEFAULT_DELAY,
        }
    }
}

enum Msg {
    Append(String),
    Flush(oneshot::Sender<()>),
}

struct Worker {
    tx: mpsc::UnboundedSender<Msg>,
    task: JoinHandle<()>,
}

/// Batches keystrokes per session into few backend input calls.
///
/// Each session gets one worker task that owns its buffer, so batches go out
/// in append order and an append never waits on an in-flight input call.
pub struct InputCoalescer {
    backend: Arc<dyn Backend>,
    settings: CoalesceSettings,
    workers: Mutex<HashMap<SessionId, Worker>>,
}

impl InputCoalescer {
    pub fn new(backend: Arc<dyn Backend>, settings: CoalesceSettings) -> Self {
        Self {
            backend,
            settings,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> CoalesceSettings {
        self.settings
    }

    /// Must be called from within a tokio runtime.
    pub fn append(&self, session: &SessionId, data: &str) {
        if data.is_empty() {
            return;
        }
        let mut workers = self.workers.lock();
        let worker = workers
            .entry(session.clone())
            .or_insert_with(|| self.spawn_worker(session.clone()));
        if worker.tx.send(Msg::Append(data.to_string())).is_err() {
            // The worker only stops when cancelled; start over with a fresh one.
            let fresh = self.spawn_worker(session.clone());
            let _ = fresh.tx.send(Msg::Append(data.to_string()));
            *worker = fresh;
        }
    }

    /// Sends whatever is buffered now and waits until the backend call returned.
    pub async fn flush(&self, session: &SessionId) {
        let tx = match self.workers.lock().get(session) {
            Some(worker) => worker.tx.clone(),
            None => return,
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(Msg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Drops the pending buffer and timer without sending anything.
    pub fn cancel(&self, session: &SessionId) {
        if let Some(worker) = self.workers.lock().remove(session) {
            worker.task.abort();
            tracing::debug!(session = %session, "input coalescer cancelled");
        }
    }

    /// Flushes every session, then stops all workers.
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionId> = self.workers.lock().keys().cloned().collect();
        for session in &sessions {
            self.flush(session).await;
        }
        for (_, worker) in self.workers.lock().drain() {
            worker.task.abort();
        }
    }

    fn spawn_worker(&self, session: SessionId) -> Worker {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coalesce_loop(
            session,
            Arc::clone(&self.backend),
            self.settings,
            rx,
        ));
        Worker { tx, task }
    }
}

async fn coalesce_loop(
    session: SessionId,
    backend: Arc<dyn Backend>,
    settings: CoalesceSettings,
    mut rx: mpsc::UnboundedReceiver<Msg>,
) {
    let mut pending = String::new();
    loop {
        let msg = if pending.is_empty() {
            rx.recv().await
        } else {
            // Every message restarts the quiet period.
            match tokio::time::timeout(settings.delay, rx.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    send_batch(&session, backend.as_ref(), &mut pending).await;
                    continue;
                }
            }
        };

        match msg {
            Some(Msg::Append(data)) => {
                pending.push_str(&data);
                if pending.chars().count() > settings.threshold {
                    send_batch(&session, backend.as_ref(), &mut pending).await;
                }
            }
            Some(Msg::Flush(ack)) => {
                send_batch(&session, backend.as_ref(), &mut pending).await;
                let _ = ack.send(());
            }
            None => {
                send_batch(&session, backend.as_ref(), &mut pending).await;
                return;
            }
        }
    }
}

async fn send_batch(session: &SessionId, backend: &dyn Backend, pending: &mut String) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    tracing::trace!(session = %session, len = batch.len(), "flushing input");
    if let Err(err) = backend.send_input(session, batch.into_bytes()).await {
        tracing::warn!(session = %session, "send_input failed: {err:#}");
    }
}
