#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use rusty_session::backend::{
    Backend, BackendEvent, ConnectRequest, EventSink, OutputChunk, StatusReport, TransferStatus,
    UploadProgress,
};
use rusty_session::{SessionId, TaskId, TermSize};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Connect(SessionId),
    Disconnect(SessionId),
    Input(SessionId, String),
    Resize(SessionId, TermSize),
    Transfer {
        session: SessionId,
        task: TaskId,
        remote_path: String,
    },
}

type DisconnectHook = Box<dyn Fn(&SessionId) + Send + Sync>;

/// Backend double that records every call and emits events on demand.
pub struct MockBackend {
    sink: EventSink,
    calls: Mutex<Vec<Call>>,
    connect_error: Mutex<Option<String>>,
    disconnect_error: Mutex<Option<String>>,
    transfer_error: Mutex<Option<String>>,
    holding: Mutex<bool>,
    gates: Mutex<VecDeque<Arc<Notify>>>,
    banners: Mutex<HashMap<SessionId, Vec<OutputChunk>>>,
    on_disconnect: Mutex<Option<DisconnectHook>>,
}

impl MockBackend {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BackendEvent>) {
        let (sink, rx) = EventSink::channel();
        let backend = Arc::new(Self {
            sink,
            calls: Mutex::new(Vec::new()),
            connect_error: Mutex::new(None),
            disconnect_error: Mutex::new(None),
            transfer_error: Mutex::new(None),
            holding: Mutex::new(false),
            gates: Mutex::new(VecDeque::new()),
            banners: Mutex::new(HashMap::new()),
            on_disconnect: Mutex::new(None),
        });
        (backend, rx)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Connect(_)))
            .count()
    }

    pub fn inputs(&self, session: &SessionId) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Input(s, data) if s == session => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn fail_connects(&self, message: &str) {
        *self.connect_error.lock() = Some(message.to_string());
    }

    pub fn allow_connects(&self) {
        *self.connect_error.lock() = None;
    }

    pub fn fail_disconnects(&self, message: &str) {
        *self.disconnect_error.lock() = Some(message.to_string());
    }

    pub fn reject_transfers(&self, message: &str) {
        *self.transfer_error.lock() = Some(message.to_string());
    }

    /// Connects block until `release_connect` lets them through, oldest
    /// first. Holding stops once every held connect has been released.
    pub fn hold_connects(&self) {
        *self.holding.lock() = true;
    }

    pub fn release_connect(&self) {
        let mut gates = self.gates.lock();
        if let Some(gate) = gates.pop_front() {
            gate.notify_one();
        }
        if gates.is_empty() {
            *self.holding.lock() = false;
        }
    }

    pub fn set_banner(&self, session: &SessionId, chunks: Vec<OutputChunk>) {
        self.banners.lock().insert(session.clone(), chunks);
    }

    pub fn on_disconnect(&self, hook: impl Fn(&SessionId) + Send + Sync + 'static) {
        *self.on_disconnect.lock() = Some(Box::new(hook));
    }

    pub fn emit_output(&self, session: &SessionId, seq: u64, text: &str) {
        self.sink.output(session, &chunk(seq, text));
    }

    pub fn emit_status(&self, session: &SessionId, report: StatusReport) {
        self.sink.status(session, &report);
    }

    pub fn emit_progress(
        &self,
        session: &SessionId,
        task: &TaskId,
        status: TransferStatus,
        uploaded: u64,
        total: u64,
    ) {
        let progress = if total == 0 {
            0.0
        } else {
            uploaded as f64 * 100.0 / total as f64
        };
        self.sink.upload_progress(&UploadProgress {
            task_id: task.clone(),
            session_id: session.clone(),
            progress,
            uploaded_bytes: uploaded,
            total_bytes: Some(total),
            status,
            speed: 0.0,
            error: None,
        });
    }

    pub fn emit_raw(&self, event: BackendEvent) {
        self.sink.emit(event);
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn connect(&self, request: ConnectRequest) -> Result<()> {
        self.calls
            .lock()
            .push(Call::Connect(request.session_id.clone()));
        let gate = if *self.holding.lock() {
            let gate = Arc::new(Notify::new());
            self.gates.lock().push_back(Arc::clone(&gate));
            Some(gate)
        } else {
            None
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        match self.connect_error.lock().clone() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, session: &SessionId) -> Result<()> {
        self.calls.lock().push(Call::Disconnect(session.clone()));
        if let Some(hook) = self.on_disconnect.lock().as_ref() {
            hook(session);
        }
        match self.disconnect_error.lock().clone() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    async fn send_input(&self, session: &SessionId, data: Vec<u8>) -> Result<()> {
        let text = String::from_utf8_lossy(&data).into_owned();
        self.calls.lock().push(Call::Input(session.clone(), text));
        Ok(())
    }

    async fn resize(&self, session: &SessionId, size: TermSize) -> Result<()> {
        self.calls.lock().push(Call::Resize(session.clone(), size));
        Ok(())
    }

    fn take_buffered_output(&self, session: &SessionId) -> Vec<OutputChunk> {
        self.banners.lock().remove(session).unwrap_or_default()
    }

    async fn transfer_file(
        &self,
        session: &SessionId,
        task: &TaskId,
        _local_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        self.calls.lock().push(Call::Transfer {
            session: session.clone(),
            task: task.clone(),
            remote_path: remote_path.to_string(),
        });
        match self.transfer_error.lock().clone() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }
}

pub fn chunk(seq: u64, text: &str) -> OutputChunk {
    OutputChunk {
        seq,
        bytes: text.as_bytes().to_vec(),
        ts: 0,
    }
}

/// Polls until `check` holds, yielding to the dispatcher in between.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Gives spawned tasks a chance to drain already queued events.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}
