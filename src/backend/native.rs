use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::local::LocalShell;
use super::ssh::{SshOptions, SshShell};
use super::{Backend, BackendEvent, ConnectRequest, EventSink, OutputChunk};
use crate::model::{SessionId, SessionKind, TaskId, TermSize};

#[derive(Clone)]
enum Transport {
    Ssh(Arc<SshShell>),
    Local(Arc<LocalShell>),
}

/// Backend that owns real transports: russh sessions and local PTYs.
pub struct NativeBackend {
    sink: EventSink,
    options: SshOptions,
    sessions: Mutex<HashMap<SessionId, Transport>>,
}

impl NativeBackend {
    pub fn new(sink: EventSink, options: SshOptions) -> Self {
        Self {
            sink,
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Backend plus the event stream it will emit into.
    pub fn with_stream(options: SshOptions) -> (Self, mpsc::UnboundedReceiver<BackendEvent>) {
        let (sink, rx) = EventSink::channel();
        (Self::new(sink, options), rx)
    }

    fn transport(&self, session: &SessionId) -> Result<Transport> {
        self.sessions
            .lock()
            .get(session)
            .cloned()
            .ok_or_else(|| anyhow!("No transport for session {session}"))
    }
}

#[async_trait]
impl Backend for NativeBackend {
    async fn connect(&self, request: ConnectRequest) -> Result<()> {
        let session_id = request.session_id.clone();
        let transport = match request.kind {
            SessionKind::Ssh => Transport::Ssh(Arc::new(
                SshShell::open(request, self.options, self.sink.clone()).await?,
            )),
            SessionKind::Local => Transport::Local(Arc::new(LocalShell::spawn(
                session_id.clone(),
                request.size,
                self.sink.clone(),
            )?)),
        };
        if let Some(previous) = self.sessions.lock().insert(session_id.clone(), transport) {
            tracing::warn!(session = %session_id, "replacing a live transport");
            close(&previous);
        }
        Ok(())
    }

    async fn disconnect(&self, session: &SessionId) -> Result<()> {
        let transport = self
            .sessions
            .lock()
            .remove(session)
            .ok_or_else(|| anyhow!("No transport for session {session}"))?;
        close(&transport);
        Ok(())
    }

    async fn send_input(&self, session: &SessionId, data: Vec<u8>) -> Result<()> {
        match self.transport(session)? {
            Transport::Ssh(shell) => shell.send_input(data),
            Transport::Local(shell) => {
                tokio::task::spawn_blocking(move || shell.write(&data)).await?
            }
        }
    }

    async fn resize(&self, session: &SessionId, size: TermSize) -> Result<()> {
        match self.transport(session)? {
            Transport::Ssh(shell) => shell.resize(size),
            Transport::Local(shell) => shell.resize(size),
        }
    }

    fn take_buffered_output(&self, session: &SessionId) -> Vec<OutputChunk> {
        match self.transport(session) {
            Ok(Transport::Ssh(shell)) => shell.take_buffered_output(),
            Ok(Transport::Local(shell)) => shell.take_buffered_output(),
            Err(_) => Vec::new(),
        }
    }

    async fn transfer_file(
        &self,
        session: &SessionId,
        task: &TaskId,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        if !local_path.is_file() {
            return Err(anyhow!("{} is not a readable file", local_path.display()));
        }
        let sink = self.sink.clone();
        match self.transport(session)? {
            Transport::Ssh(shell) => shell.start_upload(
                task.clone(),
                local_path.to_path_buf(),
                remote_path.to_string(),
                sink,
            ),
            Transport::Local(shell) => shell.start_upload(
                task.clone(),
                local_path.to_path_buf(),
                remote_path.to_string(),
                sink,
            ),
        }
        Ok(())
    }
}

fn close(transport: &Transport) {
    match transport {
        Transport::Ssh(shell) => shell.disconnect(),
        Transport::Local(shell) => {
            let shell = Arc::clone(shell);
            // Reaping the child can block briefly.
            tokio::task::spawn_blocking(move || shell.kill());
        }
    }
}
