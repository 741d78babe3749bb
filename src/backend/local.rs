use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use super::transfer::TransferReporter;
use super::{EventSink, OutputChunk, OutputLog, RemoteState, StatusReport};
use crate::model::{SessionId, TaskId, TermSize};

const READ_BUFFER: usize = 8 * 1024;

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows.max(1),
        cols: size.cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A shell on this machine behind a pseudo terminal.
pub struct LocalShell {
    session_id: SessionId,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    output: Arc<Mutex<OutputLog>>,
}

impl LocalShell {
    pub fn spawn(session_id: SessionId, size: TermSize, sink: EventSink) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new_default_prog();
        cmd.env("TERM", "xterm-256color");
        if let Some(home) = home_dir() {
            cmd.cwd(home);
        }
        let child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn local shell")?;
        // The slave end belongs to the child now.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair.master.take_writer().context("Failed to take PTY writer")?;
        let output = Arc::new(Mutex::new(OutputLog::default()));

        {
            let session_id = session_id.clone();
            let output = Arc::clone(&output);
            let sink = sink.clone();
            thread::Builder::new()
                .name(format!("pty-reader-{session_id}"))
                .spawn(move || read_loop(session_id, reader, output, sink))
                .context("Failed to start PTY reader")?;
        }

        if let Some(home) = home_dir() {
            sink.status(
                &session_id,
                &StatusReport {
                    state: Some(RemoteState::Connected),
                    home_dir: Some(home.to_string_lossy().into_owned()),
                    ..Default::default()
                },
            );
        }
        tracing::info!(session = %session_id, "local shell started");

        Ok(Self {
            session_id,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            output,
        })
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data).context("PTY write failed")?;
        writer.flush().context("PTY flush failed")?;
        Ok(())
    }

    pub fn resize(&self, size: TermSize) -> Result<()> {
        self.master
            .lock()
            .resize(pty_size(size))
            .map_err(|err| anyhow!("Failed to resize PTY: {err}"))
    }

    pub fn take_buffered_output(&self) -> Vec<OutputChunk> {
        self.output.lock().drain()
    }

    pub fn kill(&self) {
        let mut child = self.child.lock();
        if let Err(err) = child.kill() {
            tracing::debug!(session = %self.session_id, "kill failed: {err}");
        }
        let _ = child.wait();
    }

    /// Local "uploads" copy the file inside this machine's filesystem.
    pub fn start_upload(
        &self,
        task: TaskId,
        local_path: PathBuf,
        target: String,
        sink: EventSink,
    ) {
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let total = tokio::fs::metadata(&local_path).await.ok().map(|m| m.len());
            let reporter = TransferReporter::new(session_id, task, sink, total);
            reporter.started();
            let result = copy_file(&reporter, &local_path, &target).await;
            reporter.finish(result);
        });
    }
}

async fn copy_file(reporter: &TransferReporter, local_path: &Path, target: &str) -> Result<u64> {
    let source = tokio::fs::File::open(local_path)
        .await
        .with_context(|| format!("Unable to open {}", local_path.display()))?;
    let target = expand_home(target);
    let dest = tokio::fs::File::create(&target)
        .await
        .with_context(|| format!("Unable to create {}", target.display()))?;
    reporter.pump(source, dest).await
}

fn read_loop(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    output: Arc<Mutex<OutputLog>>,
    sink: EventSink,
) {
    let mut buf = [0u8; READ_BUFFER];
    let mut bytes_in = 0u64;
    let message = loop {
        match reader.read(&mut buf) {
            Ok(0) => break None,
            Ok(n) => {
                bytes_in += n as u64;
                let chunk = output.lock().record(&buf[..n]);
                sink.output(&session_id, &chunk);
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(session = %session_id, "PTY read ended: {err}");
                // EIO is how Linux reports a PTY whose child has exited.
                break (err.raw_os_error() != Some(5)).then(|| err.to_string());
            }
        }
    };
    tracing::info!(session = %session_id, bytes_in, "local shell exited");
    sink.status(
        &session_id,
        &StatusReport {
            state: Some(RemoteState::Closed),
            bytes_in: Some(bytes_in),
            message,
            ..Default::default()
        },
    );
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Relative and `~` targets are taken from the home directory, the way SFTP
/// resolves them on a remote host.
fn expand_home(target: &str) -> PathBuf {
    let home = home_dir();
    if let Some(rest) = target.strip_prefix("~/") {
        if let Some(home) = home {
            return home.join(rest);
        }
    }
    let path = PathBuf::from(target);
    match home {
        Some(home) if path.is_relative() => home.join(path),
        _ => path,
    }
}
