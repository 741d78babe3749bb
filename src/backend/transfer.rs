use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{EventSink, TransferStatus, UploadProgress};
use crate::model::{SessionId, TaskId};

const CHUNK_SIZE: usize = 32 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Reports progress for one upload onto the event stream.
pub(crate) struct TransferReporter {
    session_id: SessionId,
    task_id: TaskId,
    sink: EventSink,
    total: Option<u64>,
}

impl TransferReporter {
    pub(crate) fn new(
        session_id: SessionId,
        task_id: TaskId,
        sink: EventSink,
        total: Option<u64>,
    ) -> Self {
        Self {
            session_id,
            task_id,
            sink,
            total,
        }
    }

    fn emit(&self, status: TransferStatus, uploaded: u64, speed: f64, error: Option<String>) {
        let progress = match self.total {
            Some(0) => 100.0,
            Some(total) => (uploaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0),
            None => 0.0,
        };
        self.sink.upload_progress(&UploadProgress {
            task_id: self.task_id.clone(),
            session_id: self.session_id.clone(),
            progress,
            uploaded_bytes: uploaded,
            total_bytes: self.total,
            status,
            speed,
            error,
        });
    }

    pub(crate) fn started(&self) {
        self.emit(TransferStatus::Uploading, 0, 0.0, None);
    }

    pub(crate) fn finish(&self, result: Result<u64>) {
        match result {
            Ok(bytes) => {
                tracing::info!(task = %self.task_id, bytes, "upload finished");
                self.emit(TransferStatus::Success, bytes, 0.0, None);
            }
            Err(err) => {
                tracing::warn!(task = %self.task_id, "upload failed: {err:#}");
                self.emit(TransferStatus::Error, 0, 0.0, Some(format!("{err:#}")));
            }
        }
    }

    /// Copies `reader` into `writer`, emitting throttled progress events.
    pub(crate) async fn pump<R, W>(&self, mut reader: R, mut writer: W) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let mut last_emit = started;
        let mut uploaded = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .context("Failed to read local file")?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .context("Failed to write remote file")?;
            uploaded += n as u64;

            if last_emit.elapsed() >= PROGRESS_INTERVAL {
                let secs = started.elapsed().as_secs_f64();
                let speed = if secs > 0.0 { uploaded as f64 / secs } else { 0.0 };
                self.emit(TransferStatus::Uploading, uploaded, speed, None);
                last_emit = Instant::now();
            }
        }
        writer.flush().await.context("Failed to flush remote file")?;
        writer
            .shutdown()
            .await
            .context("Failed to close remote file")?;
        Ok(uploaded)
    }
}
