//! The native transport collaborator.
//!
//! The coordination layer only talks to [`Backend`] and consumes the single
//! [`BackendEvent`] stream produced through an [`EventSink`]. Event names are
//! namespaced by session (`output-<id>`, `status-<id>`), except the global
//! `upload-progress` stream which carries the session id in its payload.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{ConnectionSettings, SessionId, SessionKind, TaskId, TermSize};

pub mod local;
pub mod native;
pub mod ssh;
mod transfer;

pub use native::NativeBackend;

pub const OUTPUT_EVENT_PREFIX: &str = "output-";
pub const STATUS_EVENT_PREFIX: &str = "status-";
pub const UPLOAD_PROGRESS_EVENT: &str = "upload-progress";

/// Output kept for a session until the UI drains it with `take_buffered_output`.
const BANNER_CHUNK_LIMIT: usize = 256;

#[derive(Clone, Debug)]
pub struct ConnectRequest {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub settings: ConnectionSettings,
    pub size: TermSize,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> anyhow::Result<()>;

    async fn disconnect(&self, session: &SessionId) -> anyhow::Result<()>;

    async fn send_input(&self, session: &SessionId, data: Vec<u8>) -> anyhow::Result<()>;

    async fn resize(&self, session: &SessionId, size: TermSize) -> anyhow::Result<()>;

    /// Drains output produced before any listener was attached (login banners).
    fn take_buffered_output(&self, session: &SessionId) -> Vec<OutputChunk>;

    /// Starts a transfer and returns once it is queued. Completion and progress
    /// arrive only as `upload-progress` events.
    async fn transfer_file(
        &self,
        session: &SessionId,
        task: &TaskId,
        local_path: &Path,
        remote_path: &str,
    ) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub seq: u64,
    #[serde(with = "bytes_b64")]
    pub bytes: Vec<u8>,
    /// Unix time in milliseconds.
    pub ts: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteState {
    Connected,
    Closed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(default)]
    pub state: Option<RemoteState>,
    #[serde(default)]
    pub home_dir: Option<String>,
    #[serde(default)]
    pub bytes_in: Option<u64>,
    #[serde(default)]
    pub bytes_out: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Uploading,
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub task_id: TaskId,
    pub session_id: SessionId,
    /// Percentage, 0-100.
    pub progress: f64,
    pub uploaded_bytes: u64,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    pub status: TransferStatus,
    /// Bytes per second.
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub error: Option<String>,
}

/// One named event as emitted by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

impl BackendEvent {
    pub fn output(session: &SessionId, chunk: &OutputChunk) -> Self {
        Self {
            name: EventTopic::Output(session.clone()).event_name(),
            payload: serde_json::to_value(chunk).unwrap_or_default(),
        }
    }

    pub fn status(session: &SessionId, report: &StatusReport) -> Self {
        Self {
            name: EventTopic::Status(session.clone()).event_name(),
            payload: serde_json::to_value(report).unwrap_or_default(),
        }
    }

    pub fn upload_progress(progress: &UploadProgress) -> Self {
        Self {
            name: UPLOAD_PROGRESS_EVENT.to_string(),
            payload: serde_json::to_value(progress).unwrap_or_default(),
        }
    }
}

/// Routing key extracted from an event name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventTopic {
    Output(SessionId),
    Status(SessionId),
    UploadProgress,
}

impl EventTopic {
    pub fn parse(name: &str) -> Option<Self> {
        if name == UPLOAD_PROGRESS_EVENT {
            return Some(Self::UploadProgress);
        }
        if let Some(id) = name.strip_prefix(OUTPUT_EVENT_PREFIX) {
            return (!id.is_empty()).then(|| Self::Output(SessionId::from(id)));
        }
        if let Some(id) = name.strip_prefix(STATUS_EVENT_PREFIX) {
            return (!id.is_empty()).then(|| Self::Status(SessionId::from(id)));
        }
        None
    }

    pub fn event_name(&self) -> String {
        match self {
            Self::Output(id) => format!("{OUTPUT_EVENT_PREFIX}{id}"),
            Self::Status(id) => format!("{STATUS_EVENT_PREFIX}{id}"),
            Self::UploadProgress => UPLOAD_PROGRESS_EVENT.to_string(),
        }
    }
}

/// Write half of the upstream event stream.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<BackendEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BackendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: BackendEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event stream closed; dropping backend event");
        }
    }

    pub fn output(&self, session: &SessionId, chunk: &OutputChunk) {
        self.emit(BackendEvent::output(session, chunk));
    }

    pub fn status(&self, session: &SessionId, report: &StatusReport) {
        self.emit(BackendEvent::status(session, report));
    }

    pub fn upload_progress(&self, progress: &UploadProgress) {
        self.emit(BackendEvent::upload_progress(progress));
    }
}

/// Numbers output chunks for one session and keeps the pre-listener banner.
#[derive(Debug)]
pub(crate) struct OutputLog {
    next_seq: u64,
    banner: Option<Vec<OutputChunk>>,
}

impl Default for OutputLog {
    fn default() -> Self {
        Self {
            // Sequence numbers start at 1: the UI treats 0 as "nothing seen".
            next_seq: 1,
            banner: Some(Vec::new()),
        }
    }
}

impl OutputLog {
    pub(crate) fn record(&mut self, bytes: &[u8]) -> OutputChunk {
        let chunk = OutputChunk {
            seq: self.next_seq,
            bytes: bytes.to_vec(),
            ts: now_millis(),
        };
        self.next_seq += 1;
        if let Some(banner) = self.banner.as_mut() {
            if banner.len() < BANNER_CHUNK_LIMIT {
                banner.push(chunk.clone());
            }
        }
        chunk
    }

    /// Hands out the banner once; later output is only delivered as events.
    pub(crate) fn drain(&mut self) -> Vec<OutputChunk> {
        self.banner.take().unwrap_or_default()
    }
}

pub(crate) fn now_millis() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}

mod bytes_b64 {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: impl AsRef<[u8]>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
