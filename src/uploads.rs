use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

use crate::backend::{Backend, TransferStatus, UploadProgress};
use crate::error::{Result, SessionError};
use crate::model::{SessionId, TaskId};
use crate::path_inference::remote;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Pending,
    Uploading,
    Success,
    Error,
}

impl UploadState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct UploadTask {
    pub id: TaskId,
    pub session_id: SessionId,
    pub file_name: String,
    pub local_path: Option<PathBuf>,
    pub remote_path: Option<String>,
    pub status: UploadState,
    /// Percentage, 0-100.
    pub progress: f64,
    pub uploaded_bytes: Option<u64>,
    pub file_size: Option<u64>,
    /// Bytes per second.
    pub speed: Option<f64>,
    pub eta: Option<Duration>,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub error: Option<String>,
}

impl UploadTask {
    fn touch(&mut self, message: String) {
        self.message = message;
        self.timestamp = OffsetDateTime::now_utc();
    }
}

#[derive(Default)]
struct TaskTable {
    tasks: Vec<UploadTask>,
    next_id: u64,
}

impl TaskTable {
    fn get_mut(&mut self, id: &TaskId) -> Option<&mut UploadTask> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }
}

/// Tracks uploads from creation to their terminal state.
///
/// Tasks are created locally, handed to the backend, and from then on only
/// change when a progress event with the matching task and session arrives.
pub struct UploadTracker {
    backend: Arc<dyn Backend>,
    table: Mutex<TaskTable>,
}

impl UploadTracker {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            table: Mutex::new(TaskTable::default()),
        }
    }

    pub fn create(&self, session: &SessionId, file_name: &str) -> TaskId {
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = TaskId::new(format!(
            "upload-{}-{}",
            table.next_id,
            crate::backend::now_millis()
        ));
        table.tasks.push(UploadTask {
            id: id.clone(),
            session_id: session.clone(),
            file_name: file_name.to_string(),
            local_path: None,
            remote_path: None,
            status: UploadState::Pending,
            progress: 0.0,
            uploaded_bytes: None,
            file_size: None,
            speed: None,
            eta: None,
            message: "Waiting".to_string(),
            timestamp: OffsetDateTime::now_utc(),
            error: None,
        });
        tracing::debug!(task = %id, session = %session, file = file_name, "upload created");
        id
    }

    /// Computes the remote path, marks the task uploading and hands it to the
    /// backend. Returns the remote path once the backend accepted the transfer;
    /// completion is only reported through progress events.
    pub async fn issue(
        &self,
        task: &TaskId,
        local_path: &Path,
        target_dir: &str,
        last_known: Option<&str>,
        home: Option<&str>,
    ) -> Result<String> {
        let (session, remote_path) = {
            let mut table = self.table.lock();
            let entry = table
                .get_mut(task)
                .ok_or_else(|| SessionError::UnknownTask(task.clone()))?;
            if entry.status != UploadState::Pending {
                return Err(SessionError::Transfer {
                    task: task.clone(),
                    message: "upload was already issued".to_string(),
                });
            }
            let dir = remote::upload_dir(target_dir, last_known, home);
            let remote_path = remote::join(&dir, &entry.file_name);
            entry.local_path = Some(local_path.to_path_buf());
            entry.remote_path = Some(remote_path.clone());
            entry.status = UploadState::Uploading;
            entry.touch(format!("Uploading to {remote_path}"));
            (entry.session_id.clone(), remote_path)
        };

        tracing::info!(task = %task, session = %session, remote = %remote_path, "issuing upload");
        if let Err(err) = self
            .backend
            .transfer_file(&session, task, local_path, &remote_path)
            .await
        {
            let message = format!("{err:#}");
            tracing::warn!(task = %task, "transfer rejected: {message}");
            if let Some(entry) = self.table.lock().get_mut(task) {
                if !entry.status.is_finished() {
                    entry.status = UploadState::Error;
                    entry.error = Some(message.clone());
                    entry.touch(format!("Failed: {message}"));
                }
            }
            return Err(SessionError::Transfer {
                task: task.clone(),
                message,
            });
        }
        Ok(remote_path)
    }

    /// Applies a backend progress event. Returns false when it matched no live
    /// task.
    pub fn apply_progress(&self, event: &UploadProgress) -> bool {
        let mut table = self.table.lock();
        let Some(task) = table.get_mut(&event.task_id) else {
            tracing::debug!(task = %event.task_id, "progress for unknown task");
            return false;
        };
        if task.session_id != event.session_id {
            tracing::warn!(
                task = %event.task_id,
                expected = %task.session_id,
                got = %event.session_id,
                "progress from another session ignored"
            );
            return false;
        }
        if task.status.is_finished() {
            return false;
        }

        task.progress = event.progress.clamp(0.0, 100.0);
        task.uploaded_bytes = Some(event.uploaded_bytes);
        if event.total_bytes.is_some() {
            task.file_size = event.total_bytes;
        }
        task.speed = Some(event.speed);
        task.eta = match (task.file_size, event.speed) {
            (Some(size), speed) if speed.is_finite() && speed > 0.0 => {
                let remaining = size.saturating_sub(event.uploaded_bytes) as f64;
                // Absurd rates from a stalled transfer overflow a Duration.
                Duration::try_from_secs_f64(remaining / speed).ok()
            }
            _ => None,
        };

        let message = match event.status {
            TransferStatus::Uploading => {
                task.status = UploadState::Uploading;
                format!("Uploading {:.0}%", task.progress)
            }
            TransferStatus::Success => {
                task.status = UploadState::Success;
                task.progress = 100.0;
                task.eta = None;
                format!(
                    "Uploaded to {}",
                    task.remote_path.as_deref().unwrap_or(&task.file_name)
                )
            }
            TransferStatus::Error => {
                task.status = UploadState::Error;
                task.eta = None;
                let error = event
                    .error
                    .clone()
                    .unwrap_or_else(|| "upload failed".to_string());
                let message = format!("Failed: {error}");
                task.error = Some(error);
                message
            }
        };
        task.touch(message);
        true
    }

    /// Moves a task that never reached the backend straight to `Error`.
    pub fn fail(&self, task: &TaskId, message: &str) {
        if let Some(entry) = self.table.lock().get_mut(task) {
            if !entry.status.is_finished() {
                entry.status = UploadState::Error;
                entry.error = Some(message.to_string());
                entry.touch(format!("Failed: {message}"));
            }
        }
    }

    pub fn session_of(&self, task: &TaskId) -> Option<SessionId> {
        self.table
            .lock()
            .tasks
            .iter()
            .find(|t| &t.id == task)
            .map(|t| t.session_id.clone())
    }

    pub fn get(&self, task: &TaskId) -> Option<UploadTask> {
        self.table.lock().tasks.iter().find(|t| &t.id == task).cloned()
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Vec<UploadTask> {
        self.table.lock().tasks.clone()
    }

    /// Removes finished tasks; pending and uploading ones are kept.
    pub fn clear(&self) -> usize {
        let mut table = self.table.lock();
        let before = table.tasks.len();
        table.tasks.retain(|t| !t.status.is_finished());
        before - table.tasks.len()
    }
}
