use thiserror::Error;

use crate::model::{SessionId, TabId, TaskId};

/// Failures surfaced to callers of the coordinator.
///
/// Only session creation and upload issue report errors upward; every other
/// operation logs and degrades.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tab {tab} is already bound to live session {session}")]
    TabInUse { tab: TabId, session: SessionId },

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("session {0} is not connected")]
    NotConnected(SessionId),

    #[error("connection failed for session {session}: {message}")]
    Connect { session: SessionId, message: String },

    #[error("session {0} was closed while connecting")]
    Aborted(SessionId),

    #[error("transfer {task} failed: {message}")]
    Transfer { task: TaskId, message: String },

    #[error("invalid local path: {0}")]
    InvalidLocalPath(String),

    #[error("unknown upload task {0}")]
    UnknownTask(TaskId),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
