use std::collections::HashMap;

use crate::model::SessionId;

/// Per-session gate that lets through only strictly increasing sequence numbers.
#[derive(Debug, Default)]
pub struct Sequencer {
    last_seq: HashMap<SessionId, u64>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the payload when `seq` is newer than anything seen for `session`.
    pub fn accept<T>(&mut self, session: &SessionId, seq: u64, payload: T) -> Option<T> {
        let last = self.last_seq.entry(session.clone()).or_insert(0);
        if seq <= *last {
            tracing::trace!(session = %session, seq, last = *last, "dropping stale output");
            return None;
        }
        *last = seq;
        Some(payload)
    }

    pub fn reset(&mut self, session: &SessionId) {
        self.last_seq.insert(session.clone(), 0);
    }

    pub fn forget(&mut self, session: &SessionId) {
        self.last_seq.remove(session);
    }

    pub fn last_seq(&self, session: &SessionId) -> u64 {
        self.last_seq.get(session).copied().unwrap_or(0)
    }
}
