//! Per-session fan-out of backend events.
//!
//! Every event published for a session is appended to that session's buffer,
//! whether or not anyone is listening. A new subscriber first receives the
//! buffered history in arrival order, then live events. The buffer is dropped
//! once the last subscriber goes away.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::backend::{OutputChunk, StatusReport};
use crate::model::SessionId;

pub const DEFAULT_BUFFER_LIMIT: usize = 4096;

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Output(OutputChunk),
    Status(StatusReport),
}

#[derive(Default)]
struct SubscriberSet {
    subscribers: Vec<(u64, Sender<SessionEvent>)>,
    buffer: VecDeque<SessionEvent>,
}

#[derive(Default)]
struct RouterState {
    sessions: HashMap<SessionId, SubscriberSet>,
    next_subscriber: u64,
}

#[derive(Clone)]
pub struct EventRouter {
    state: Arc<Mutex<RouterState>>,
    buffer_limit: usize,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_LIMIT)
    }
}

impl EventRouter {
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(RouterState::default())),
            buffer_limit: buffer_limit.max(1),
        }
    }

    /// Registers a subscriber and queues the buffered history on it before
    /// returning, so the first `try_recv` already sees it.
    pub fn subscribe(&self, session: &SessionId) -> Subscription {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut state = self.state.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;

        let set = state.sessions.entry(session.clone()).or_default();
        for event in &set.buffer {
            // The receiver is still in our hands, this cannot fail.
            let _ = tx.send(event.clone());
        }
        set.subscribers.push((id, tx));
        tracing::debug!(
            session = %session,
            subscriber = id,
            replayed = set.buffer.len(),
            "subscribed"
        );

        Subscription {
            session: session.clone(),
            id,
            rx,
            state: Arc::downgrade(&self.state),
        }
    }

    pub fn publish(&self, session: &SessionId, event: SessionEvent) {
        let mut state = self.state.lock();
        let set = state.sessions.entry(session.clone()).or_default();

        if set.buffer.len() >= self.buffer_limit {
            set.buffer.pop_front();
            tracing::warn!(
                session = %session,
                limit = self.buffer_limit,
                "event buffer full; dropping oldest event"
            );
        }
        set.buffer.push_back(event.clone());

        set.subscribers.retain(|(id, tx)| match tx.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(session = %session, subscriber = *id, "subscriber gone; pruning");
                false
            }
        });
    }

    /// Forgets subscribers and buffered history for a closed session.
    pub fn remove_session(&self, session: &SessionId) {
        if self.state.lock().sessions.remove(session).is_some() {
            tracing::debug!(session = %session, "router state removed");
        }
    }

    pub fn subscriber_count(&self, session: &SessionId) -> usize {
        self.state
            .lock()
            .sessions
            .get(session)
            .map_or(0, |set| set.subscribers.len())
    }

    pub fn buffered_len(&self, session: &SessionId) -> usize {
        self.state
            .lock()
            .sessions
            .get(session)
            .map_or(0, |set| set.buffer.len())
    }
}

/// Read cursor for one session. Dropping it unsubscribes.
pub struct Subscription {
    session: SessionId,
    id: u64,
    rx: Receiver<SessionEvent>,
    state: Weak<Mutex<RouterState>>,
}

impl Subscription {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn try_recv(&self) -> Result<SessionEvent, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<SessionEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn recv(&self) -> Result<SessionEvent, RecvError> {
        self.rx.recv()
    }

    /// Everything currently queued, without blocking.
    pub fn drain(&self) -> Vec<SessionEvent> {
        self.rx.try_iter().collect()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock();
        let Some(set) = state.sessions.get_mut(&self.session) else {
            return;
        };
        let before = set.subscribers.len();
        set.subscribers.retain(|(id, _)| *id != self.id);
        // A subscription from before `remove_session` must not clear the
        // history of the session that replaced it.
        if set.subscribers.len() < before && set.subscribers.is_empty() {
            state.sessions.remove(&self.session);
            tracing::debug!(session = %self.session, "last subscriber left; buffer cleared");
        }
    }
}
