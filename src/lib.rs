//! Session and event coordination for a multi-tab remote terminal.
//!
//! The [`Coordinator`] sits between a transport [`Backend`] and the rendering
//! surfaces: it tracks session lifecycles, routes backend events to the right
//! surface in order, batches keystrokes, infers upload directories from
//! scrollback and follows uploads to completion.

pub mod backend;
pub mod coalescer;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod model;
pub mod path_inference;
pub mod registry;
pub mod router;
pub mod sequencer;
pub mod surface;
pub mod uploads;

pub use backend::{Backend, BackendEvent, EventSink, NativeBackend};
pub use coordinator::{Coordinator, CoordinatorSettings, OutputStream};
pub use error::{Result, SessionError};
pub use model::{ConnectionSettings, Session, SessionId, SessionKind, SessionStatus, TabId, TaskId, TermSize};
