use shellmux_types::{CloseReason, SessionId, SessionSnapshot};

/// Lifecycle notifications emitted by the registry, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Created(SessionSnapshot),
    Resized {
        id: SessionId,
        rows: u16,
        cols: u16,
    },
    Exited {
        id: SessionId,
        exit_code: Option<u32>,
    },
    Closed {
        id: SessionId,
        reason: CloseReason,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::Created(snapshot) => snapshot.id,
            SessionEvent::Resized { id, .. }
            | SessionEvent::Exited { id, .. }
            | SessionEvent::Closed { id, .. } => *id,
        }
    }
}

/// Observer invoked synchronously, in registration order, for every event.
/// Observers run on the task that caused the event and must not block.
pub type SessionObserver = Box<dyn Fn(&SessionEvent) + Send + Sync>;
