use crate::SessionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error taxonomy shared by the terminal engine, the assistance layer and
/// every wire surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    #[error("maximum concurrent sessions ({max}) reached")]
    ResourceExhausted { max: usize },

    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("failed to write to session: {0}")]
    Write(String),

    #[error("invalid resize: {0}")]
    Resize(String),

    #[error("assistance unavailable: {0}")]
    AssistanceUnavailable(String),

    #[error("assistance timed out after {0}s")]
    AssistanceTimeout(u64),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    /// Stable machine-readable code used in `error{code,message}` frames
    /// and REST error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::SessionClosed(_) => "session_closed",
            EngineError::ResourceExhausted { .. } => "resource_exhausted",
            EngineError::Spawn { .. } => "spawn_error",
            EngineError::Write(_) => "write_error",
            EngineError::Resize(_) => "resize_error",
            EngineError::AssistanceUnavailable(_) => "assistance_unavailable",
            EngineError::AssistanceTimeout(_) => "assistance_timeout",
            EngineError::Protocol(_) => "protocol_error",
        }
    }

    pub fn spawn(command: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::Spawn {
            command: command.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_codes_are_distinct() {
        let id = Uuid::new_v4();
        let all = [
            EngineError::SessionNotFound(id),
            EngineError::SessionClosed(id),
            EngineError::ResourceExhausted { max: 2 },
            EngineError::spawn("nope", "not found"),
            EngineError::Write("broken pipe".into()),
            EngineError::Resize("rows must be positive".into()),
            EngineError::AssistanceUnavailable("both failed".into()),
            EngineError::AssistanceTimeout(30),
            EngineError::Protocol("unknown type".into()),
        ];
        let mut codes: Vec<_> = all.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_display_includes_context() {
        let err = EngineError::ResourceExhausted { max: 3 };
        assert_eq!(err.to_string(), "maximum concurrent sessions (3) reached");

        let err = EngineError::spawn("does-not-exist", "No such file");
        assert!(err.to_string().contains("does-not-exist"));
        assert_eq!(err.code(), "spawn_error");
    }
}
