use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shellmux_types::EngineError;

/// Message types a client may send
pub const CLIENT_MESSAGE_TYPES: &[&str] = &["input", "resize", "assist", "ping"];

/// Error code sent when a connection's output queue overflowed
pub const OUTPUT_TRUNCATED: &str = "output_truncated";

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes or pasted text for the PTY
    Input { data: String },
    Resize { rows: u16, cols: u16 },
    /// Ask the assistant; `context` defaults to the session's current screen
    Assist {
        query: String,
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default = "default_stream")]
        stream: bool,
    },
    Ping {
        #[serde(default)]
        nonce: Value,
    },
}

fn default_stream() -> bool {
    true
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// PTY output, base64 encoded
    Output { data: String },
    Error { code: String, message: String },
    AssistStart,
    AssistChunk { text: String },
    AssistEnd,
    Pong { nonce: Value },
}

impl ServerMessage {
    pub fn output(bytes: &[u8]) -> Self {
        ServerMessage::Output {
            data: BASE64.encode(bytes),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn truncated(dropped: usize) -> Self {
        Self::error(
            OUTPUT_TRUNCATED,
            format!("{dropped} output chunk(s) dropped because the connection fell behind"),
        )
    }
}

impl From<&EngineError> for ServerMessage {
    fn from(err: &EngineError) -> Self {
        ServerMessage::error(err.code(), err.to_string())
    }
}

/// Why an inbound text frame could not be turned into a [`ClientMessage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not JSON, not an object, or no string `type`; the connection is closed
    Malformed(String),
    /// Well-formed frame of a type this server does not know; recoverable
    UnknownType(String),
    /// Known type with missing or ill-typed fields; recoverable
    InvalidPayload { kind: String, reason: String },
}

impl DecodeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Malformed(_))
    }

    pub fn to_engine_error(&self) -> EngineError {
        let message = match self {
            DecodeError::Malformed(reason) => format!("malformed frame: {reason}"),
            DecodeError::UnknownType(kind) => format!("unknown message type '{kind}'"),
            DecodeError::InvalidPayload { kind, reason } => format!("invalid '{kind}' message: {reason}"),
        };
        EngineError::Protocol(message)
    }
}

/// Classify and decode one inbound text frame
pub fn decode_client_message(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing 'type' field".to_string()))?
        .to_string();

    if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}
