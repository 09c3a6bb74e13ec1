//! Core types and structures for shellmux
//!
//! This crate provides the foundational types shared by the terminal engine,
//! the assistance layer and the application crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

mod error;

pub use error::{EngineError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default upper bound on concurrently live sessions
pub const MAX_CONCURRENT_SESSIONS: usize = 15;

/// Default terminal dimensions
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Idle sessions are reaped after this many seconds without activity
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;

/// How often the cleanup loop scans the registry
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Per-connection output queue capacity, in chunks
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Terminal context embedded into assistance prompts is cut to this many chars
pub const MAX_CONTEXT_CHARS: usize = 4000;

// ============================================================================
// Identifiers
// ============================================================================

/// Session ID type
pub type SessionId = Uuid;

/// Connection ID type
pub type ConnectionId = Uuid;

// ============================================================================
// Session lifecycle
// ============================================================================

/// Derived lifecycle state of a session.
///
/// `Idle` is never stored; it is computed from the last-activity timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Idle,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Closed => "closed",
        }
    }
}

/// Why a session left the registry (or stopped running)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Explicit close request
    Requested,
    /// Reaped by the cleanup loop
    IdleTimeout,
    /// The process exited on its own
    ProcessExited,
    /// Registry shutdown
    Shutdown,
}

/// Whether an attached connection keeps a session from being reaped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlePolicy {
    /// Reap on input/output inactivity alone, even with viewers attached
    #[default]
    KeystrokeOnly,
    /// Never reap a session that has at least one attached connection
    ConnectionPresence,
}

impl FromStr for IdlePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "keystroke_only" | "keystroke" => Ok(Self::KeystrokeOnly),
            "connection_presence" | "connection" => Ok(Self::ConnectionPresence),
            _ => Err(format!(
                "Invalid idle policy: '{}'. Valid options: 'keystroke_only', 'connection_presence'",
                s
            )),
        }
    }
}

impl fmt::Display for IdlePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeystrokeOnly => write!(f, "keystroke_only"),
            Self::ConnectionPresence => write!(f, "connection_presence"),
        }
    }
}

// ============================================================================
// Session projections
// ============================================================================

/// Read-only projection of a session used for listing and status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub command: String,
    pub cwd: PathBuf,
    pub rows: u16,
    pub cols: u16,
    pub alive: bool,
    pub state: SessionState,
    pub idle_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<u32>,
    pub attached_connections: usize,
}

/// Parameters for spawning a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub command: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
}

impl SpawnRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
            cwd: None,
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }

    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}
