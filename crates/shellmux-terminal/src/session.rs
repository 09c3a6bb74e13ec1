use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use shellmux_types::{
    ConnectionId, IdlePolicy, Result, SessionId, SessionSnapshot, SessionState, SpawnRequest,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::broadcaster::OutputBroadcaster;
use super::pty::PtySession;
use super::screen_buffer::ScreenBuffer;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mutable per-session fields. Everything the cleanup loop reads lives here,
/// behind one lock, so a scan never sees a half-applied update.
struct SessionFields {
    rows: u16,
    cols: u16,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    closed: bool,
    exit_code: Option<u32>,
    attached: HashSet<ConnectionId>,
}

/// A registered session: the PTY, its output fan-out and screen, plus the
/// bookkeeping the registry needs.
pub(crate) struct ManagedSession {
    pub(crate) id: SessionId,
    command: String,
    cwd: PathBuf,
    created_at: DateTime<Utc>,
    fields: Mutex<SessionFields>,
    pub(crate) pty: PtySession,
    pub(crate) broadcaster: OutputBroadcaster,
    screen: Mutex<ScreenBuffer>,
    write_lock: tokio::sync::Mutex<()>,
    resize_lock: tokio::sync::Mutex<()>,
    pub(crate) reader_cancel: CancellationToken,
}

impl ManagedSession {
    pub(crate) fn new(
        id: SessionId,
        request: &SpawnRequest,
        pty: PtySession,
        broadcaster: OutputBroadcaster,
    ) -> Self {
        let cwd = request
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));

        Self {
            id,
            command: request.command.clone(),
            cwd,
            created_at: Utc::now(),
            fields: Mutex::new(SessionFields {
                rows: request.rows,
                cols: request.cols,
                last_activity: Instant::now(),
                last_activity_at: Utc::now(),
                closed: false,
                exit_code: None,
                attached: HashSet::new(),
            }),
            pty,
            broadcaster,
            screen: Mutex::new(ScreenBuffer::new(request.rows, request.cols)),
            write_lock: tokio::sync::Mutex::new(()),
            resize_lock: tokio::sync::Mutex::new(()),
            reader_cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn touch(&self) {
        let mut fields = lock(&self.fields);
        fields.last_activity = Instant::now();
        fields.last_activity_at = Utc::now();
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.fields).closed
    }

    pub(crate) fn idle_for(&self) -> Duration {
        lock(&self.fields).last_activity.elapsed()
    }

    /// Whether the cleanup loop may reap this session under `policy`
    pub(crate) fn is_reapable(&self, idle_timeout: Duration, policy: IdlePolicy) -> bool {
        let fields = lock(&self.fields);
        if fields.last_activity.elapsed() <= idle_timeout {
            return false;
        }
        match policy {
            IdlePolicy::KeystrokeOnly => true,
            IdlePolicy::ConnectionPresence => fields.closed || fields.attached.is_empty(),
        }
    }

    /// Move to `Closed`. Returns true only for the call that made the
    /// transition.
    pub(crate) fn mark_closed(&self, exit_code: Option<u32>) -> bool {
        let mut fields = lock(&self.fields);
        if exit_code.is_some() {
            fields.exit_code = exit_code;
        }
        !std::mem::replace(&mut fields.closed, true)
    }

    /// Record fresh PTY output: screen, activity, fan-out
    pub(crate) fn record_output(&self, data: &[u8]) {
        lock(&self.screen).process_output(data);
        self.touch();
        self.broadcaster.publish(data);
    }

    /// Serialized write. `Ok(false)` for a closed or dead session.
    pub(crate) async fn write_input(&self, data: &[u8]) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.is_closed() {
            return Ok(false);
        }
        let written = self.pty.write(data)?;
        if written {
            self.touch();
        }
        Ok(written)
    }

    /// Serialized resize. Dimensions are recorded only once the PTY accepted them.
    pub(crate) async fn resize(&self, rows: u16, cols: u16) -> Result<bool> {
        let _guard = self.resize_lock.lock().await;
        if !self.pty.resize(rows, cols)? {
            return Ok(false);
        }

        lock(&self.screen).resize(rows, cols);
        let mut fields = lock(&self.fields);
        fields.rows = rows;
        fields.cols = cols;
        fields.last_activity = Instant::now();
        fields.last_activity_at = Utc::now();
        Ok(true)
    }

    pub(crate) fn screen_text(&self) -> String {
        lock(&self.screen).contents()
    }

    pub(crate) fn add_connection(&self, connection_id: ConnectionId) {
        lock(&self.fields).attached.insert(connection_id);
    }

    pub(crate) fn remove_connection(&self, connection_id: ConnectionId) -> bool {
        lock(&self.fields).attached.remove(&connection_id)
    }

    pub(crate) fn snapshot(&self, idle_timeout: Duration) -> SessionSnapshot {
        let alive = self.pty.is_alive();
        let pty_exit = self.pty.exit_code();

        let fields = lock(&self.fields);
        let idle = fields.last_activity.elapsed();
        let state = if fields.closed || !alive {
            SessionState::Closed
        } else if idle > idle_timeout {
            SessionState::Idle
        } else {
            SessionState::Active
        };

        SessionSnapshot {
            id: self.id,
            created_at: self.created_at,
            last_activity: fields.last_activity_at,
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            rows: fields.rows,
            cols: fields.cols,
            alive: alive && !fields.closed,
            state,
            idle_ms: u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
            exit_code: fields.exit_code.or(pty_exit),
            attached_connections: fields.attached.len(),
        }
    }
}
