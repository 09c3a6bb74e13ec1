use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use shellmux_types::{
    CloseReason, ConnectionId, EngineError, IdlePolicy, Result, SessionId, SessionSnapshot,
    SpawnRequest, DEFAULT_CLEANUP_INTERVAL_SECS, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_QUEUE_CAPACITY, MAX_CONCURRENT_SESSIONS,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broadcaster::{OutputBroadcaster, OutputSubscription};
use super::observer::{SessionEvent, SessionObserver};
use super::pty::{PtyRead, PtySession};
use super::session::ManagedSession;
use super::{CLOSED_TOMBSTONE_LIMIT, PTY_READ_TIMEOUT};

/// How long the reader waits for an exit status after end-of-file
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(500);

/// Shortest sweep period; `interval` rejects zero
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    pub idle_policy: IdlePolicy,
    pub queue_capacity: usize,
    pub replay_last_chunk: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: MAX_CONCURRENT_SESSIONS,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            idle_policy: IdlePolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            replay_last_chunk: false,
        }
    }
}

/// Bounded memory of closed ids, oldest forgotten first
#[derive(Default)]
struct Tombstones {
    ids: HashSet<SessionId>,
    order: VecDeque<SessionId>,
}

impl Tombstones {
    fn insert(&mut self, id: SessionId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > CLOSED_TOMBSTONE_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &SessionId) -> bool {
        self.ids.contains(id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of every live session.
///
/// The map lock is held only while an entry is inserted or removed; PTY work,
/// observer callbacks and process termination all happen outside it. A
/// session counts against `max_sessions` from the moment its slot is reserved
/// until it reaches `Closed`.
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: RwLock<HashMap<SessionId, Arc<ManagedSession>>>,
    tombstones: Mutex<Tombstones>,
    live: AtomicUsize,
    observers: Vec<SessionObserver>,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            tombstones: Mutex::new(Tombstones::default()),
            live: AtomicUsize::new(0),
            observers: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register an observer. Observers are called in registration order.
    pub fn with_observer(mut self, observer: SessionObserver) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Sessions currently holding a capacity slot
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Spawn a new session and start pumping its output
    pub async fn create(self: &Arc<Self>, request: SpawnRequest) -> Result<SessionId> {
        self.reserve_slot()?;

        let pty = match PtySession::spawn(&request) {
            Ok(pty) => pty,
            Err(e) => {
                self.release_slot();
                warn!(command = %request.command, error = %e, "failed to spawn session");
                return Err(e);
            }
        };

        let broadcaster =
            OutputBroadcaster::new(self.config.queue_capacity, self.config.replay_last_chunk);

        let session = {
            let mut sessions = self.sessions.write().await;
            let mut id = Uuid::new_v4();
            {
                let tombstones = lock(&self.tombstones);
                while sessions.contains_key(&id) || tombstones.contains(&id) {
                    id = Uuid::new_v4();
                }
            }
            let session = Arc::new(ManagedSession::new(id, &request, pty, broadcaster));
            sessions.insert(id, session.clone());
            session
        };

        let snapshot = session.snapshot(self.config.idle_timeout);
        info!(
            session_id = %session.id,
            command = %snapshot.command,
            rows = snapshot.rows,
            cols = snapshot.cols,
            live = self.live_count(),
            "session created"
        );
        self.emit(&SessionEvent::Created(snapshot));

        // Started after `Created` so an immediate exit is reported after it.
        self.spawn_reader(session.clone());

        Ok(session.id)
    }

    pub async fn get(&self, id: SessionId) -> Result<SessionSnapshot> {
        let session = self.lookup(id).await?;
        Ok(session.snapshot(self.config.idle_timeout))
    }

    /// All registered sessions, most recently active first
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<ManagedSession>> =
            self.sessions.read().await.values().cloned().collect();

        let mut snapshots: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|session| session.snapshot(self.config.idle_timeout))
            .collect();
        snapshots.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        snapshots
    }

    /// Forward input. `Ok(false)` means the session exists but no longer
    /// accepts input; a failed write to a live process is `Write`.
    pub async fn write_input(&self, id: SessionId, data: &[u8]) -> Result<bool> {
        let session = self.lookup(id).await?;
        session.write_input(data).await.inspect_err(|e| {
            warn!(session_id = %id, error = %e, "input write failed");
        })
    }

    pub async fn resize(&self, id: SessionId, rows: u16, cols: u16) -> Result<bool> {
        let session = self.lookup(id).await?;
        let resized = session.resize(rows, cols).await?;
        if resized {
            debug!(session_id = %id, rows, cols, "session resized");
            self.emit(&SessionEvent::Resized { id, rows, cols });
        }
        Ok(resized)
    }

    /// Close and unregister a session. Closing an id that was already closed
    /// returns `Ok(false)`; an id never seen is `SessionNotFound`.
    pub async fn close(&self, id: SessionId) -> Result<bool> {
        let removed = self.sessions.write().await.remove(&id);
        match removed {
            Some(session) => {
                lock(&self.tombstones).insert(id);
                self.terminate(&session, CloseReason::Requested).await;
                Ok(true)
            }
            None if lock(&self.tombstones).contains(&id) => Ok(false),
            None => Err(EngineError::SessionNotFound(id)),
        }
    }

    /// Subscribe a connection to a session's output. On a session whose
    /// process already exited the subscription yields the output nobody
    /// received yet and then ends.
    pub async fn attach(
        &self,
        id: SessionId,
        connection_id: ConnectionId,
    ) -> Result<OutputSubscription> {
        let session = self.lookup(id).await?;
        if session.is_closed() {
            debug!(session_id = %id, %connection_id, "attached to exited session");
            return Ok(session.broadcaster.attach(connection_id));
        }

        session.add_connection(connection_id);
        debug!(session_id = %id, %connection_id, "connection attached");
        Ok(session.broadcaster.attach(connection_id))
    }

    /// Drop a connection's subscription. Unknown sessions and connections
    /// are ignored.
    pub async fn detach(&self, id: SessionId, connection_id: ConnectionId) -> bool {
        let Ok(session) = self.lookup(id).await else {
            return false;
        };
        session.broadcaster.detach(connection_id);
        let removed = session.remove_connection(connection_id);
        if removed {
            debug!(session_id = %id, %connection_id, "connection detached");
        }
        removed
    }

    /// Plain-text rendering of the session's current screen
    pub async fn screen_text(&self, id: SessionId) -> Result<String> {
        let session = self.lookup(id).await?;
        Ok(session.screen_text())
    }

    /// Close every session idle longer than the configured timeout.
    /// Returns the ids that were reaped.
    pub async fn reap_idle(&self) -> Vec<SessionId> {
        let timeout = self.config.idle_timeout;
        let policy = self.config.idle_policy;

        let candidates: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|session| session.is_reapable(timeout, policy))
            .map(|session| session.id)
            .collect();

        let mut reaped = Vec::with_capacity(candidates.len());
        for id in candidates {
            // Activity may have arrived since the scan.
            let removed = {
                let mut sessions = self.sessions.write().await;
                match sessions.get(&id) {
                    Some(session) if session.is_reapable(timeout, policy) => sessions.remove(&id),
                    _ => None,
                }
            };
            let Some(session) = removed else {
                continue;
            };

            lock(&self.tombstones).insert(id);
            info!(
                session_id = %id,
                idle_secs = session.idle_for().as_secs(),
                "reaping idle session"
            );
            if !self.terminate(&session, CloseReason::IdleTimeout).await {
                warn!(session_id = %id, "idle session did not terminate cleanly; removed anyway");
            }
            reaped.push(id);
        }
        reaped
    }

    /// Start the periodic idle sweep. The loop stops on `shutdown` or once
    /// the registry is dropped.
    pub fn spawn_cleanup_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.cleanup_interval.max(MIN_CLEANUP_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let reaped = registry.reap_idle().await;
                if !reaped.is_empty() {
                    info!(count = reaped.len(), live = registry.live_count(), "idle sweep finished");
                }
            }

            debug!("session cleanup loop stopped");
        })
    }

    /// Stop the cleanup loop and close every session
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let drained: Vec<Arc<ManagedSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };

        info!(count = drained.len(), "shutting down sessions");
        for session in drained {
            lock(&self.tombstones).insert(session.id);
            self.terminate(&session, CloseReason::Shutdown).await;
        }
    }

    async fn lookup(&self, id: SessionId) -> Result<Arc<ManagedSession>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::SessionNotFound(id))
    }

    fn reserve_slot(&self) -> Result<()> {
        let max = self.config.max_sessions;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < max).then_some(live + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                warn!(max, "session limit reached");
                EngineError::ResourceExhausted { max }
            })
    }

    fn release_slot(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| live.checked_sub(1));
    }

    /// Stop the reader, end subscriptions and kill the process. The slot is
    /// released and `Closed` emitted only if the session was still running.
    async fn terminate(&self, session: &ManagedSession, reason: CloseReason) -> bool {
        let transitioned = session.mark_closed(None);
        session.reader_cancel.cancel();
        session.broadcaster.close();

        let terminated = session.pty.close(true).await;

        if transitioned {
            self.release_slot();
            info!(session_id = %session.id, reason = ?reason, live = self.live_count(), "session closed");
            self.emit(&SessionEvent::Closed {
                id: session.id,
                reason,
            });
        }
        terminated
    }

    /// Process ended on its own: the entry stays (so the id still resolves)
    /// but it no longer counts against capacity.
    async fn handle_exit(&self, session: &ManagedSession) {
        let deadline = Instant::now() + EXIT_STATUS_WAIT;
        while session.pty.is_alive() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if session.pty.is_alive() {
            // Output closed but the process lingers; end it.
            session.pty.close(true).await;
        }

        let exit_code = session.pty.exit_code();
        session.broadcaster.close();

        if session.mark_closed(exit_code) {
            self.release_slot();
            info!(session_id = %session.id, ?exit_code, live = self.live_count(), "session process exited");
            self.emit(&SessionEvent::Exited {
                id: session.id,
                exit_code,
            });
            self.emit(&SessionEvent::Closed {
                id: session.id,
                reason: CloseReason::ProcessExited,
            });
        }
    }

    fn spawn_reader(self: &Arc<Self>, session: Arc<ManagedSession>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let cancel = session.reader_cancel.clone();

        tokio::spawn(async move {
            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = session.pty.read(PTY_READ_TIMEOUT) => read,
                };

                match read {
                    PtyRead::Data(data) => session.record_output(&data),
                    PtyRead::Empty => {}
                    PtyRead::Eof => {
                        match registry.upgrade() {
                            Some(registry) => registry.handle_exit(&session).await,
                            None => {
                                session.broadcaster.close();
                            }
                        }
                        break;
                    }
                }
            }
            debug!(session_id = %session.id, "reader loop finished");
        });
    }

    fn emit(&self, event: &SessionEvent) {
        for observer in &self.observers {
            observer(event);
        }
    }
}
