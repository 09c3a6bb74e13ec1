use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use shellmux_types::{EngineError, Result, SpawnRequest};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::CLOSE_GRACE_PERIOD;

/// Chunks buffered between the blocking reader thread and async readers
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Largest batch handed out by a single `read`
const MAX_READ_BATCH: usize = 64 * 1024;

/// Outcome of a bounded read from the PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyRead {
    /// New output bytes
    Data(Vec<u8>),
    /// Nothing arrived within the timeout
    Empty,
    /// The process has exited and all buffered output was drained
    Eof,
}

/// One spawned process attached to its own pseudo-terminal.
///
/// Writer, master and child sit behind separate locks so a write never waits
/// on a resize and neither waits on output. Output is pumped by a dedicated
/// blocking thread into a bounded channel that `read` drains.
pub struct PtySession {
    command: String,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    output: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    exit_code: Mutex<Option<u32>>,
    exited: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PtySession {
    /// Spawn `request.command` on a new PTY sized to `request.rows` x `request.cols`.
    ///
    /// The command line is split on whitespace; the program is resolved on
    /// `PATH` before anything is started, so a missing program never leaves a
    /// process behind.
    pub fn spawn(request: &SpawnRequest) -> Result<Self> {
        if request.rows == 0 || request.cols == 0 {
            return Err(EngineError::spawn(
                &request.command,
                "terminal dimensions must be positive",
            ));
        }

        let mut parts = request.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| EngineError::spawn(&request.command, "empty command"))?;

        let working_dir = match &request.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        };
        if !working_dir.is_dir() {
            return Err(EngineError::spawn(
                &request.command,
                format!("working directory {} does not exist", working_dir.display()),
            ));
        }

        let mut cmd = CommandBuilder::new(program);
        cmd.args(parts);
        cmd.cwd(&working_dir);
        if !request.env.iter().any(|(key, _)| key == "TERM") {
            cmd.env("TERM", "xterm-256color");
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| EngineError::spawn(&request.command, format!("failed to open PTY: {e}")))?;

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| EngineError::spawn(&request.command, e))?;

        // Keeping the slave open would hide end-of-file from the reader.
        drop(pair.slave);

        let master = pair.master;
        let io = master
            .try_clone_reader()
            .and_then(|reader| master.take_writer().map(|writer| (reader, writer)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::spawn(
                    &request.command,
                    format!("failed to attach PTY streams: {e}"),
                ));
            }
        };

        let pid = child.process_id();
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let label = format!("pty-reader-{}", pid.unwrap_or_default());
        if let Err(e) = thread::Builder::new()
            .name(label)
            .spawn(move || pump_output(reader, tx))
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::spawn(
                &request.command,
                format!("failed to start reader thread: {e}"),
            ));
        }

        debug!(command = %request.command, ?pid, rows = request.rows, cols = request.cols, "spawned PTY process");

        Ok(Self {
            command: request.command.clone(),
            pid,
            master: Mutex::new(master),
            child: Mutex::new(child),
            writer: Mutex::new(Some(writer)),
            output: tokio::sync::Mutex::new(rx),
            exit_code: Mutex::new(None),
            exited: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Forward bytes to the process. `Ok(false)` when the session is no
    /// longer alive; an I/O failure on a live session is a `Write` error.
    pub fn write(&self, data: &[u8]) -> Result<bool> {
        if !self.is_alive() {
            return Ok(false);
        }

        let mut writer = lock(&self.writer);
        let Some(writer) = writer.as_mut() else {
            return Ok(false);
        };

        match writer.write_all(data).and_then(|_| writer.flush()) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(command = %self.command, error = %e, "PTY write failed");
                Err(EngineError::Write(e.to_string()))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn replace_writer(&self, writer: Box<dyn Write + Send>) {
        *lock(&self.writer) = Some(writer);
    }

    /// Wait up to `timeout` for new output.
    ///
    /// Whatever is already buffered is coalesced into one chunk so a chatty
    /// process does not turn into thousands of tiny frames.
    pub async fn read(&self, timeout: Duration) -> PtyRead {
        let mut output = self.output.lock().await;

        let mut data = match tokio::time::timeout(timeout, output.recv()).await {
            Ok(Some(data)) => data,
            Ok(None) => return PtyRead::Eof,
            Err(_) => return PtyRead::Empty,
        };

        while data.len() < MAX_READ_BATCH {
            match output.try_recv() {
                Ok(more) => data.extend_from_slice(&more),
                Err(_) => break,
            }
        }

        PtyRead::Data(data)
    }

    /// Update the PTY window size. Zero dimensions are rejected; a dead
    /// session yields `Ok(false)`.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<bool> {
        if rows == 0 || cols == 0 {
            return Err(EngineError::Resize(format!(
                "rows and cols must be positive (got {rows}x{cols})"
            )));
        }
        if !self.is_alive() {
            return Ok(false);
        }

        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| EngineError::Resize(e.to_string()))?;

        Ok(true)
    }

    /// Liveness probe. Never fails; a process whose status cannot be queried
    /// counts as dead.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.poll_exit()
    }

    /// Exit code, once the process has been observed to exit
    pub fn exit_code(&self) -> Option<u32> {
        self.poll_exit();
        *lock(&self.exit_code)
    }

    /// Terminate the process and release the input side of the PTY.
    ///
    /// A hang-up and terminate signal are sent first and the process gets
    /// `CLOSE_GRACE_PERIOD` to exit, which also reaps it. With `force`, one
    /// still running after that is killed; without, false is returned and
    /// the process is killed when this session is dropped. Closing an
    /// already closed session returns true without signalling anything.
    pub async fn close(&self, force: bool) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return true;
        }

        lock(&self.writer).take();

        if self.poll_exit() {
            return true;
        }

        self.signal_terminate();

        let deadline = Instant::now() + CLOSE_GRACE_PERIOD;
        while Instant::now() < deadline {
            if self.poll_exit() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if !force {
            debug!(command = %self.command, pid = ?self.pid, "PTY process outlived the grace period");
            return false;
        }

        let mut child = lock(&self.child);
        match child.kill() {
            Ok(()) => {
                let _ = child.wait();
                debug!(command = %self.command, pid = ?self.pid, "killed PTY process after grace period");
                true
            }
            Err(e) if e.kind() == ErrorKind::InvalidInput => true,
            Err(e) => {
                warn!(command = %self.command, pid = ?self.pid, error = %e, "failed to kill PTY process");
                false
            }
        }
    }

    /// Returns true once the child has exited, recording its exit code.
    fn poll_exit(&self) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            return true;
        }

        let status = lock(&self.child).try_wait();
        match status {
            Ok(Some(status)) => {
                *lock(&self.exit_code) = Some(status.exit_code());
                self.exited.store(true, Ordering::SeqCst);
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!(command = %self.command, error = %e, "failed to query PTY process status");
                self.exited.store(true, Ordering::SeqCst);
                true
            }
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&self) {
        let Some(pid) = self.pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
            let _ = lock(&self.child).kill();
            return;
        };

        // The child leads its own session, so signal the whole process group.
        // Interactive shells ignore SIGTERM; SIGHUP is what a closing terminal
        // delivers.
        for signal in [libc::SIGHUP, libc::SIGTERM] {
            // SAFETY: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(-pid, signal) };
            if rc != 0 {
                // SAFETY: as above.
                unsafe { libc::kill(pid, signal) };
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {
        let _ = lock(&self.child).kill();
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if self.poll_exit() {
            return;
        }
        let child = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        if child.kill().is_ok() {
            let _ = child.wait();
        }
    }
}

/// Blocking loop moving master-side output into the async channel. Ends on
/// end-of-file, a read error (EIO once the child is gone), or when nobody is
/// listening anymore.
fn pump_output(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buffer = vec![0u8; 4096];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}
