// Terminal session engine
//
// This crate owns PTY-backed processes, fans their output out to any number of
// attached connections, keeps a VT100 rendering of each screen for assistance
// context, and reaps sessions that have gone idle.

mod broadcaster;
mod observer;
mod pty;
mod registry;
mod screen_buffer;
mod session;

// Re-export public API
pub use broadcaster::{Delivery, OutputBroadcaster, OutputSubscription};
pub use observer::{SessionEvent, SessionObserver};
pub use pty::{PtyRead, PtySession};
pub use registry::{RegistryConfig, SessionRegistry};
pub use screen_buffer::ScreenBuffer;

use std::time::Duration;

// Constants
pub const DEFAULT_SCROLLBACK_LINES: usize = 1000;

/// Upper bound on a single PTY read wait, so reader loops stay responsive to
/// cancellation.
pub const PTY_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Time a process gets between SIGTERM and SIGKILL on a forced close
pub const CLOSE_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Number of closed session ids remembered so a repeated close is a no-op
pub const CLOSED_TOMBSTONE_LIMIT: usize = 4096;
