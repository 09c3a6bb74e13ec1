// Terminal-aware assistance
//
// Wraps a primary and an optional fallback text-generation capability behind
// one adapter that builds prompts from terminal context and offers both a
// one-shot completion and a cancellable event stream.

mod adapter;
mod capability;
pub mod prompt;

pub use adapter::{AssistEvent, AssistStream, AssistanceAdapter};
pub use capability::Capability;

use std::time::Duration;

/// Default deadline for a whole assistance call, fallback included
pub const DEFAULT_ASSIST_TIMEOUT: Duration = Duration::from_secs(60);
