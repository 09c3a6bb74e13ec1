//! # shellmux-llm-api
//!
//! Text-generation capabilities used by the terminal assistant.
//!
//! Every provider sits behind the [`LlmClient`] trait. One concrete client is
//! shipped: an OpenAI-compatible chat-completions client that covers OpenAI,
//! Groq and llama.cpp servers, with optional SSE streaming.
//!
//! ## Example
//!
//! ```rust,no_run
//! use shellmux_llm_api::{ChatMessage, ClientFactory};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = ClientFactory::from_spec("gpt-4o-mini@openai", None, "primary", None)?;
//!     let reply = client
//!         .chat_completion(&[ChatMessage::user("How do I list open ports?")], None)
//!         .await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod request_logger;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use client::{ChatMessage, ChunkStream, LlmClient, StreamingChunk};

pub use config::{
    get_default_url_for_backend, normalize_api_url, parse_model_spec, BackendType, ClientFactory,
    ModelSpec, GROQ_API_URL, OPENAI_API_URL,
};

pub use request_logger::RequestLogger;

/// Truncate to at most `max_chars` characters, marking the cut with "..."
pub fn safe_truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let keep = max_chars.saturating_sub(3);
        format!("{}...", s.chars().take(keep).collect::<String>())
    }
}
