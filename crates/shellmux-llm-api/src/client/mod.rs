use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

pub mod openai_compat;

pub use openai_compat::OpenAiCompatClient;

/// Chat message structure (OpenAI-compatible format)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Streaming chunk for LLM responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingChunk {
    /// Everything received so far
    pub content: String,
    /// Text added by this chunk
    pub delta: String,
    pub finish_reason: Option<String>,
}

/// Stream of chunks returned by [`LlmClient::chat_streaming`]. Dropping it
/// abandons the underlying HTTP response.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamingChunk>> + Send>>;

/// LLM client trait - unified interface for all text-generation providers
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Short label used in logs
    fn name(&self) -> &str;

    /// Model used when a call does not name one
    fn default_model(&self) -> &str;

    /// Simple chat completion. `model` overrides the default model.
    async fn chat_completion(&self, messages: &[ChatMessage], model: Option<&str>) -> Result<String>;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Streaming chat completion - returns a stream of chunks
    async fn chat_streaming(
        &self,
        _messages: Vec<ChatMessage>,
        _model: Option<&str>,
    ) -> Result<ChunkStream> {
        Err(anyhow::anyhow!("Streaming not implemented for {}", self.name()))
    }

    /// Cheap reachability probe used at startup
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
