use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use shellmux_llm_api::{ChatMessage, ChunkStream, LlmClient, StreamingChunk};
use shellmux_types::{EngineError, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capability::Capability;
use super::prompt::build_messages;
use super::DEFAULT_ASSIST_TIMEOUT;

/// One item of an assistance stream. A stream always yields exactly one
/// `Start`, any number of `Chunk`s, at most one `Error` and exactly one
/// `End`, in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssistEvent {
    Start,
    Chunk(String),
    Error(EngineError),
    End,
}

/// Lazy, finite assistance stream with a cancellation handle.
///
/// Cancelling drops the provider stream (and with it the HTTP response) at
/// the next poll; the stream then yields `End`. Dropping the stream has the
/// same effect.
pub struct AssistStream {
    events: Pin<Box<dyn Stream<Item = AssistEvent> + Send>>,
    cancel: CancellationToken,
}

impl AssistStream {
    /// Handle that cancels this stream; cancelling twice, or after the
    /// stream finished, does nothing.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for AssistStream {
    type Item = AssistEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.as_mut().poll_next(cx)
    }
}

/// Terminal-aware front for the configured text-generation capabilities.
///
/// Capabilities are tried in order: primary, then fallback. When none is
/// reachable the adapter is disabled and every call reports
/// `AssistanceUnavailable`.
pub struct AssistanceAdapter {
    capabilities: Vec<Capability>,
    timeout: Duration,
}

impl Default for AssistanceAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_ASSIST_TIMEOUT)
    }
}

impl AssistanceAdapter {
    /// A disabled adapter until `initialize` finds a reachable capability
    pub fn new(timeout: Duration) -> Self {
        Self {
            capabilities: Vec::new(),
            timeout,
        }
    }

    /// Probe both capabilities and keep the reachable ones. Returns false
    /// when neither is reachable; the adapter is then disabled.
    pub async fn initialize(
        &mut self,
        primary: Option<Arc<dyn LlmClient>>,
        fallback: Option<Arc<dyn LlmClient>>,
    ) -> bool {
        let candidates = primary
            .map(Capability::Primary)
            .into_iter()
            .chain(fallback.map(Capability::Fallback));

        self.capabilities.clear();
        for capability in candidates {
            match capability.client().health_check().await {
                Ok(()) => {
                    info!(
                        capability = capability.role(),
                        client = capability.client().name(),
                        model = capability.client().default_model(),
                        "assistance capability ready"
                    );
                    self.capabilities.push(capability);
                }
                Err(e) => warn!(
                    capability = capability.role(),
                    client = capability.client().name(),
                    error = %e,
                    "assistance capability unreachable"
                ),
            }
        }

        if self.capabilities.is_empty() {
            warn!("no assistance capability reachable; assistance disabled");
        }
        self.is_enabled()
    }

    pub fn is_enabled(&self) -> bool {
        !self.capabilities.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Names of the active capabilities, primary first
    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .map(|capability| format!("{}:{}", capability.role(), capability.client().name()))
            .collect()
    }

    /// One-shot answer. The primary is tried first and the fallback once;
    /// the configured timeout covers both attempts.
    pub async fn complete(&self, query: &str, context: Option<&str>, model: Option<&str>) -> Result<String> {
        if !self.is_enabled() {
            return Err(unavailable("assistance is disabled"));
        }

        let messages = build_messages(query, context);
        match tokio::time::timeout(self.timeout, self.complete_with_fallback(&messages, model)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "assistance request timed out");
                Err(EngineError::AssistanceTimeout(self.timeout.as_secs()))
            }
        }
    }

    async fn complete_with_fallback(&self, messages: &[ChatMessage], model: Option<&str>) -> Result<String> {
        let mut last_error = None;
        for capability in &self.capabilities {
            let client = capability.client();
            match client.chat_completion(messages, capability.model_override(model)).await {
                Ok(text) => {
                    debug!(capability = capability.role(), chars = text.len(), "assistance completed");
                    return Ok(text);
                }
                Err(e) => {
                    warn!(capability = capability.role(), client = client.name(), error = %e, "assistance request failed");
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(unavailable(last_error.as_deref().unwrap_or("no capability answered")))
    }

    /// Streaming answer as [`AssistEvent`]s.
    ///
    /// If a capability fails before producing any chunk the next one is
    /// tried, streaming when it supports it and as a single chunk otherwise.
    /// A failure after output has started ends the stream with an error.
    pub fn stream(&self, query: &str, context: Option<&str>, model: Option<&str>) -> AssistStream {
        let cancel = CancellationToken::new();
        let capabilities = self.capabilities.clone();
        let messages = build_messages(query, context);
        let model = model.map(str::to_string);
        let timeout = self.timeout;
        let token = cancel.clone();

        let events = async_stream::stream! {
            yield AssistEvent::Start;

            let deadline = Instant::now() + timeout;
            let mut failure = Some(unavailable(if capabilities.is_empty() {
                "assistance is disabled"
            } else {
                "no capability answered"
            }));
            let mut cancelled = false;

            for capability in &capabilities {
                let model = capability.model_override(model.as_deref());

                let opened = tokio::select! {
                    _ = token.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    opened = tokio::time::timeout_at(deadline, open_stream(capability.client(), messages.clone(), model)) => opened,
                };

                let mut chunks = match opened {
                    Ok(Ok(chunks)) => chunks,
                    Ok(Err(e)) => {
                        warn!(capability = capability.role(), error = %e, "assistance stream failed to start");
                        failure = Some(unavailable(&e.to_string()));
                        continue;
                    }
                    Err(_) => {
                        failure = Some(EngineError::AssistanceTimeout(timeout.as_secs()));
                        break;
                    }
                };

                let mut emitted = false;
                loop {
                    let next = tokio::select! {
                        _ = token.cancelled() => {
                            cancelled = true;
                            break;
                        }
                        next = tokio::time::timeout_at(deadline, chunks.next()) => next,
                    };

                    match next {
                        Ok(Some(Ok(chunk))) => {
                            if !chunk.delta.is_empty() {
                                emitted = true;
                                yield AssistEvent::Chunk(chunk.delta);
                            }
                        }
                        Ok(Some(Err(e))) => {
                            warn!(capability = capability.role(), error = %e, emitted, "assistance stream failed");
                            failure = Some(unavailable(&e.to_string()));
                            break;
                        }
                        Ok(None) => {
                            failure = None;
                            break;
                        }
                        Err(_) => {
                            failure = Some(EngineError::AssistanceTimeout(timeout.as_secs()));
                            break;
                        }
                    }
                }
                drop(chunks);

                let timed_out = matches!(failure, Some(EngineError::AssistanceTimeout(_)));
                if cancelled || failure.is_none() || emitted || timed_out {
                    break;
                }
            }

            if cancelled {
                debug!("assistance stream cancelled");
            } else if let Some(error) = failure {
                yield AssistEvent::Error(error);
            }
            yield AssistEvent::End;
        };

        AssistStream {
            events: Box::pin(events),
            cancel,
        }
    }
}

fn unavailable(reason: &str) -> EngineError {
    EngineError::AssistanceUnavailable(reason.to_string())
}

/// Provider stream, or a one-chunk stream built from a plain completion when
/// the provider cannot stream.
async fn open_stream(
    client: &dyn LlmClient,
    messages: Vec<ChatMessage>,
    model: Option<&str>,
) -> anyhow::Result<ChunkStream> {
    if client.supports_streaming() {
        return client.chat_streaming(messages, model).await;
    }

    let text = client.chat_completion(&messages, model).await?;
    let chunk = StreamingChunk {
        content: text.clone(),
        delta: text,
        finish_reason: Some("stop".to_string()),
    };
    Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
}
