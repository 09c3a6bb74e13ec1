use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::client::{ChatMessage, ChunkStream, LlmClient, StreamingChunk};
use crate::request_logger::RequestLogger;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chat-completions client for any OpenAI-compatible endpoint (OpenAI, Groq,
/// llama.cpp server).
pub struct OpenAiCompatClient {
    name: String,
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
    logger: Option<RequestLogger>,
}

impl OpenAiCompatClient {
    /// `api_url` is the full chat-completions URL. An empty key sends no
    /// Authorization header.
    pub fn new(name: impl Into<String>, api_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: name.into(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: RequestLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn models_url(&self) -> String {
        match self.api_url.find("/chat/completions") {
            Some(pos) => format!("{}/models", &self.api_url[..pos]),
            None => format!("{}/models", self.api_url.trim_end_matches('/')),
        }
    }

    fn build_request(&self, messages: &[ChatMessage], model: Option<&str>, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": model.unwrap_or(&self.model),
            "messages": messages,
            "temperature": 0.2,
            "stream": stream,
        })
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.api_url)
            .header("Content-Type", "application/json")
            .json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("{}: request to {} failed", self.name, self.api_url))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "{}: API request failed: {} - {}",
                self.name,
                status,
                crate::safe_truncate(&error_text, 500)
            ));
        }
        Ok(response)
    }

    fn log_request(&self, body: &serde_json::Value) {
        if let Some(logger) = &self.logger {
            if let Err(e) = logger.log_request(&self.name, &self.api_url, body) {
                warn!(client = %self.name, error = %e, "failed to write request log");
            }
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn chat_completion(&self, messages: &[ChatMessage], model: Option<&str>) -> Result<String> {
        let body = self.build_request(messages, model, false);
        self.log_request(&body);

        let response = self.post(&body).await?;
        let response_text = response.text().await?;
        if let Some(logger) = &self.logger {
            let _ = logger.log_response(&self.name, &response_text);
        }

        let chat_response: serde_json::Value =
            serde_json::from_str(&response_text).context("response is not valid JSON")?;

        chat_response["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("{}: no content in response", self.name))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat_streaming(&self, messages: Vec<ChatMessage>, model: Option<&str>) -> Result<ChunkStream> {
        let body = self.build_request(&messages, model, true);
        self.log_request(&body);

        let response = self.post(&body).await?;
        Ok(Box::pin(sse_chunks(response, self.name.clone(), self.logger.clone())))
    }

    async fn health_check(&self) -> Result<()> {
        let mut request = self.client.get(self.models_url());
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("{}: {} is unreachable", self.name, self.api_url))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("{}: health probe returned {}", self.name, status))
        }
    }
}

/// Turn an SSE chat-completions response into content chunks. Ends at
/// `[DONE]` or when the body ends; a malformed event ends it with an error.
fn sse_chunks(
    response: reqwest::Response,
    name: String,
    logger: Option<RequestLogger>,
) -> impl Stream<Item = Result<StreamingChunk>> + Send {
    async_stream::try_stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut finished = false;

        while !finished {
            match bytes.next().await {
                Some(next) => {
                    let next = next.context("stream interrupted")?;
                    buffer.extend_from_slice(&next);
                }
                None => {
                    // A last event without a trailing newline still counts.
                    buffer.push(b'\n');
                    finished = true;
                }
            }

            // SSE events arrive as "data: {json}" lines
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_sse_line(&String::from_utf8_lossy(&raw))? {
                    SseLine::Skip => {}
                    SseLine::Done => {
                        finished = true;
                        break;
                    }
                    SseLine::Delta { delta, finish_reason } => {
                        if delta.is_empty() && finish_reason.is_none() {
                            continue;
                        }
                        content.push_str(&delta);
                        yield StreamingChunk {
                            content: content.clone(),
                            delta,
                            finish_reason,
                        };
                    }
                }
            }
        }

        debug!(client = %name, chars = content.len(), "stream finished");
        if let Some(logger) = &logger {
            let _ = logger.log_response(&name, &content);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Skip,
    Done,
    Delta {
        delta: String,
        finish_reason: Option<String>,
    },
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk: serde_json::Value =
        serde_json::from_str(data).with_context(|| format!("malformed stream event: {data}"))?;
    if let Some(message) = chunk["error"]["message"].as_str() {
        return Err(anyhow::anyhow!("provider error: {message}"));
    }

    let choice = &chunk["choices"][0];
    Ok(SseLine::Delta {
        delta: choice["delta"]["content"].as_str().unwrap_or_default().to_string(),
        finish_reason: choice["finish_reason"].as_str().map(str::to_string),
    })
}
