use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use shellmux_llm_api::{ChatMessage, ChunkStream, LlmClient, StreamingChunk};

/// What a scripted client does when called
#[derive(Clone)]
pub enum Script {
    /// Answer with these chunks
    Reply(Vec<&'static str>),
    /// Fail before producing anything
    Fail(&'static str),
    /// Produce these chunks, then fail
    FailAfter(Vec<&'static str>, &'static str),
    /// Produce these chunks, then never finish
    Hang(Vec<&'static str>),
}

/// Sets its flag when dropped; used to observe that a provider stream was released
pub struct DropFlag(pub Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// In-memory capability with a fixed script
pub struct ScriptedClient {
    name: &'static str,
    script: Script,
    streaming: bool,
    healthy: bool,
    pub calls: AtomicUsize,
    pub models: Mutex<Vec<Option<String>>>,
    pub last_messages: Mutex<Vec<ChatMessage>>,
    pub stream_dropped: Arc<AtomicBool>,
}

impl ScriptedClient {
    pub fn new(name: &'static str, script: Script) -> Self {
        Self {
            name,
            script,
            streaming: true,
            healthy: true,
            calls: AtomicUsize::new(0),
            models: Mutex::new(Vec::new()),
            last_messages: Mutex::new(Vec::new()),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn non_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self, messages: &[ChatMessage], model: Option<&str>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().unwrap().push(model.map(str::to_string));
        *self.last_messages.lock().unwrap() = messages.to_vec();
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        self.name
    }

    fn default_model(&self) -> &str {
        "scripted"
    }

    async fn chat_completion(&self, messages: &[ChatMessage], model: Option<&str>) -> Result<String> {
        self.record(messages, model);
        match &self.script {
            Script::Reply(chunks) => Ok(chunks.concat()),
            Script::Fail(reason) | Script::FailAfter(_, reason) => Err(anyhow::anyhow!(*reason)),
            Script::Hang(_) => futures::future::pending().await,
        }
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn chat_streaming(&self, messages: Vec<ChatMessage>, model: Option<&str>) -> Result<ChunkStream> {
        self.record(&messages, model);

        let script = self.script.clone();
        let flag = DropFlag(self.stream_dropped.clone());
        if let Script::Fail(reason) = &script {
            return Err(anyhow::anyhow!(*reason));
        }

        let stream = async_stream::stream! {
            let _flag = flag;
            let (chunks, ending) = match script {
                Script::Reply(chunks) => (chunks, None),
                Script::FailAfter(chunks, reason) => (chunks, Some(Some(reason))),
                Script::Hang(chunks) => (chunks, Some(None)),
                Script::Fail(_) => (Vec::new(), None),
            };

            let mut content = String::new();
            for delta in chunks {
                content.push_str(delta);
                yield Ok(StreamingChunk {
                    content: content.clone(),
                    delta: delta.to_string(),
                    finish_reason: None,
                });
            }

            match ending {
                Some(Some(reason)) => yield Err(anyhow::anyhow!(reason)),
                Some(None) => futures::future::pending::<()>().await,
                None => {}
            }
        };
        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<()> {
        if self.healthy {
            Ok(())
        } else {
            Err(anyhow::anyhow!("{} is down", self.name))
        }
    }
}
