#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use shellmux::config::Settings;
use shellmux::web::{AppState, ServerMessage, WebServer};
use shellmux_assist::AssistanceAdapter;
use shellmux_llm_api::{ChatMessage, ChunkStream, LlmClient, StreamingChunk};
use shellmux_terminal::{RegistryConfig, SessionRegistry};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub const WAIT: Duration = Duration::from_secs(5);

/// Counts drops; observes that a provider stream was released
struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Canned assistant: streams its chunks, optionally never finishing
pub struct CannedClient {
    chunks: Vec<String>,
    hang: bool,
    pub calls: AtomicUsize,
    pub released: Arc<AtomicUsize>,
}

impl CannedClient {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
            hang: false,
            calls: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Emit the chunks, then stall forever
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for CannedClient {
    fn name(&self) -> &str {
        "canned"
    }

    fn default_model(&self) -> &str {
        "canned-1"
    }

    async fn chat_completion(&self, _messages: &[ChatMessage], _model: Option<&str>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.chunks.concat())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat_streaming(&self, _messages: Vec<ChatMessage>, _model: Option<&str>) -> Result<ChunkStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let guard = ReleaseGuard(self.released.clone());
        let chunks = futures::stream::iter(self.chunks.clone()).map(|delta| {
            Ok::<_, anyhow::Error>(StreamingChunk {
                content: delta.clone(),
                delta,
                finish_reason: None,
            })
        });

        let stream = if self.hang {
            chunks.chain(futures::stream::pending()).boxed()
        } else {
            chunks.boxed()
        };
        Ok(Box::pin(stream.map(move |chunk| {
            let _held = &guard;
            chunk
        })))
    }
}

pub fn test_config() -> RegistryConfig {
    RegistryConfig {
        max_sessions: 4,
        idle_timeout: Duration::from_secs(60),
        cleanup_interval: Duration::from_secs(60),
        queue_capacity: 64,
        ..RegistryConfig::default()
    }
}

pub fn test_settings() -> Settings {
    Settings {
        port: 0,
        shell: "/bin/sh".to_string(),
        assist_model: None,
        max_sessions: 4,
        ..Settings::default()
    }
}

/// Adapter backed by `client`, or a disabled one
pub async fn test_adapter(client: Option<Arc<CannedClient>>) -> Arc<AssistanceAdapter> {
    let mut adapter = AssistanceAdapter::new(Duration::from_secs(5));
    if let Some(client) = client {
        let client: Arc<dyn LlmClient> = client;
        assert!(adapter.initialize(Some(client), None).await);
    }
    Arc::new(adapter)
}

/// Running server on an ephemeral port; stops when dropped
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start(settings: Settings, adapter: Arc<AssistanceAdapter>) -> Self {
        let registry = Arc::new(SessionRegistry::new(settings.registry_config()));
        let state = AppState::new(registry.clone(), adapter, settings.clone());
        let server = WebServer::bind(settings.socket_addr(), state).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (tx, rx) = oneshot::channel();
        tokio::spawn(server.run(async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            registry,
            shutdown: Some(tx),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Next server frame, failing the test after `WAIT`
pub async fn next_frame(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("outbound channel closed")
}

/// Skip output frames until a non-output frame arrives
pub async fn next_control_frame(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    loop {
        match next_frame(rx).await {
            ServerMessage::Output { .. } => continue,
            other => return other,
        }
    }
}

/// Decode output frames until the accumulated text contains `needle`
pub async fn read_output_until(rx: &mut mpsc::Receiver<ServerMessage>, needle: &str) -> String {
    let deadline = Instant::now() + WAIT;
    let mut collected = String::new();
    while !collected.contains(needle) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(ServerMessage::Output { data })) => {
                collected.push_str(&String::from_utf8_lossy(&decode_output(&data)));
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    collected.replace("\r\n", "\n")
}

pub fn decode_output(data: &str) -> Vec<u8> {
    BASE64.decode(data).expect("output frames are base64")
}
