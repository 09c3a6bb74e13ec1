use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use shellmux_assist::AssistanceAdapter;
use shellmux_terminal::SessionRegistry;
use shellmux_types::{EngineError, SessionId, SpawnRequest};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::web::gateway::{ConnectionGateway, Inbound, OUTBOUND_CAPACITY};
use crate::web::protocol::CLIENT_MESSAGE_TYPES;

/// Name reported by the capability descriptor
pub const SERVICE_NAME: &str = "shellmux";

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub adapter: Arc<AssistanceAdapter>,
    pub gateway: Arc<ConnectionGateway>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, adapter: Arc<AssistanceAdapter>, settings: Settings) -> Self {
        let gateway = Arc::new(ConnectionGateway::new(registry.clone(), adapter.clone()));
        Self {
            registry,
            adapter,
            gateway,
            settings: Arc::new(settings),
        }
    }
}

/// Create router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/descriptor", get(descriptor))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(close_session))
        .route("/ws/:session_id", get(websocket_handler))
        .with_state(state)
}

/// Body of `POST /api/sessions`; every field falls back to configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateSessionBody {
    pub command: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

impl CreateSessionBody {
    fn into_request(self, settings: &Settings) -> SpawnRequest {
        let mut request = SpawnRequest::new(self.command.unwrap_or_else(|| settings.shell.clone()))
            .with_size(
                self.rows.unwrap_or(shellmux_types::DEFAULT_ROWS),
                self.cols.unwrap_or(shellmux_types::DEFAULT_COLS),
            );
        if let Some(cwd) = self.cwd {
            request = request.with_cwd(cwd);
        }
        let mut env: Vec<_> = self.env.into_iter().collect();
        env.sort();
        for (key, value) in env {
            request = request.with_env(key, value);
        }
        request
    }
}

/// GET /health
async fn health() -> &'static str {
    "ok"
}

/// GET /api/descriptor - Capability descriptor for discovery
async fn descriptor(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut capabilities: Vec<String> = vec!["terminal".to_string(), "resize".to_string()];
    if state.adapter.is_enabled() {
        capabilities.push("assist".to_string());
        capabilities.extend(state.adapter.capability_names().into_iter().map(|name| format!("assist:{name}")));
    }

    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoint": "/ws/{session_id}",
        "messages": CLIENT_MESSAGE_TYPES,
        "capabilities": capabilities,
    }))
}

/// GET /api/sessions - List all sessions, most recently active first
async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.registry.list().await;
    Json(json!({ "sessions": sessions }))
}

/// POST /api/sessions - Spawn a new session
async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionBody>>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let request = body.into_request(&state.settings);
    let session_id = state.registry.create(request).await?;
    let snapshot = state.registry.get(session_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "session_id": session_id,
            "created_at": snapshot.created_at.to_rfc3339(),
            "websocket_url": format!("/ws/{session_id}"),
        })),
    ))
}

/// GET /api/sessions/:id - Session snapshot
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, AppError> {
    let snapshot = state.registry.get(id).await?;
    Ok(Json(json!(snapshot)))
}

/// DELETE /api/sessions/:id - Close a session
async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, AppError> {
    let closed = state.registry.close(id).await?;
    Ok(Json(json!({ "closed": closed })))
}

/// GET /ws/:session_id - WebSocket endpoint
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, session_id))
}

/// Bridge one WebSocket to the gateway: a writer task serializes outbound
/// frames, inbound frames are mapped onto [`Inbound`].
async fn handle_websocket(socket: WebSocket, state: AppState, session_id: SessionId) {
    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to serialize server message");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = sender.send(WsMessage::Close(None)).await;
    });

    let inbound = receiver
        .filter_map(|frame| async move {
            match frame {
                Ok(WsMessage::Text(text)) => Some(Inbound::Text(text)),
                Ok(WsMessage::Binary(bytes)) => Some(Inbound::Binary(bytes)),
                Ok(WsMessage::Close(_)) => Some(Inbound::Close),
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => None,
                Err(e) => {
                    debug!(error = %e, "websocket receive error");
                    Some(Inbound::Close)
                }
            }
        })
        .boxed();

    state.gateway.serve(session_id, inbound, tx).await;

    // Assistance tasks may still hold senders; the writer finishes once they drop.
    if writer.await.is_err() {
        warn!(%session_id, "websocket writer panicked");
    }
}

/// Engine errors rendered as JSON with a status code
#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Engine(err)
    }
}

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::SessionClosed(_) => StatusCode::CONFLICT,
        EngineError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Spawn { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Resize(_) | EngineError::Protocol(_) => StatusCode::BAD_REQUEST,
        EngineError::AssistanceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::AssistanceTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Write(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let AppError::Engine(err) = self;
        let status = status_for(&err);

        let body = Json(json!({
            "error": err.to_string(),
            "code": err.code(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
