use std::sync::Arc;

use futures::{Stream, StreamExt};
use shellmux_assist::{AssistEvent, AssistanceAdapter};
use shellmux_terminal::{OutputSubscription, SessionRegistry};
use shellmux_types::{ConnectionId, EngineError, SessionId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{decode_client_message, ClientMessage, ServerMessage};

/// Outbound frames buffered per connection before the output pump waits
pub const OUTBOUND_CAPACITY: usize = 64;

/// Transport-neutral inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Connection lifecycle: `Connecting -> Open -> {Closing, Errored} -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Errored,
    Closed,
}

impl ConnectionState {
    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Errored)
                | (Open, Closing)
                | (Open, Errored)
                | (Closing, Closed)
                | (Errored, Closed)
        )
    }
}

/// Per-connection bookkeeping
struct Connection {
    id: ConnectionId,
    session_id: SessionId,
    state: ConnectionState,
    outbound: mpsc::Sender<ServerMessage>,
    assist: Option<CancellationToken>,
}

impl Connection {
    fn transition(&mut self, next: ConnectionState) {
        if self.state == next || !self.state.can_become(next) {
            return;
        }
        debug!(connection_id = %self.id, session_id = %self.session_id, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }

    /// Send a frame; false once the transport is gone
    async fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).await.is_ok()
    }

    async fn send_error(&self, err: &EngineError) -> bool {
        self.send(ServerMessage::from(err)).await
    }

    fn cancel_assist(&mut self) {
        if let Some(token) = self.assist.take() {
            token.cancel();
        }
    }
}

/// Binds client connections to sessions: decodes inbound frames into
/// registry and assistant calls, and forwards session output.
pub struct ConnectionGateway {
    registry: Arc<SessionRegistry>,
    adapter: Arc<AssistanceAdapter>,
}

impl ConnectionGateway {
    pub fn new(registry: Arc<SessionRegistry>, adapter: Arc<AssistanceAdapter>) -> Self {
        Self { registry, adapter }
    }

    /// Drive one connection to completion. Returns once the client went
    /// away, the session ended, or a fatal protocol error occurred; the
    /// session itself is never torn down here.
    pub async fn serve<S>(&self, session_id: SessionId, mut inbound: S, outbound: mpsc::Sender<ServerMessage>)
    where
        S: Stream<Item = Inbound> + Unpin,
    {
        let mut conn = Connection {
            id: Uuid::new_v4(),
            session_id,
            state: ConnectionState::Connecting,
            outbound,
            assist: None,
        };

        let subscription = match self.registry.attach(session_id, conn.id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                info!(%session_id, error = %e, "rejecting connection");
                conn.send_error(&e).await;
                conn.transition(ConnectionState::Errored);
                conn.transition(ConnectionState::Closed);
                return;
            }
        };
        conn.transition(ConnectionState::Open);
        info!(connection_id = %conn.id, %session_id, "connection open");

        let detached = CancellationToken::new();
        let session_ended = CancellationToken::new();
        let pump = tokio::spawn(pump_output(
            subscription,
            conn.outbound.clone(),
            session_id,
            detached.clone(),
            session_ended.clone(),
        ));

        loop {
            let frame = tokio::select! {
                _ = session_ended.cancelled() => {
                    conn.transition(ConnectionState::Closing);
                    break;
                }
                frame = inbound.next() => frame,
            };

            match frame {
                Some(Inbound::Text(text)) => match decode_client_message(&text) {
                    Ok(message) => self.dispatch(&mut conn, message).await,
                    Err(e) if e.is_fatal() => {
                        warn!(connection_id = %conn.id, error = ?e, "malformed frame; closing connection");
                        conn.send_error(&e.to_engine_error()).await;
                        conn.transition(ConnectionState::Errored);
                        break;
                    }
                    Err(e) => {
                        debug!(connection_id = %conn.id, error = ?e, "rejected frame");
                        conn.send_error(&e.to_engine_error()).await;
                    }
                },
                Some(Inbound::Binary(bytes)) => self.write_input(&conn, &bytes).await,
                Some(Inbound::Close) | None => {
                    conn.transition(ConnectionState::Closing);
                    break;
                }
            }

            if conn.outbound.is_closed() {
                conn.transition(ConnectionState::Closing);
                break;
            }
        }

        conn.cancel_assist();
        detached.cancel();
        self.registry.detach(session_id, conn.id).await;
        if pump.await.is_err() {
            warn!(connection_id = %conn.id, "output pump panicked");
        }

        conn.transition(ConnectionState::Closed);
        info!(connection_id = %conn.id, %session_id, "connection closed");
    }

    async fn dispatch(&self, conn: &mut Connection, message: ClientMessage) {
        match message {
            ClientMessage::Input { data } => self.write_input(conn, data.as_bytes()).await,
            ClientMessage::Resize { rows, cols } => {
                match self.registry.resize(conn.session_id, rows, cols).await {
                    Ok(true) => {}
                    Ok(false) => {
                        conn.send_error(&EngineError::SessionClosed(conn.session_id)).await;
                    }
                    Err(e) => {
                        conn.send_error(&e).await;
                    }
                }
            }
            ClientMessage::Assist {
                query,
                context,
                model,
                stream,
            } => self.start_assist(conn, query, context, model, stream).await,
            ClientMessage::Ping { nonce } => {
                conn.send(ServerMessage::Pong { nonce }).await;
            }
        }
    }

    async fn write_input(&self, conn: &Connection, data: &[u8]) {
        match self.registry.write_input(conn.session_id, data).await {
            Ok(true) => {}
            Ok(false) => {
                conn.send_error(&EngineError::SessionClosed(conn.session_id)).await;
            }
            Err(e) => {
                conn.send_error(&e).await;
            }
        }
    }

    /// Run an assistance request in the background. A newer request on the
    /// same connection cancels this one.
    async fn start_assist(
        &self,
        conn: &mut Connection,
        query: String,
        context: Option<String>,
        model: Option<String>,
        stream: bool,
    ) {
        conn.cancel_assist();

        let context = match context {
            Some(context) => Some(context),
            None => self.registry.screen_text(conn.session_id).await.ok(),
        };

        let token = CancellationToken::new();
        conn.assist = Some(token.clone());

        let adapter = self.adapter.clone();
        let outbound = conn.outbound.clone();
        let connection_id = conn.id;
        debug!(%connection_id, stream, "assistance requested");

        if stream {
            let mut events = adapter.stream(&query, context.as_deref(), model.as_deref());
            tokio::spawn(async move {
                let mut cancelled = false;
                loop {
                    let event = tokio::select! {
                        _ = token.cancelled(), if !cancelled => {
                            cancelled = true;
                            events.cancel();
                            continue;
                        }
                        event = events.next() => event,
                    };
                    let Some(event) = event else {
                        break;
                    };
                    let message = match event {
                        AssistEvent::Start => ServerMessage::AssistStart,
                        AssistEvent::Chunk(text) => ServerMessage::AssistChunk { text },
                        AssistEvent::Error(e) => ServerMessage::from(&e),
                        AssistEvent::End => ServerMessage::AssistEnd,
                    };
                    if outbound.send(message).await.is_err() {
                        break;
                    }
                }
                debug!(%connection_id, cancelled, "assistance stream finished");
            });
        } else {
            tokio::spawn(async move {
                if outbound.send(ServerMessage::AssistStart).await.is_err() {
                    return;
                }
                let result = tokio::select! {
                    _ = token.cancelled() => None,
                    result = adapter.complete(&query, context.as_deref(), model.as_deref()) => Some(result),
                };
                match result {
                    Some(Ok(text)) => {
                        let _ = outbound.send(ServerMessage::AssistChunk { text }).await;
                    }
                    Some(Err(e)) => {
                        let _ = outbound.send(ServerMessage::from(&e)).await;
                    }
                    None => debug!(%connection_id, "assistance request cancelled"),
                }
                let _ = outbound.send(ServerMessage::AssistEnd).await;
            });
        }
    }
}

/// Forward session output to the connection. Ends when the subscription
/// ends; if that happened because the session closed (rather than this
/// connection detaching) the client is told and `session_ended` fires.
async fn pump_output(
    subscription: OutputSubscription,
    outbound: mpsc::Sender<ServerMessage>,
    session_id: SessionId,
    detached: CancellationToken,
    session_ended: CancellationToken,
) {
    while let Some(delivery) = subscription.recv().await {
        if delivery.dropped > 0 {
            debug!(connection_id = %subscription.connection_id(), dropped = delivery.dropped, "output truncated");
            if outbound.send(ServerMessage::truncated(delivery.dropped)).await.is_err() {
                return;
            }
        }
        if outbound.send(ServerMessage::output(&delivery.data)).await.is_err() {
            return;
        }
    }

    if !detached.is_cancelled() {
        let _ = outbound
            .send(ServerMessage::from(&EngineError::SessionClosed(session_id)))
            .await;
        session_ended.cancel();
    }
}
