//! Manages the WebSocket connection lifecycle for one relay client.

use super::turn::run_turn;
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;
use voxrelay_core::protocol::{ClientCommand, ProtocolError, ServerEvent};
use voxrelay_core::turn_client::TurnRequest;

const LOG_PREVIEW_BYTES: usize = 300;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Registers the connection, spawns a writer task that owns the socket
/// sink, then reads client commands until the socket closes. Closing the
/// socket cancels any in-flight turn.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    tracing::Span::current().record("session_id", &session_id.to_string());
    // Subscribe before registering so no edge is missed once the session is visible.
    let mut buttons = state.buttons.subscribe();
    let mut buttons_open = true;
    state.registry.register(session_id);
    info!(sessions = state.registry.len(), "Client connected");

    let (mut socket_tx, mut socket_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let writer = tokio::spawn(
        async move {
            while let Some(event) = outbound_rx.recv().await {
                if let Err(e) = send_msg(&mut socket_tx, event).await {
                    warn!(error = %e, "WebSocket send failed; stopping writer");
                    break;
                }
            }
            let _ = socket_tx.close().await;
        }
        .instrument(tracing::Span::current()),
    );

    loop {
        tokio::select! {
            msg = socket_rx.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        handle_command(&state, session_id, text.as_str(), &outbound_tx);
                    }
                    Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_command(&state, session_id, text, &outbound_tx),
                        Err(_) => {
                            warn!("Binary frame was not UTF-8");
                            let _ = outbound_tx.send(ServerEvent::error(ProtocolError::InvalidJson.to_string()));
                        }
                    },
                    Ok(Message::Close(_)) => {
                        info!("Client sent close frame");
                        break;
                    }
                    Ok(Message::Ping(_) | Message::Pong(_)) => {}
                    Err(e) => {
                        error!("Error receiving from client WebSocket: {:?}", e);
                        break;
                    }
                }
            }
            edge = buttons.recv(), if buttons_open => match edge {
                Ok(edge) => {
                    debug!(?edge, "Forwarding button edge");
                    let _ = outbound_tx.send(edge.into());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Button edges dropped for slow client");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Button channel closed");
                    buttons_open = false;
                }
            },
        }
    }

    state.registry.remove(session_id);
    writer.abort();
    info!(sessions = state.registry.len(), "Client disconnected");
}

/// Parses and executes one client command.
fn handle_command(
    state: &Arc<AppState>,
    session_id: Uuid,
    raw: &str,
    outbound: &mpsc::UnboundedSender<ServerEvent>,
) {
    let command = match ClientCommand::parse(raw) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "Rejected client message");
            let _ = outbound.send(ServerEvent::error(e.to_string()));
            return;
        }
    };

    let (user_id, request) = match command {
        ClientCommand::Cancel => {
            let cancelled = state.registry.cancel_turn(session_id);
            info!(cancelled, "Client cancelled turn");
            return;
        }
        ClientCommand::Launch { user_id } => (
            user_id.unwrap_or_else(|| state.config.default_user_id.clone()),
            TurnRequest::launch(),
        ),
        ClientCommand::CommandStream { user_id, text } => {
            info!(%user_id, %text, "Command received");
            (user_id, TurnRequest::text(text))
        }
    };

    let Some(ticket) = state.registry.begin_turn(session_id) else {
        warn!("Turn requested for an unregistered session");
        return;
    };
    let turn_span = tracing::info_span!("turn", generation = ticket.generation, %user_id);
    tokio::spawn(
        run_turn(
            state.turns.clone(),
            state.registry.clone(),
            ticket,
            user_id,
            request,
            outbound.clone(),
        )
        .instrument(turn_span),
    );
}

fn preview(text: &str) -> &str {
    if text.len() <= LOG_PREVIEW_BYTES {
        return text;
    }
    let mut end = LOG_PREVIEW_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// A helper function to serialize and send a `ServerEvent` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    event: ServerEvent,
) -> Result<()> {
    let serialized = serde_json::to_string(&event.to_envelope())?;
    debug!(preview = preview(&serialized), "Sending to client");
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
