//! WebSocket link from the client to the relay.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{Instrument, debug, info, warn};
use voxrelay_core::protocol::{ClientCommand, Envelope, ServerEvent};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("could not connect to relay: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("relay connection is closed")]
    Closed,
}

/// What the relay link delivers to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayInbound {
    Event(ServerEvent),
    /// The connection dropped. Nothing follows.
    Disconnected,
}

/// Queues commands for the relay.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<ClientCommand>,
}

impl RelaySender {
    /// Fails once the connection's writer has gone away.
    pub fn send(&self, command: ClientCommand) -> Result<(), TransportError> {
        self.tx.send(command).map_err(|_| TransportError::Closed)
    }
}

/// A sender whose commands land in the returned receiver.
pub fn relay_channel() -> (RelaySender, mpsc::UnboundedReceiver<ClientCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RelaySender { tx }, rx)
}

/// Connects to the relay and spawns the reader and writer tasks.
pub async fn connect(
    url: &str,
) -> Result<(RelaySender, mpsc::UnboundedReceiver<RelayInbound>), TransportError> {
    let (socket, _) = connect_async(url).await?;
    info!(%url, "Connected to relay");
    let (mut socket_tx, mut socket_rx) = socket.split();
    let (sender, mut commands) = relay_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(
        async move {
            while let Some(command) = commands.recv().await {
                let serialized = match serde_json::to_string(&command.to_envelope()) {
                    Ok(serialized) => serialized,
                    Err(e) => {
                        warn!(error = %e, "Could not serialize command");
                        continue;
                    }
                };
                debug!(%serialized, "Sending to relay");
                if let Err(e) = socket_tx.send(Message::Text(serialized)).await {
                    warn!(error = %e, "Relay send failed");
                    break;
                }
            }
            let _ = socket_tx.close().await;
        }
        .in_current_span(),
    );

    tokio::spawn(
        async move {
            while let Some(message) = socket_rx.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "Relay connection error");
                        break;
                    }
                };
                match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => {
                        let event = ServerEvent::from_envelope(envelope);
                        if inbound_tx.send(RelayInbound::Event(event)).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed relay message"),
                }
            }
            info!("Relay connection closed");
            let _ = inbound_tx.send(RelayInbound::Disconnected);
        }
        .in_current_span(),
    );

    Ok((sender, inbound_rx))
}
