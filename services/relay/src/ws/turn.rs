//! Forwards one upstream turn to a connected client.

use super::registry::{SessionRegistry, TurnTicket};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use voxrelay_core::assembler::AudioChunkAssembler;
use voxrelay_core::protocol::ServerEvent;
use voxrelay_core::turn_client::{NormalizedEvent, TurnError, TurnRequest, TurnStream};

/// Maps one normalized upstream event onto the client protocol.
///
/// Traces pass through the session's assembler, `end` becomes
/// `responseDone`, and anything else is forwarded under its own name.
fn route(
    event: NormalizedEvent,
    assembler: &mut AudioChunkAssembler,
) -> Option<ServerEvent> {
    let NormalizedEvent { kind, id, data } = event;
    match kind.as_str() {
        "trace" => assembler
            .accept(data)
            .map(|data| ServerEvent::Trace { id, data }),
        "end" => Some(ServerEvent::ResponseDone),
        _ => Some(ServerEvent::Upstream {
            event: kind,
            id,
            data,
        }),
    }
}

/// Runs a turn to completion, pushing client events into `outbound`.
///
/// A cancelled turn ends quietly. Any other failure is reported to the
/// client exactly once, and only while the turn is still current.
pub async fn run_turn(
    turns: Arc<dyn TurnStream>,
    registry: SessionRegistry,
    ticket: TurnTicket,
    user_id: String,
    request: TurnRequest,
    outbound: mpsc::UnboundedSender<ServerEvent>,
) {
    let report = |err: TurnError| {
        if err.is_cancelled() || ticket.cancel.is_cancelled() {
            debug!("Turn cancelled");
            return;
        }
        error!(error = %err, "Turn failed");
        registry.with_current(&ticket, |_| {
            let _ = outbound.send(ServerEvent::error(err.to_string()));
        });
    };

    let mut stream = match turns
        .open_turn(&user_id, request, ticket.cancel.clone())
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            report(err);
            registry.finish_turn(&ticket);
            return;
        }
    };

    let mut forwarded = 0usize;
    let mut saw_end = false;
    let mut drained = true;
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                let kind = event.kind.clone();
                let delivered = registry.with_current(&ticket, |assembler| {
                    route(event, assembler).map(|out| outbound.send(out).is_ok())
                });
                match delivered {
                    None => {
                        debug!(%kind, "Turn superseded; dropping remaining events");
                        drained = false;
                        break;
                    }
                    Some(Some(false)) => {
                        debug!("Client writer gone; abandoning turn");
                        drained = false;
                        break;
                    }
                    Some(Some(true)) => {
                        forwarded += 1;
                        saw_end |= kind == "end";
                    }
                    Some(None) => {}
                }
            }
            Err(err) => {
                report(err);
                drained = false;
                break;
            }
        }
    }

    // The client leaves its response state only on `responseDone`.
    if drained && !saw_end && !ticket.cancel.is_cancelled() {
        registry.with_current(&ticket, |_| {
            debug!(forwarded, "Upstream closed without an end event");
            let _ = outbound.send(ServerEvent::ResponseDone);
        });
    }

    registry.finish_turn(&ticket);
    info!(forwarded, "Turn finished");
}
