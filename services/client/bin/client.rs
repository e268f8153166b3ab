//! Main Entrypoint for the Voxrelay Client
//!
//! This binary is responsible for:
//! 1. Parsing configuration from the command line and environment.
//! 2. Building the console capture, audio player and keep-alive stand-ins.
//! 3. Reading console commands from stdin.
//! 4. Connecting to the relay and running one interaction session per
//!    connection, reconnecting when the link drops.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use voxrelay_client::{
    config::ClientConfig,
    console::{ConsoleCapture, ConsoleLine, LoggingKeepAlive, SpoolPlayer},
    playback::PlaybackController,
    recognition::RecognitionController,
    session::{self, InteractionSession, LocalInput, SessionEnd},
    transport,
};
use voxrelay_core::fsm::Dispatcher;

type Controls = watch::Sender<Option<mpsc::UnboundedSender<LocalInput>>>;

/// Cancels `shutdown` on `Ctrl+C`.
async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
    shutdown.cancel();
}

/// Routes console lines to the capture stand-in or the live session.
fn spawn_console(capture: Arc<ConsoleCapture>, controls: Arc<Controls>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Console read failed");
                    break;
                }
            };
            match ConsoleLine::parse(&line) {
                Some(ConsoleLine::Say(text)) => capture.feed(text),
                Some(ConsoleLine::Input(input)) => {
                    let sent = controls
                        .borrow()
                        .as_ref()
                        .is_some_and(|tx| tx.send(input).is_ok());
                    if !sent {
                        warn!("Not connected to the relay");
                    }
                }
                Some(ConsoleLine::Quit) => {
                    shutdown.cancel();
                    break;
                }
                None if line.trim().is_empty() => {}
                None => warn!(%line, "Commands: start, exit, press, release, say <text>, quit"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    dotenvy::dotenv().ok();
    let config = ClientConfig::parse();

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(relay = %config.relay_url, wake_word = config.wake_word, "Configuration loaded");

    // --- 2. Capability Stand-ins ---
    let capture = Arc::new(ConsoleCapture::new());
    let spool_dir = config.spool_dir();
    let sink = Arc::new(
        SpoolPlayer::new(&spool_dir, config.player.as_deref())
            .with_context(|| format!("Failed to prepare spool directory {}", spool_dir.display()))?,
    );
    let keepalive = Arc::new(LoggingKeepAlive::default());

    // --- 3. Console ---
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));
    let controls: Arc<Controls> = Arc::new(watch::Sender::new(None));
    spawn_console(capture.clone(), controls.clone(), shutdown.clone());

    // --- 4. Session Loop ---
    while !shutdown.is_cancelled() {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            connected = transport::connect(&config.relay_url) => connected,
        };
        let (relay, inbound) = match connected {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, delay = ?config.reconnect_delay(), "Relay unavailable, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.reconnect_delay()) => continue,
                }
            }
        };

        let dispatcher = Dispatcher::new();
        dispatcher.subscribe(|t| {
            info!(state = %t.next, previous = %t.previous, event = ?t.event, "Status");
        });
        let playback = PlaybackController::new(sink.clone()).with_margin(config.playback_margin());
        let session = InteractionSession::new(
            config.session_settings(),
            dispatcher,
            RecognitionController::new(capture.clone()),
            playback,
            keepalive.clone(),
            relay,
        );
        let session_controls = session.controls();
        session_controls
            .send(LocalInput::Start)
            .context("Session input closed before start")?;
        controls.send_replace(Some(session_controls));

        let end = session::spawn(session, inbound, shutdown.child_token())
            .await
            .context("Session task failed")?;
        controls.send_replace(None);

        if end == SessionEnd::Disconnected {
            info!(delay = ?config.reconnect_delay(), "Reconnecting to relay");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.reconnect_delay()) => {}
            }
        }
    }

    info!("Client has shut down.");
    Ok(())
}
