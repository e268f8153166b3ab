//! Token-guarded audio playback.
//!
//! Every forced interruption advances a playback token. A playback captures
//! the token when it starts and reports [`PlaybackOutcome::Stale`] if the
//! token moved before it settled, so an interrupted reply can never finish
//! a turn.

use crate::capability::{AudioArtifact, AudioSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, warn};

/// How long to wait for duration metadata before falling back to an estimate.
pub const METADATA_WAIT: Duration = Duration::from_millis(800);
/// Slack added to the known or estimated duration before playback is
/// declared finished anyway.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_millis(1500);

/// How a playback settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Ended,
    Failed,
    TimedOut,
    /// Interrupted; must not be acted upon.
    Stale,
}

impl PlaybackOutcome {
    pub fn is_stale(self) -> bool {
        self == PlaybackOutcome::Stale
    }
}

#[derive(Clone)]
pub struct PlaybackController {
    sink: Arc<dyn AudioSink>,
    token: Arc<watch::Sender<u64>>,
    margin: Duration,
}

impl PlaybackController {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            sink,
            token: Arc::new(watch::Sender::new(0)),
            margin: DEFAULT_SAFETY_MARGIN,
        }
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// The current playback token.
    pub fn token(&self) -> u64 {
        *self.token.borrow()
    }

    /// Interrupts playback: advances the token, then releases the sink.
    pub fn stop_current_audio(&self) {
        self.token.send_modify(|token| *token += 1);
        self.sink.stop();
        debug!(token = self.token(), "Playback interrupted");
    }

    /// Plays one artifact to completion, failure, timeout or interruption.
    pub async fn play(&self, artifact: &AudioArtifact) -> PlaybackOutcome {
        let mut interrupted = self.token.subscribe();
        let captured = *interrupted.borrow_and_update();
        let started = Instant::now();

        let playing = self.sink.play(artifact);
        tokio::pin!(playing);

        // Playback runs while metadata is awaited.
        let metadata = tokio::time::timeout(METADATA_WAIT, self.sink.duration(artifact));
        let known = tokio::select! {
            biased;
            _ = interrupted.changed() => return PlaybackOutcome::Stale,
            result = &mut playing => return self.settle(captured, result.is_ok(), started),
            known = metadata => known.ok().flatten(),
        };

        let limit = known.unwrap_or_else(|| artifact.estimated_duration()) + self.margin;
        debug!(?known, ?limit, "Playback timeout armed");

        tokio::select! {
            biased;
            _ = interrupted.changed() => PlaybackOutcome::Stale,
            result = &mut playing => self.settle(captured, result.is_ok(), started),
            _ = tokio::time::sleep(limit) => {
                if self.token() != captured {
                    return PlaybackOutcome::Stale;
                }
                warn!(elapsed = ?started.elapsed(), "Playback exceeded its expected duration");
                PlaybackOutcome::TimedOut
            }
        }
    }

    fn settle(&self, captured: u64, ok: bool, started: Instant) -> PlaybackOutcome {
        if self.token() != captured {
            return PlaybackOutcome::Stale;
        }
        if ok {
            info!(elapsed = ?started.elapsed(), "Audio ended");
            PlaybackOutcome::Ended
        } else {
            warn!("Audio playback failed");
            PlaybackOutcome::Failed
        }
    }
}

/// An artifact waiting in the playback queue.
#[derive(Debug, Clone)]
pub struct QueuedAudio {
    pub turn: u64,
    pub artifact: AudioArtifact,
    /// Playback token when the artifact was queued.
    pub token: u64,
}

/// Reported once per queued artifact, in queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSettled {
    pub turn: u64,
    pub outcome: PlaybackOutcome,
}

/// Plays queued artifacts one after another.
///
/// An artifact queued before an interruption settles as stale without being
/// played.
pub fn spawn_queue(
    controller: PlaybackController,
    mut queue: mpsc::UnboundedReceiver<QueuedAudio>,
    settled: mpsc::UnboundedSender<PlaybackSettled>,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            while let Some(item) = queue.recv().await {
                let outcome = if item.token != controller.token() {
                    debug!(turn = item.turn, "Skipping audio queued before an interruption");
                    PlaybackOutcome::Stale
                } else {
                    controller.play(&item.artifact).await
                };
                if settled
                    .send(PlaybackSettled {
                        turn: item.turn,
                        outcome,
                    })
                    .is_err()
                {
                    break;
                }
            }
            debug!("Playback queue closed");
        }
        .in_current_span(),
    )
}
