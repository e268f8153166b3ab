//! Seams to the device capabilities the client coordinates.
//!
//! Speech capture, audio output and microphone keep-alive live outside this
//! crate. The controllers only ever talk to them through these traits.

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use voxrelay_core::assembler::DEFAULT_AUDIO_ENCODING;

/// How a capture should listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// Stop after one utterance and return up to `max_alternatives`
    /// hypotheses, best first.
    Utterance { max_alternatives: usize },
    /// Keep listening until the finish signal fires, then return the
    /// accumulated transcript.
    Buffered,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("no speech detected")]
    NoSpeech,
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("capture aborted")]
    Aborted,
    #[error("capture failed: {0}")]
    Failed(String),
}

/// A speech recognizer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechCapture: Send + Sync {
    /// Listens in `mode`. `finish` asks a buffered capture to stop and
    /// report what it heard; an utterance capture may end early on it.
    async fn listen(
        &self,
        mode: ListenMode,
        finish: CancellationToken,
    ) -> Result<Vec<String>, CaptureError>;
}

/// Keeps the microphone warm between captures.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MicKeepAlive: Send + Sync {
    async fn start(&self) -> Result<(), CaptureError>;
    async fn stop(&self);
}

/// One playable reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioArtifact {
    /// Audio hosted elsewhere.
    Url(String),
    /// Reassembled audio carried in the trace itself.
    Inline { encoding: String, bytes: Vec<u8> },
}

/// Fallback playback length for hosted audio of unknown duration.
pub const URL_DURATION_GUESS: Duration = Duration::from_secs(8);
/// Rough inline audio bitrate used when no duration is known.
const ESTIMATED_BYTES_PER_SECOND: f64 = 1000.0;

impl AudioArtifact {
    /// Extracts the playable audio from a trace, if it carries any.
    ///
    /// A hosted `payload.audio.src` wins over inline `payload.content`.
    pub fn from_trace(trace: &Value) -> Option<Self> {
        if trace.get("type").and_then(Value::as_str) != Some("audio") {
            return None;
        }
        let payload = trace.get("payload")?;
        if let Some(src) = payload
            .get("audio")
            .and_then(|audio| audio.get("src"))
            .and_then(Value::as_str)
            .filter(|src| !src.is_empty())
        {
            return Some(AudioArtifact::Url(src.to_string()));
        }

        let content = payload.get("content").and_then(Value::as_str)?;
        let encoding = payload
            .get("encoding")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_AUDIO_ENCODING);
        // Tolerate a data-URL prefix.
        let raw = content
            .split_once(";base64,")
            .map_or(content, |(_, data)| data);
        match base64::engine::general_purpose::STANDARD.decode(raw) {
            Ok(bytes) if !bytes.is_empty() => Some(AudioArtifact::Inline {
                encoding: encoding.to_string(),
                bytes,
            }),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Discarding audio trace with undecodable content");
                None
            }
        }
    }

    /// Best guess at the playback length when the sink reports none.
    pub fn estimated_duration(&self) -> Duration {
        match self {
            AudioArtifact::Url(_) => URL_DURATION_GUESS,
            AudioArtifact::Inline { bytes, .. } => {
                Duration::from_secs_f64(bytes.len() as f64 / ESTIMATED_BYTES_PER_SECOND)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("audio could not be decoded: {0}")]
    Decode(String),
    #[error("audio output failed: {0}")]
    Output(String),
    #[error("playback stopped")]
    Stopped,
}

/// An audio output able to play one artifact at a time.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Plays `artifact`, resolving when playback ends or fails.
    async fn play(&self, artifact: &AudioArtifact) -> Result<(), PlaybackError>;

    /// The artifact's length, when the sink can determine it.
    async fn duration(&self, artifact: &AudioArtifact) -> Option<Duration>;

    /// Releases whatever is playing. A no-op when idle.
    fn stop(&self);
}
