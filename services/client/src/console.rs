//! Console stand-ins for the device capabilities.
//!
//! Recognized speech is typed (`say <text>`), reply audio is spooled to disk
//! and handed to an external player, and the microphone keep-alive only logs.

use crate::capability::{
    AudioArtifact, AudioSink, CaptureError, ListenMode, MicKeepAlive, PlaybackError, SpeechCapture,
};
use crate::session::LocalInput;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One parsed line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleLine {
    Input(LocalInput),
    /// Text the capture stand-in should "hear".
    Say(String),
    Quit,
}

impl ConsoleLine {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        let parsed = match word.to_ascii_lowercase().as_str() {
            "start" => ConsoleLine::Input(LocalInput::Start),
            "exit" | "stop" => ConsoleLine::Input(LocalInput::Exit),
            "press" | "down" => ConsoleLine::Input(LocalInput::Press),
            "release" | "up" => ConsoleLine::Input(LocalInput::Release),
            "say" if !rest.trim().is_empty() => ConsoleLine::Say(rest.trim().to_string()),
            "quit" => ConsoleLine::Quit,
            _ => return None,
        };
        Some(parsed)
    }
}

/// Speech capture fed from typed lines.
///
/// An utterance capture takes the next line. A buffered capture collects
/// every line typed until it is finished.
#[derive(Debug, Default)]
pub struct ConsoleCapture {
    lines: Mutex<VecDeque<String>>,
    ready: Notify,
}

impl ConsoleCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, text: impl Into<String>) {
        self.lock().push_back(text.into());
        self.ready.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SpeechCapture for ConsoleCapture {
    async fn listen(
        &self,
        mode: ListenMode,
        finish: CancellationToken,
    ) -> Result<Vec<String>, CaptureError> {
        match mode {
            ListenMode::Buffered => {
                finish.cancelled().await;
                let heard: Vec<String> = self.lock().drain(..).collect();
                if heard.is_empty() {
                    Err(CaptureError::NoSpeech)
                } else {
                    Ok(vec![heard.join(" ")])
                }
            }
            ListenMode::Utterance { .. } => loop {
                let notified = self.ready.notified();
                let next = self.lock().pop_front();
                if let Some(line) = next {
                    return Ok(vec![line]);
                }
                tokio::select! {
                    _ = finish.cancelled() => return Err(CaptureError::NoSpeech),
                    _ = notified => {}
                }
            },
        }
    }
}

/// Writes reply audio to a spool directory and plays it with an external
/// command.
pub struct SpoolPlayer {
    spool_dir: PathBuf,
    player: Option<Vec<String>>,
    current: Mutex<CancellationToken>,
    counter: AtomicU64,
}

impl SpoolPlayer {
    /// `player` is split on whitespace; the audio path or URL is appended.
    pub fn new(spool_dir: impl Into<PathBuf>, player: Option<&str>) -> std::io::Result<Self> {
        let spool_dir = spool_dir.into();
        std::fs::create_dir_all(&spool_dir)?;
        let player = player
            .map(|p| p.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty());
        Ok(Self {
            spool_dir,
            player,
            current: Mutex::new(CancellationToken::new()),
            counter: AtomicU64::new(0),
        })
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Replaces the stop token so a `stop` only affects playbacks already
    /// started.
    fn arm(&self) -> CancellationToken {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = CancellationToken::new();
        current.clone()
    }

    async fn target(&self, artifact: &AudioArtifact) -> Result<String, PlaybackError> {
        match artifact {
            AudioArtifact::Url(url) => Ok(url.clone()),
            AudioArtifact::Inline { encoding, bytes } => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                let path = self
                    .spool_dir
                    .join(format!("reply-{n:04}.{}", extension(encoding)));
                tokio::fs::write(&path, bytes)
                    .await
                    .map_err(|e| PlaybackError::Output(format!("{}: {e}", path.display())))?;
                debug!(path = %path.display(), bytes = bytes.len(), "Spooled reply audio");
                Ok(path.display().to_string())
            }
        }
    }
}

fn extension(encoding: &str) -> &str {
    match encoding.rsplit('/').next().unwrap_or_default() {
        "mp3" | "mpeg" => "mp3",
        "wav" | "x-wav" | "wave" => "wav",
        "ogg" => "ogg",
        "pcm" | "l16" => "pcm",
        _ => "bin",
    }
}

#[async_trait]
impl AudioSink for SpoolPlayer {
    async fn play(&self, artifact: &AudioArtifact) -> Result<(), PlaybackError> {
        let stop = self.arm();
        let target = self.target(artifact).await?;

        let Some((program, args)) = self.player.as_ref().and_then(|p| p.split_first()) else {
            info!(%target, "Reply audio ready");
            return tokio::select! {
                _ = stop.cancelled() => Err(PlaybackError::Stopped),
                _ = tokio::time::sleep(artifact.estimated_duration()) => Ok(()),
            };
        };

        let mut child = Command::new(program)
            .args(args)
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlaybackError::Output(format!("could not start {program}: {e}")))?;
        debug!(%program, %target, "Player started");

        tokio::select! {
            _ = stop.cancelled() => Err(PlaybackError::Stopped),
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(PlaybackError::Output(format!("{program} exited with {status}"))),
                Err(e) => Err(PlaybackError::Output(e.to_string())),
            },
        }
    }

    async fn duration(&self, _artifact: &AudioArtifact) -> Option<Duration> {
        None
    }

    fn stop(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

/// Keep-alive that only records whether the microphone would be held open.
#[derive(Debug, Default)]
pub struct LoggingKeepAlive {
    active: AtomicBool,
}

impl LoggingKeepAlive {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MicKeepAlive for LoggingKeepAlive {
    async fn start(&self) -> Result<(), CaptureError> {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!("Microphone keep-alive started");
        }
        Ok(())
    }

    async fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Microphone keep-alive stopped");
        }
    }
}
