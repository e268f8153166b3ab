//! Single-active speech capture.
//!
//! At most one capture runs at a time. Starting a capture aborts the
//! previous one first, and every capture carries a generation number so a
//! result that arrives after it was superseded can be recognized as stale.
//! Capability failures never escape: they resolve to "no transcript".

use crate::capability::{CaptureError, ListenMode, SpeechCapture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use voxrelay_core::wakeword::TriggerSet;

/// Hypotheses requested per wake-word pass.
pub const WAKE_ALTERNATIVES: usize = 5;
/// Hypotheses requested for the command that follows a wake word.
pub const COMMAND_ALTERNATIVES: usize = 1;
/// Pause between wake-word passes that heard nothing.
const WAKE_RETRY_DELAY: Duration = Duration::from_millis(250);

struct ActiveCapture {
    generation: u64,
    finish: CancellationToken,
    abort: CancellationToken,
    buffered: Option<JoinHandle<Option<String>>>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    active: Option<ActiveCapture>,
}

struct Inner {
    capture: Arc<dyn SpeechCapture>,
    slot: Mutex<Slot>,
    wake_running: Arc<AtomicBool>,
}

/// The outcome of a one-shot capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recognition {
    /// Generation of the capture that produced this result.
    pub generation: u64,
    /// Hypotheses, best first. Empty when nothing usable was heard.
    pub alternatives: Vec<String>,
}

impl Recognition {
    /// The best hypothesis, normalized, if any.
    pub fn transcript(&self) -> Option<String> {
        self.alternatives.first().and_then(|t| normalize(t))
    }
}

#[derive(Clone)]
pub struct RecognitionController {
    inner: Arc<Inner>,
}

impl RecognitionController {
    pub fn new(capture: Arc<dyn SpeechCapture>) -> Self {
        Self {
            inner: Arc::new(Inner {
                capture,
                slot: Mutex::new(Slot::default()),
                wake_running: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generation of the most recently started capture.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_active(&self) -> bool {
        self.lock().active.is_some()
    }

    /// Installs a new capture, aborting the current one. Returns `None` if
    /// `guard` was already cancelled, in which case nothing is touched.
    fn install(
        &self,
        guard: Option<&CancellationToken>,
    ) -> Option<(u64, CancellationToken, CancellationToken)> {
        let mut slot = self.lock();
        if guard.is_some_and(CancellationToken::is_cancelled) {
            return None;
        }
        if let Some(previous) = slot.active.take() {
            debug!(generation = previous.generation, "Aborting previous capture");
            previous.abort.cancel();
        }
        slot.generation += 1;
        let finish = CancellationToken::new();
        let abort = CancellationToken::new();
        slot.active = Some(ActiveCapture {
            generation: slot.generation,
            finish: finish.clone(),
            abort: abort.clone(),
            buffered: None,
        });
        Some((slot.generation, finish, abort))
    }

    fn clear(&self, generation: u64) {
        let mut slot = self.lock();
        if slot
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
        {
            slot.active = None;
        }
    }

    /// Starts a push-to-talk capture and returns its generation.
    pub fn start_buffered(&self) -> u64 {
        let Some((generation, finish, abort)) = self.install(None) else {
            return self.generation();
        };
        let capture = self.inner.capture.clone();
        let handle = tokio::spawn(
            async move {
                let result = tokio::select! {
                    biased;
                    _ = abort.cancelled() => return None,
                    result = capture.listen(ListenMode::Buffered, finish) => result,
                };
                absorb(result).first().and_then(|t| normalize(t))
            }
            .in_current_span(),
        );

        if let Some(active) = self.lock().active.as_mut()
            && active.generation == generation
        {
            active.buffered = Some(handle);
        }
        info!(generation, "Buffered capture started");
        generation
    }

    /// Stops the push-to-talk capture and returns what it heard.
    ///
    /// Returns `None` when no buffered capture is active, when it was
    /// aborted, or when it heard nothing.
    pub async fn stop_buffered(&self) -> Option<String> {
        let active = self.lock().active.take()?;
        let Some(handle) = active.buffered else {
            // A one-shot capture holds the slot; end it without a transcript.
            active.abort.cancel();
            return None;
        };
        active.finish.cancel();
        let transcript = handle.await.unwrap_or_else(|e| {
            warn!(error = %e, "Capture task failed");
            None
        });
        info!(generation = active.generation, ?transcript, "Buffered capture stopped");
        transcript
    }

    /// Aborts the active capture. A no-op when idle.
    pub fn abort(&self) {
        if let Some(active) = self.lock().active.take() {
            active.abort.cancel();
            debug!(generation = active.generation, "Capture aborted");
        }
    }

    /// Captures a single utterance.
    ///
    /// The capture ends early, with no alternatives, when it is aborted or
    /// superseded or when `guard` fires.
    pub async fn recognize_once(
        &self,
        max_alternatives: usize,
        guard: Option<&CancellationToken>,
    ) -> Recognition {
        let Some((generation, finish, abort)) = self.install(guard) else {
            return Recognition {
                generation: self.generation(),
                alternatives: Vec::new(),
            };
        };
        let never = CancellationToken::new();
        let guard = guard.unwrap_or(&never);

        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(CaptureError::Aborted),
            _ = guard.cancelled() => Err(CaptureError::Aborted),
            result = self.inner.capture.listen(ListenMode::Utterance { max_alternatives }, finish) => result,
        };
        self.clear(generation);

        let alternatives = absorb(result)
            .into_iter()
            .filter_map(|t| normalize(&t))
            .take(max_alternatives.max(1))
            .collect();
        Recognition {
            generation,
            alternatives,
        }
    }

    /// Starts the wake-word loop. Each pass captures one utterance and stops
    /// the loop on the first alternative that matches `triggers`, sending the
    /// matched text to `matched`.
    ///
    /// Returns `None` when a loop is already running.
    pub fn spawn_wake_loop(
        &self,
        triggers: TriggerSet,
        matched: mpsc::UnboundedSender<String>,
    ) -> Option<WakeLoop> {
        if self.inner.wake_running.swap(true, Ordering::SeqCst) {
            debug!("Wake-word loop already running");
            return None;
        }
        // Owned by the task future, so an abort before its first poll still
        // clears the flag.
        let running = RunningFlag(self.inner.wake_running.clone());
        let stop = CancellationToken::new();
        let controller = self.clone();
        let loop_stop = stop.clone();
        let handle = tokio::spawn(
            async move {
                let _running = running;
                info!("Wake-word loop started");
                let mut passes = 0u64;
                while !loop_stop.is_cancelled() {
                    passes += 1;
                    let recognition = controller
                        .recognize_once(WAKE_ALTERNATIVES, Some(&loop_stop))
                        .await;
                    if loop_stop.is_cancelled() {
                        break;
                    }
                    if let Some(phrase) = triggers.find_match(&recognition.alternatives) {
                        info!(%phrase, passes, "Wake word detected");
                        let _ = matched.send(phrase.to_string());
                        break;
                    }
                    if !recognition.alternatives.is_empty() {
                        debug!(heard = ?recognition.alternatives, "No wake word");
                    }
                    tokio::select! {
                        _ = loop_stop.cancelled() => break,
                        _ = tokio::time::sleep(WAKE_RETRY_DELAY) => {}
                    }
                }
                info!(passes, "Wake-word loop ended");
            }
            .in_current_span(),
        );
        Some(WakeLoop { stop, handle })
    }

    pub fn wake_loop_running(&self) -> bool {
        self.inner.wake_running.load(Ordering::SeqCst)
    }
}

/// Clears the re-entrancy flag when the wake loop task ends, however it ends.
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle to a running wake-word loop.
#[derive(Debug)]
pub struct WakeLoop {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl WakeLoop {
    /// Signals the loop to stop. Its in-flight capture ends with it.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}

fn normalize(text: &str) -> Option<String> {
    let text = text.trim().to_lowercase();
    (!text.is_empty()).then_some(text)
}

fn absorb(result: Result<Vec<String>, CaptureError>) -> Vec<String> {
    match result {
        Ok(alternatives) => alternatives,
        Err(CaptureError::NoSpeech | CaptureError::Aborted) => {
            debug!("Capture ended without speech");
            Vec::new()
        }
        Err(e) => {
            warn!(error = %e, "Capture failed");
            Vec::new()
        }
    }
}
