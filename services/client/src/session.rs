//! Coordinates one client's interaction with the relay.
//!
//! [`InteractionSession`] owns the state machine, the capture and playback
//! controllers and the per-turn bookkeeping. All inputs (local controls,
//! relay events and playback settlements) are handled one at a time from a
//! single select loop, so the bookkeeping needs no locking.
//!
//! Relay events carry no turn id. A barge-in sets `cancel_requested`, which
//! drops the interrupted turn's output until the next command is sent. Output
//! of the interrupted turn that is still in flight once that command is sent
//! is counted against the new turn, and a stale `responseDone` arriving then
//! can end the new turn early. The relay stops forwarding a turn as soon as
//! it sees the cancel, so the window is one relay round trip wide. The same
//! holds after a barge-in that ends in Standby because nothing was heard.
//!
//! A turn whose relay goes quiet is ended after [`TURN_IDLE_TIMEOUT`]
//! without output, so the session cannot stay in Response indefinitely.

use crate::capability::{AudioArtifact, MicKeepAlive};
use crate::playback::{PlaybackController, PlaybackSettled, QueuedAudio, spawn_queue};
use crate::recognition::{COMMAND_ALTERNATIVES, RecognitionController, WakeLoop};
use crate::transport::{RelayInbound, RelaySender};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use voxrelay_core::fsm::{Dispatcher, Event, InteractionState, Transition};
use voxrelay_core::protocol::{ClientCommand, ServerEvent};
use voxrelay_core::wakeword::TriggerSet;

/// How long a turn may go without relay output before it is ended.
pub const TURN_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Inputs that originate on the client side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalInput {
    Start,
    Exit,
    Press,
    Release,
    /// The wake-word loop heard a trigger phrase.
    WakeWord(String),
    /// A one-shot command capture completed.
    Utterance {
        generation: u64,
        transcript: Option<String>,
    },
}

/// Why [`InteractionSession::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Per-turn bookkeeping.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Incremented for every command sent; the launch turn is 0.
    pub turn: u64,
    /// Set by a barge-in; drops whatever the interrupted turn still sends.
    pub cancel_requested: bool,
    /// The current turn has not reported completion yet.
    pub awaiting_done: bool,
    /// Artifacts queued for the current turn that have not settled.
    pub pending_playbacks: usize,
    /// `Finish` was already dispatched for the current turn.
    pub finish_sent: bool,
}

impl SessionContext {
    fn begin_turn(&mut self) -> u64 {
        self.turn += 1;
        self.cancel_requested = false;
        self.awaiting_done = true;
        self.pending_playbacks = 0;
        self.finish_sent = false;
        self.turn
    }
}

/// Static settings for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub user_id: String,
    pub wake_word: bool,
    pub triggers: TriggerSet,
}

pub struct InteractionSession {
    settings: SessionSettings,
    dispatcher: Dispatcher,
    recognition: RecognitionController,
    playback: PlaybackController,
    keepalive: Arc<dyn MicKeepAlive>,
    relay: RelaySender,
    ctx: SessionContext,
    queue_tx: mpsc::UnboundedSender<QueuedAudio>,
    settled_rx: mpsc::UnboundedReceiver<PlaybackSettled>,
    queue_task: JoinHandle<()>,
    local_tx: mpsc::UnboundedSender<LocalInput>,
    local_rx: mpsc::UnboundedReceiver<LocalInput>,
    wake_tx: mpsc::UnboundedSender<String>,
    wake_rx: mpsc::UnboundedReceiver<String>,
    wake_loop: Option<WakeLoop>,
    turn_deadline: Option<Instant>,
}

impl InteractionSession {
    pub fn new(
        settings: SessionSettings,
        dispatcher: Dispatcher,
        recognition: RecognitionController,
        playback: PlaybackController,
        keepalive: Arc<dyn MicKeepAlive>,
        relay: RelaySender,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        let queue_task = spawn_queue(playback.clone(), queue_rx, settled_tx);
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            dispatcher,
            recognition,
            playback,
            keepalive,
            relay,
            ctx: SessionContext::default(),
            queue_tx,
            settled_rx,
            queue_task,
            local_tx,
            local_rx,
            wake_tx,
            wake_rx,
            wake_loop: None,
            turn_deadline: None,
        }
    }

    /// A handle for feeding local controls into the session.
    pub fn controls(&self) -> mpsc::UnboundedSender<LocalInput> {
        self.local_tx.clone()
    }

    pub fn state(&self) -> InteractionState {
        self.dispatcher.state()
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Runs until `shutdown` fires or the relay link drops.
    pub async fn run(
        mut self,
        mut relay: mpsc::UnboundedReceiver<RelayInbound>,
        shutdown: CancellationToken,
    ) -> SessionEnd {
        let end = loop {
            let deadline = self.turn_deadline;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                Some(input) = self.local_rx.recv() => self.handle_local(input).await,
                Some(phrase) = self.wake_rx.recv() => self.handle_local(LocalInput::WakeWord(phrase)).await,
                Some(settled) = self.settled_rx.recv() => self.handle_settled(settled).await,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_turn_timeout().await;
                }
                inbound = relay.recv() => match inbound {
                    Some(RelayInbound::Event(event)) => self.handle_relay(event).await,
                    Some(RelayInbound::Disconnected) | None => {
                        warn!("Relay link lost");
                        self.fire(Event::Error).await;
                        break SessionEnd::Disconnected;
                    }
                },
            }
        };
        self.teardown().await;
        end
    }

    /// Applies `event` and any follow-up events its side effects produce.
    async fn fire(&mut self, event: Event) -> InteractionState {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            let previous = self.dispatcher.state();
            let next = self.dispatcher.dispatch(event);
            if next != previous
                && let Some(follow_up) = self
                    .on_transition(Transition {
                        next,
                        previous,
                        event,
                    })
                    .await
            {
                pending.push_back(follow_up);
            }
        }
        self.dispatcher.state()
    }

    /// Side effects of entering and leaving states.
    async fn on_transition(&mut self, change: Transition) -> Option<Event> {
        if change.previous == InteractionState::Standby {
            self.stop_wake_loop();
        }
        if change.previous == InteractionState::Response {
            self.turn_deadline = None;
        }
        match change.next {
            InteractionState::Initializing => {
                if let Err(e) = self.keepalive.start().await {
                    warn!(error = %e, "Mic keep-alive failed to start");
                }
                self.ctx = SessionContext::default();
                let launch = ClientCommand::Launch {
                    user_id: Some(self.settings.user_id.clone()),
                };
                match self.relay.send(launch) {
                    Ok(()) => {
                        info!("Launch sent");
                        Some(Event::Launched)
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to send launch");
                        Some(Event::Error)
                    }
                }
            }
            InteractionState::Standby => {
                // Nothing from an interrupted turn is expected any more.
                self.ctx.cancel_requested = false;
                self.start_wake_loop();
                None
            }
            InteractionState::Off => {
                self.recognition.abort();
                self.playback.stop_current_audio();
                self.keepalive.stop().await;
                None
            }
            InteractionState::Listening | InteractionState::Response => None,
        }
    }

    fn start_wake_loop(&mut self) {
        if !self.settings.wake_word {
            return;
        }
        if let Some(wake) = self
            .recognition
            .spawn_wake_loop(self.settings.triggers.clone(), self.wake_tx.clone())
        {
            self.wake_loop = Some(wake);
        }
    }

    fn stop_wake_loop(&mut self) {
        if let Some(wake) = self.wake_loop.take() {
            wake.stop();
        }
    }

    pub(crate) async fn handle_local(&mut self, input: LocalInput) {
        debug!(?input, state = %self.state(), "Local input");
        match input {
            LocalInput::Start => {
                self.fire(Event::Start).await;
            }
            LocalInput::Exit => {
                if self.state() == InteractionState::Response {
                    self.send_cancel();
                }
                self.fire(Event::Exit).await;
            }
            LocalInput::Press => self.press().await,
            LocalInput::Release => self.release().await,
            LocalInput::WakeWord(phrase) => {
                if self.state() != InteractionState::Standby {
                    debug!(%phrase, "Ignoring wake word outside standby");
                    return;
                }
                self.playback.stop_current_audio();
                self.fire(Event::Press).await;
                self.capture_command();
            }
            LocalInput::Utterance {
                generation,
                transcript,
            } => {
                if self.state() != InteractionState::Listening
                    || self.recognition.generation() != generation
                {
                    debug!(generation, "Ignoring superseded utterance");
                    return;
                }
                self.submit(transcript).await;
            }
        }
    }

    /// Captures one command utterance in the background.
    fn capture_command(&self) {
        let recognition = self.recognition.clone();
        let local = self.local_tx.clone();
        tokio::spawn(
            async move {
                let result = recognition.recognize_once(COMMAND_ALTERNATIVES, None).await;
                let _ = local.send(LocalInput::Utterance {
                    generation: result.generation,
                    transcript: result.transcript(),
                });
            }
            .in_current_span(),
        );
    }

    async fn press(&mut self) {
        match self.state() {
            InteractionState::Response => {
                info!(turn = self.ctx.turn, "Barge-in");
                self.playback.stop_current_audio();
                self.send_cancel();
                self.ctx.cancel_requested = true;
                self.fire(Event::Press).await;
                self.recognition.start_buffered();
            }
            InteractionState::Standby => {
                self.playback.stop_current_audio();
                self.fire(Event::Press).await;
                self.recognition.start_buffered();
            }
            InteractionState::Listening => {
                // Re-entering Listening does not notify observers.
                self.fire(Event::Press).await;
                self.recognition.start_buffered();
            }
            InteractionState::Off | InteractionState::Initializing => {
                self.fire(Event::Press).await;
            }
        }
    }

    async fn release(&mut self) {
        if self.state() != InteractionState::Listening {
            self.fire(Event::Release).await;
            return;
        }
        let transcript = self.recognition.stop_buffered().await;
        self.submit(transcript).await;
    }

    /// Moves to Response and sends the command, or falls back to Standby
    /// when nothing was heard.
    async fn submit(&mut self, transcript: Option<String>) {
        self.fire(Event::Release).await;
        let Some(text) = transcript else {
            info!("No command heard");
            self.fire(Event::Cancel).await;
            return;
        };

        let turn = self.ctx.begin_turn();
        self.turn_deadline = Some(Instant::now() + TURN_IDLE_TIMEOUT);
        info!(turn, %text, "Sending command");
        let command = ClientCommand::CommandStream {
            user_id: self.settings.user_id.clone(),
            text,
        };
        if let Err(e) = self.relay.send(command) {
            error!(error = %e, "Failed to send command");
            self.fire(Event::Error).await;
        }
    }

    fn send_cancel(&self) {
        if let Err(e) = self.relay.send(ClientCommand::Cancel) {
            warn!(error = %e, "Failed to send cancel");
        }
    }

    /// Whether relay output for the current turn should be acted on.
    fn accepting(&self) -> bool {
        !self.ctx.cancel_requested
            && matches!(
                self.state(),
                InteractionState::Standby | InteractionState::Response
            )
    }

    pub(crate) async fn handle_relay(&mut self, event: ServerEvent) {
        if matches!(event, ServerEvent::Trace { .. } | ServerEvent::Upstream { .. })
            && self.turn_deadline.is_some()
            && self.accepting()
        {
            self.turn_deadline = Some(Instant::now() + TURN_IDLE_TIMEOUT);
        }
        match event {
            ServerEvent::ButtonDown => self.press().await,
            ServerEvent::ButtonUp => self.release().await,
            ServerEvent::Trace { data, .. } => {
                if !self.accepting() {
                    debug!("Dropping trace from an interrupted turn");
                    return;
                }
                if let Some(message) = data
                    .get("payload")
                    .and_then(|p| p.get("message"))
                    .and_then(|m| m.as_str())
                {
                    info!(turn = self.ctx.turn, "Assistant: {}", message);
                }
                if let Some(artifact) = AudioArtifact::from_trace(&data) {
                    self.enqueue(artifact);
                }
            }
            ServerEvent::ResponseDone => {
                if self.ctx.cancel_requested {
                    debug!("Dropping completion of an interrupted turn");
                    return;
                }
                self.ctx.awaiting_done = false;
                self.maybe_finish().await;
            }
            ServerEvent::Error { message } => {
                warn!(%message, "Relay reported an error");
                match self.state() {
                    InteractionState::Initializing => {
                        self.fire(Event::Error).await;
                    }
                    InteractionState::Response if !self.ctx.cancel_requested => {
                        self.ctx.awaiting_done = false;
                        self.maybe_finish().await;
                    }
                    _ => {}
                }
            }
            ServerEvent::Upstream { event, .. } => {
                debug!(%event, "Unhandled relay event");
            }
        }
    }

    /// Ends a turn whose relay stopped sending before it completed.
    async fn handle_turn_timeout(&mut self) {
        self.turn_deadline = None;
        if self.state() != InteractionState::Response
            || self.ctx.cancel_requested
            || !self.ctx.awaiting_done
        {
            return;
        }
        warn!(turn = self.ctx.turn, timeout = ?TURN_IDLE_TIMEOUT, "Relay went quiet; ending turn");
        self.ctx.awaiting_done = false;
        self.maybe_finish().await;
    }

    fn enqueue(&mut self, artifact: AudioArtifact) {
        self.ctx.pending_playbacks += 1;
        let item = QueuedAudio {
            turn: self.ctx.turn,
            artifact,
            token: self.playback.token(),
        };
        debug!(turn = item.turn, pending = self.ctx.pending_playbacks, "Queued audio");
        if self.queue_tx.send(item).is_err() {
            warn!("Playback queue is gone");
            self.ctx.pending_playbacks -= 1;
        }
    }

    pub(crate) async fn handle_settled(&mut self, settled: PlaybackSettled) {
        if settled.turn != self.ctx.turn {
            return;
        }
        self.ctx.pending_playbacks = self.ctx.pending_playbacks.saturating_sub(1);
        if settled.outcome.is_stale() {
            debug!(turn = settled.turn, "Interrupted playback settled");
            return;
        }
        self.maybe_finish().await;
    }

    /// Dispatches `Finish` once the turn is done and its audio has settled.
    async fn maybe_finish(&mut self) {
        let ctx = &self.ctx;
        if self.state() != InteractionState::Response
            || ctx.cancel_requested
            || ctx.awaiting_done
            || ctx.pending_playbacks > 0
            || ctx.finish_sent
        {
            return;
        }
        self.ctx.finish_sent = true;
        info!(turn = self.ctx.turn, "Turn finished");
        self.fire(Event::Finish).await;
    }

    async fn teardown(&mut self) {
        self.stop_wake_loop();
        self.recognition.abort();
        if self.state() != InteractionState::Off {
            self.fire(Event::Exit).await;
        }
        self.queue_task.abort();
    }
}

/// Spawns a session on its own span and returns its join handle.
pub fn spawn(
    session: InteractionSession,
    relay: mpsc::UnboundedReceiver<RelayInbound>,
    shutdown: CancellationToken,
) -> JoinHandle<SessionEnd> {
    let span = tracing::info_span!("interaction", user_id = %session.settings.user_id);
    tokio::spawn(session.run(relay, shutdown).instrument(span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        AudioSink, CaptureError, ListenMode, MockMicKeepAlive, PlaybackError, SpeechCapture,
    };
    use crate::transport::relay_channel;
    use async_trait::async_trait;
    use base64::Engine;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Buffered captures report the scripted transcript when finished;
    /// utterance captures report it right away.
    struct ScriptedCapture {
        transcript: Mutex<String>,
    }

    #[async_trait]
    impl SpeechCapture for ScriptedCapture {
        async fn listen(
            &self,
            mode: ListenMode,
            finish: CancellationToken,
        ) -> Result<Vec<String>, CaptureError> {
            if mode == ListenMode::Buffered {
                finish.cancelled().await;
            }
            let transcript = self.transcript.lock().unwrap().clone();
            if transcript.is_empty() {
                Err(CaptureError::NoSpeech)
            } else {
                Ok(vec![transcript])
            }
        }
    }

    /// Plays until stopped or until the test signals `done`.
    struct ManualSink {
        done: Notify,
        stopped: Notify,
    }

    #[async_trait]
    impl AudioSink for ManualSink {
        async fn play(&self, _artifact: &AudioArtifact) -> Result<(), PlaybackError> {
            tokio::select! {
                _ = self.done.notified() => Ok(()),
                _ = self.stopped.notified() => Err(PlaybackError::Stopped),
            }
        }

        async fn duration(&self, _artifact: &AudioArtifact) -> Option<Duration> {
            Some(Duration::from_secs(60))
        }

        fn stop(&self) {
            self.stopped.notify_waiters();
        }
    }

    struct Harness {
        session: InteractionSession,
        sent: mpsc::UnboundedReceiver<ClientCommand>,
        capture: Arc<ScriptedCapture>,
        sink: Arc<ManualSink>,
        seen: Arc<Mutex<Vec<Transition>>>,
    }

    impl Harness {
        fn new(transcript: &str) -> Self {
            let mut keepalive = MockMicKeepAlive::new();
            keepalive.expect_start().returning(|| Ok(()));
            keepalive.expect_stop().returning(|| ());
            Self::with_keepalive(transcript, keepalive)
        }

        fn with_keepalive(transcript: &str, keepalive: MockMicKeepAlive) -> Self {
            let capture = Arc::new(ScriptedCapture {
                transcript: Mutex::new(transcript.to_string()),
            });
            let sink = Arc::new(ManualSink {
                done: Notify::new(),
                stopped: Notify::new(),
            });
            let (relay, sent) = relay_channel();
            let dispatcher = Dispatcher::new();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let log = seen.clone();
            dispatcher.subscribe(move |t| log.lock().unwrap().push(t));

            let session = InteractionSession::new(
                SessionSettings {
                    user_id: "kiosk".into(),
                    wake_word: false,
                    triggers: TriggerSet::default(),
                },
                dispatcher,
                RecognitionController::new(capture.clone()),
                PlaybackController::new(sink.clone()),
                Arc::new(keepalive),
                relay,
            );
            Self {
                session,
                sent,
                capture,
                sink,
                seen,
            }
        }

        fn sent(&mut self) -> Vec<ClientCommand> {
            let mut out = Vec::new();
            while let Ok(command) = self.sent.try_recv() {
                out.push(command);
            }
            out
        }

        async fn to_standby(&mut self) {
            self.session.handle_local(LocalInput::Start).await;
            assert_eq!(self.session.state(), InteractionState::Standby);
            self.sent();
        }

        async fn to_response(&mut self) {
            self.to_standby().await;
            self.session.handle_local(LocalInput::Press).await;
            self.session.handle_local(LocalInput::Release).await;
            assert_eq!(self.session.state(), InteractionState::Response);
            self.sent();
        }

        async fn settle_next(&mut self) -> PlaybackSettled {
            let settled = self.session.settled_rx.recv().await.unwrap();
            self.session.handle_settled(settled).await;
            settled
        }
    }

    fn audio_trace(bytes: &[u8]) -> ServerEvent {
        ServerEvent::Trace {
            id: None,
            data: json!({
                "type": "audio",
                "payload": {
                    "encoding": "audio/mp3",
                    "content": base64::engine::general_purpose::STANDARD.encode(bytes)
                }
            }),
        }
    }

    #[tokio::test]
    async fn test_start_sends_launch_and_reaches_standby() {
        let mut keepalive = MockMicKeepAlive::new();
        keepalive.expect_start().times(1).returning(|| Ok(()));
        keepalive.expect_stop().times(1).returning(|| ());
        let mut h = Harness::with_keepalive("", keepalive);

        h.session.handle_local(LocalInput::Start).await;
        assert_eq!(h.session.state(), InteractionState::Standby);
        assert_eq!(
            h.sent(),
            vec![ClientCommand::Launch {
                user_id: Some("kiosk".into())
            }]
        );

        h.session.handle_local(LocalInput::Exit).await;
        assert_eq!(h.session.state(), InteractionState::Off);
        let states: Vec<_> = h.seen.lock().unwrap().iter().map(|t| t.next).collect();
        assert_eq!(
            states,
            vec![
                InteractionState::Initializing,
                InteractionState::Standby,
                InteractionState::Off
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_launch_returns_to_off() {
        let mut h = Harness::new("");
        let (closed, rx) = relay_channel();
        drop(rx);
        h.session.relay = closed;

        h.session.handle_local(LocalInput::Start).await;
        assert_eq!(h.session.state(), InteractionState::Off);
    }

    #[tokio::test]
    async fn test_press_release_sends_command() {
        let mut h = Harness::new("Lights On");
        h.to_standby().await;

        h.session.handle_local(LocalInput::Press).await;
        assert_eq!(h.session.state(), InteractionState::Listening);
        h.session.handle_local(LocalInput::Release).await;
        assert_eq!(h.session.state(), InteractionState::Response);
        assert_eq!(
            h.sent(),
            vec![ClientCommand::CommandStream {
                user_id: "kiosk".into(),
                text: "lights on".into()
            }]
        );
        assert_eq!(h.session.context().turn, 1);
        assert!(h.session.context().awaiting_done);
    }

    #[tokio::test]
    async fn test_release_without_transcript_returns_to_standby() {
        let mut h = Harness::new("");
        h.to_standby().await;

        h.session.handle_local(LocalInput::Press).await;
        h.session.handle_local(LocalInput::Release).await;
        assert_eq!(h.session.state(), InteractionState::Standby);
        assert!(h.sent().is_empty());

        let path: Vec<_> = h.seen.lock().unwrap().iter().map(|t| t.event).collect();
        assert_eq!(
            &path[path.len() - 3..],
            &[Event::Press, Event::Release, Event::Cancel]
        );
    }

    #[tokio::test]
    async fn test_press_in_listening_does_not_notify() {
        let mut h = Harness::new("hi");
        h.to_standby().await;
        h.session.handle_local(LocalInput::Press).await;
        let before = h.seen.lock().unwrap().len();
        h.session.handle_local(LocalInput::Press).await;
        assert_eq!(h.session.state(), InteractionState::Listening);
        assert_eq!(h.seen.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_response_done_without_audio_finishes_once() {
        let mut h = Harness::new("hello");
        h.to_response().await;

        h.session.handle_relay(ServerEvent::ResponseDone).await;
        assert_eq!(h.session.state(), InteractionState::Standby);
        assert!(h.session.context().finish_sent);

        let finishes = |h: &Harness| {
            h.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.event == Event::Finish)
                .count()
        };
        assert_eq!(finishes(&h), 1);
        h.session.handle_relay(ServerEvent::ResponseDone).await;
        assert_eq!(finishes(&h), 1);
    }

    #[tokio::test]
    async fn test_finish_waits_for_queued_audio() {
        let mut h = Harness::new("hello");
        h.to_response().await;

        h.session.handle_relay(audio_trace(b"AB")).await;
        assert_eq!(h.session.context().pending_playbacks, 1);
        h.session.handle_relay(ServerEvent::ResponseDone).await;
        // Audio still playing.
        assert_eq!(h.session.state(), InteractionState::Response);

        h.sink.done.notify_one();
        let settled = h.settle_next().await;
        assert_eq!(settled.outcome, crate::playback::PlaybackOutcome::Ended);
        assert_eq!(h.session.state(), InteractionState::Standby);
    }

    #[tokio::test]
    async fn test_barge_in_interrupts_and_ignores_stale_turn() {
        let mut h = Harness::new("hello");
        h.to_response().await;
        h.session.handle_relay(audio_trace(b"AB")).await;
        tokio::task::yield_now().await;

        *h.capture.transcript.lock().unwrap() = "stop".into();
        h.session.handle_local(LocalInput::Press).await;
        assert_eq!(h.session.state(), InteractionState::Listening);
        assert!(h.session.context().cancel_requested);
        assert_eq!(h.sent(), vec![ClientCommand::Cancel]);
        // One interruption for the first press, one for the barge-in.
        assert_eq!(h.session.playback.token(), 2);

        // The interrupted audio settles stale and cannot finish anything.
        let settled = h.settle_next().await;
        assert!(settled.outcome.is_stale());
        // Late output from the cancelled turn is dropped.
        h.session.handle_relay(audio_trace(b"CD")).await;
        h.session.handle_relay(ServerEvent::ResponseDone).await;
        assert_eq!(h.session.state(), InteractionState::Listening);
        assert_eq!(h.session.context().pending_playbacks, 0);

        h.session.handle_local(LocalInput::Release).await;
        assert_eq!(h.session.state(), InteractionState::Response);
        assert!(!h.session.context().cancel_requested);
        assert_eq!(h.session.context().turn, 2);
        assert_eq!(
            h.sent(),
            vec![ClientCommand::CommandStream {
                user_id: "kiosk".into(),
                text: "stop".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_relay_error_ends_turn() {
        let mut h = Harness::new("hello");
        h.to_response().await;
        h.session.handle_relay(ServerEvent::error("upstream returned 500")).await;
        assert_eq!(h.session.state(), InteractionState::Standby);
    }

    #[tokio::test]
    async fn test_button_edges_from_relay_drive_capture() {
        let mut h = Harness::new("weather");
        h.to_standby().await;
        h.session.handle_relay(ServerEvent::ButtonDown).await;
        assert_eq!(h.session.state(), InteractionState::Listening);
        h.session.handle_relay(ServerEvent::ButtonUp).await;
        assert_eq!(h.session.state(), InteractionState::Response);
        assert_eq!(h.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_wake_word_captures_one_command() {
        let mut h = Harness::new("what time is it");
        h.to_standby().await;

        h.session
            .handle_local(LocalInput::WakeWord("hey empyrean".into()))
            .await;
        assert_eq!(h.session.state(), InteractionState::Listening);

        let utterance = h.session.local_rx.recv().await.unwrap();
        h.session.handle_local(utterance).await;
        assert_eq!(h.session.state(), InteractionState::Response);
        assert_eq!(
            h.sent(),
            vec![ClientCommand::CommandStream {
                user_id: "kiosk".into(),
                text: "what time is it".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_superseded_utterance_is_ignored() {
        let mut h = Harness::new("hello");
        h.to_standby().await;
        h.session.handle_local(LocalInput::Press).await;

        h.session
            .handle_local(LocalInput::Utterance {
                generation: 0,
                transcript: Some("stale".into()),
            })
            .await;
        assert_eq!(h.session.state(), InteractionState::Listening);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_run_exits_on_disconnect() {
        let h = Harness::new("");
        let controls = h.session.controls();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let handle = spawn(h.session, relay_rx, CancellationToken::new());

        controls.send(LocalInput::Start).unwrap();
        relay_tx.send(RelayInbound::Disconnected).unwrap();
        assert_eq!(handle.await.unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new("");
        let (_relay_tx, relay_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = spawn(h.session, relay_rx, shutdown.clone());
        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_empty_barge_in_does_not_mute_standby() {
        let mut h = Harness::new("hello");
        h.to_response().await;
        assert!(h.session.turn_deadline.is_some());

        *h.capture.transcript.lock().unwrap() = String::new();
        h.session.handle_local(LocalInput::Press).await;
        assert!(h.session.context().cancel_requested);
        assert!(h.session.turn_deadline.is_none());
        h.session.handle_local(LocalInput::Release).await;
        assert_eq!(h.session.state(), InteractionState::Standby);
        assert!(!h.session.context().cancel_requested);

        h.session.handle_relay(audio_trace(b"AB")).await;
        assert_eq!(h.session.context().pending_playbacks, 1);
    }

    #[tokio::test]
    async fn test_timeout_after_completion_is_ignored() {
        let mut h = Harness::new("hello");
        h.to_response().await;
        h.session.handle_relay(audio_trace(b"AB")).await;
        h.session.handle_relay(ServerEvent::ResponseDone).await;

        h.session.handle_turn_timeout().await;
        // Still waiting on the queued audio.
        assert_eq!(h.session.state(), InteractionState::Response);
        assert!(h.session.turn_deadline.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_relay_still_returns_to_standby() {
        let h = Harness::new("hello");
        let seen = h.seen.clone();
        let controls = h.session.controls();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = spawn(h.session, relay_rx, shutdown.clone());

        controls.send(LocalInput::Start).unwrap();
        controls.send(LocalInput::Press).unwrap();
        controls.send(LocalInput::Release).unwrap();
        relay_tx
            .send(RelayInbound::Event(ServerEvent::Trace {
                id: None,
                data: json!({"type": "text", "payload": {"message": "hi"}}),
            }))
            .unwrap();

        tokio::time::sleep(TURN_IDLE_TIMEOUT / 2).await;
        assert_eq!(seen.lock().unwrap().last().map(|t| t.next), Some(InteractionState::Response));

        tokio::time::sleep(TURN_IDLE_TIMEOUT).await;
        let last = *seen.lock().unwrap().last().unwrap();
        assert_eq!(last.event, Event::Finish);
        assert_eq!(last.next, InteractionState::Standby);

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), SessionEnd::Shutdown);
        drop(h.sent);
    }
}
