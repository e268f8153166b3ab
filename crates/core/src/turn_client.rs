//! Turn Streaming Client
//!
//! Opens one streaming HTTP request per dialogue turn and turns the
//! `text/event-stream` response into a stream of [`NormalizedEvent`]s.
//!
//! The stream is cooperative about cancellation: it checks the turn's
//! [`CancellationToken`] before every read and before handing out every
//! buffered event. Once the upstream body has drained, the remaining events
//! are delivered even if cancellation arrives afterwards, so a turn ends
//! either cancelled or complete, never both.

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::{Event, EventStream, EventStreamError, Eventsource};
use futures::Stream;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that end a turn.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// The upstream answered with a non-success status before any data.
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    /// The request could not be sent or the response headers never arrived.
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The response body broke off mid-stream.
    #[error("upstream stream interrupted: {0}")]
    Interrupted(String),
    /// The turn was cancelled before the upstream answered.
    #[error("turn cancelled")]
    Cancelled,
}

impl TurnError {
    /// Whether this error is the quiet outcome of a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TurnError::Cancelled)
    }
}

/// The action a turn asks the dialogue engine to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TurnAction {
    /// Start (or restart) the conversation.
    Launch,
    /// Send a user utterance.
    Text { payload: String },
}

/// The JSON body POSTed for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnRequest {
    pub action: TurnAction,
}

impl TurnRequest {
    pub fn launch() -> Self {
        Self {
            action: TurnAction::Launch,
        }
    }

    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            action: TurnAction::Text {
                payload: payload.into(),
            },
        }
    }
}

/// One upstream frame after decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    /// Event name, `"message"` when the frame had none.
    pub kind: String,
    pub id: Option<String>,
    /// Structured payload when the data parsed as JSON, otherwise the raw
    /// string. `Null` when the frame carried no data.
    pub data: Value,
}

impl NormalizedEvent {
    pub fn from_event(event: Event) -> Self {
        let data = if event.data.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&event.data).unwrap_or(Value::String(event.data))
        };
        let kind = if event.event.is_empty() {
            "message".to_string()
        } else {
            event.event
        };
        Self {
            kind,
            id: (!event.id.is_empty()).then_some(event.id),
            data,
        }
    }
}

/// A stream of normalized events. A single `Err` item is terminal.
pub type TurnEventStream = Pin<Box<dyn Stream<Item = Result<NormalizedEvent, TurnError>> + Send>>;

/// A client able to run streaming turns against the dialogue engine.
#[async_trait]
pub trait TurnStream: Send + Sync {
    /// Opens a turn for `user_id`.
    ///
    /// Fails synchronously when the upstream rejects the request. The
    /// returned stream stops promptly once `cancel` fires.
    async fn open_turn(
        &self,
        user_id: &str,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnEventStream, TurnError>;
}

type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TurnError>> + Send>>;

struct StreamState {
    events: EventStream<BodyStream>,
    cancel: CancellationToken,
    /// Set once the body has ended; frames still buffered are then delivered
    /// regardless of cancellation.
    drained: Arc<AtomicBool>,
    done: bool,
    frames: usize,
}

/// Wraps a raw response body into a cancellable [`TurnEventStream`].
pub fn event_stream<S>(body: S, cancel: CancellationToken) -> TurnEventStream
where
    S: Stream<Item = Result<Bytes, TurnError>> + Send + 'static,
{
    let drained = Arc::new(AtomicBool::new(false));
    let flag = drained.clone();
    let body: BodyStream = Box::pin(body.chain(futures_util::stream::poll_fn(move |_| {
        flag.store(true, Ordering::SeqCst);
        Poll::Ready(None)
    })));
    let state = StreamState {
        events: body.eventsource(),
        cancel,
        drained,
        done: false,
        frames: 0,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if st.done {
                return None;
            }
            let drained = st.drained.load(Ordering::SeqCst);
            if !drained && st.cancel.is_cancelled() {
                st.done = true;
                debug!(frames = st.frames, "Turn stream cancelled");
                return None;
            }

            tokio::select! {
                biased;
                _ = st.cancel.cancelled(), if !drained => {}
                next = st.events.next() => match next {
                    Some(Ok(event)) => {
                        st.frames += 1;
                        return Some((Ok(NormalizedEvent::from_event(event)), st));
                    }
                    Some(Err(EventStreamError::Transport(e))) => {
                        st.done = true;
                        if st.cancel.is_cancelled() {
                            return None;
                        }
                        warn!(error = %e, frames = st.frames, "Turn stream failed");
                        return Some((Err(e), st));
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Dropping undecodable frame");
                    }
                    None => {
                        st.done = true;
                        debug!(frames = st.frames, "Turn stream ended");
                        return None;
                    }
                },
            }
        }
    }))
}

/// [`TurnStream`] implementation for the hosted dialogue runtime.
pub struct DialogueClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    api_key: String,
}

impl DialogueClient {
    /// Creates a client for one project on the dialogue runtime.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Runtime origin, e.g. `https://general-runtime.voiceflow.com`.
    /// * `project_id` - The project whose dialogue is run.
    /// * `api_key` - Sent verbatim in the `Authorization` header.
    pub fn new(
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            api_key: api_key.into(),
        }
    }

    fn turn_url(&self, user_id: &str) -> String {
        format!(
            "{}/v2/project/{}/user/{}/interact/stream?audio_events=true&completion_events=true",
            self.base_url, self.project_id, user_id
        )
    }
}

#[async_trait]
impl TurnStream for DialogueClient {
    async fn open_turn(
        &self,
        user_id: &str,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnEventStream, TurnError> {
        let url = self.turn_url(user_id);
        info!(%url, action = ?request.action, "Opening turn stream");

        let send = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, &self.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            response = send => response?,
        };

        let status = response.status();
        debug!(status = status.as_u16(), content_type = ?response.headers().get(reqwest::header::CONTENT_TYPE), "Turn stream response");
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TurnError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TurnError::Interrupted(e.to_string())));
        Ok(event_stream(body, cancel))
    }
}
