//! Defines the JSON envelope exchanged between the client and the relay.
//!
//! Every message on the wire is `{event, data?, id?}`. The relay parses
//! inbound envelopes into [`ClientCommand`]s and emits [`ServerEvent`]s; the
//! client does the reverse.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// The raw wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Envelope {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: None,
            id: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }
}

/// Reasons an inbound client message is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Missing event type")]
    MissingEvent,
    #[error("Missing userID or text")]
    MissingCommandFields,
    #[error("Unknown event type: {0}")]
    UnknownEvent(String),
}

/// Commands a client may send to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Start the conversation. `user_id` overrides the relay default.
    Launch { user_id: Option<String> },
    /// Run a turn with the user's utterance.
    CommandStream { user_id: String, text: String },
    /// Cancel the in-flight turn, if any.
    Cancel,
}

impl ClientCommand {
    /// Parses one inbound text message.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let envelope: Value = serde_json::from_str(raw).map_err(|_| ProtocolError::InvalidJson)?;
        let event = envelope
            .get("event")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .ok_or(ProtocolError::MissingEvent)?;
        let data = envelope.get("data").unwrap_or(&Value::Null);

        match event {
            "launch" => Ok(ClientCommand::Launch {
                user_id: non_empty_str(data, "userID"),
            }),
            "commandStream" => {
                match (non_empty_str(data, "userID"), non_empty_str(data, "text")) {
                    (Some(user_id), Some(text)) => Ok(ClientCommand::CommandStream { user_id, text }),
                    _ => Err(ProtocolError::MissingCommandFields),
                }
            }
            "cancel" => Ok(ClientCommand::Cancel),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        match self {
            ClientCommand::Launch { user_id } => {
                let data = match user_id {
                    Some(id) => json!({ "userID": id }),
                    None => json!({}),
                };
                Envelope::new("launch").with_data(data)
            }
            ClientCommand::CommandStream { user_id, text } => Envelope::new("commandStream")
                .with_data(json!({ "userID": user_id, "text": text })),
            ClientCommand::Cancel => Envelope::new("cancel"),
        }
    }
}

fn non_empty_str(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Events the relay pushes to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A normalized upstream trace, with audio already reassembled.
    Trace { id: Option<String>, data: Value },
    /// The turn completed.
    ResponseDone,
    /// A turn-ending or protocol failure.
    Error { message: String },
    ButtonDown,
    ButtonUp,
    /// Any other upstream event, forwarded unchanged.
    Upstream {
        event: String,
        id: Option<String>,
        data: Value,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        match self {
            ServerEvent::Trace { id, data } => Envelope::new("trace")
                .with_data(data.clone())
                .with_id(id.clone()),
            ServerEvent::ResponseDone => Envelope::new("responseDone"),
            ServerEvent::Error { message } => {
                Envelope::new("error").with_data(Value::String(message.clone()))
            }
            ServerEvent::ButtonDown => Envelope::new("buttonDown"),
            ServerEvent::ButtonUp => Envelope::new("buttonUp"),
            ServerEvent::Upstream { event, id, data } => Envelope::new(event.clone())
                .with_data(data.clone())
                .with_id(id.clone()),
        }
    }

    pub fn from_envelope(envelope: Envelope) -> Self {
        let Envelope { event, data, id } = envelope;
        match event.as_str() {
            "trace" => ServerEvent::Trace {
                id,
                data: data.unwrap_or(Value::Null),
            },
            "responseDone" => ServerEvent::ResponseDone,
            "error" => ServerEvent::Error {
                message: match data {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
            },
            "buttonDown" => ServerEvent::ButtonDown,
            "buttonUp" => ServerEvent::ButtonUp,
            _ => ServerEvent::Upstream {
                event,
                id,
                data: data.unwrap_or(Value::Null),
            },
        }
    }
}
